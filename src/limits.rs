use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MIN_SLOT_STEP_MINUTES: u32 = 5;
pub const MAX_SLOT_STEP_MINUTES: u32 = 120;

/// A service (plus its buffers) must fit in one day.
pub const MAX_OCCUPIED_MINUTES: u32 = 24 * 60;

pub const MAX_BOOKING_HORIZON_DAYS: u32 = 3 * 366;

pub const MAX_CUSTOMER_ID_LEN: usize = 256;

/// Active bookings held by a single resource scope.
pub const MAX_BOOKINGS_PER_SCOPE: usize = 100_000;

/// Raw manage-token bytes (256 bits).
pub const MANAGE_TOKEN_BYTES: usize = 32;
/// Hex-encoded manage-token length.
pub const MANAGE_TOKEN_HEX_LEN: usize = MANAGE_TOKEN_BYTES * 2;

pub const MAX_LOCK_TIMEOUT_MS: u64 = 5_000;
