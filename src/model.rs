use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

pub type ServiceId = u32;
pub type AgentId = u32;

/// SHA-256 of a manage token. The clear token is never stored.
pub type TokenDigest = [u8; 32];

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Widen by dead time on either side.
    pub fn expand(&self, before: Ms, after: Ms) -> Span {
        Span::new(self.start - before, self.end + after)
    }
}

/// The unit capacity is enforced against. The two variants are independent
/// buckets: a booking for "any agent" never lands in an agent's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceScope {
    SpecificAgent(AgentId),
    AnyAgentForService(ServiceId),
}

impl ResourceScope {
    pub fn for_request(service_id: ServiceId, agent_id: Option<AgentId>) -> Self {
        match agent_id {
            Some(agent_id) => ResourceScope::SpecificAgent(agent_id),
            None => ResourceScope::AnyAgentForService(service_id),
        }
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            ResourceScope::SpecificAgent(id) => Some(*id),
            ResourceScope::AnyAgentForService(_) => None,
        }
    }
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceScope::SpecificAgent(id) => write!(f, "agent:{id}"),
            ResourceScope::AnyAgentForService(id) => write!(f, "service:{id}:any"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    PendingPayment,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Active bookings hold capacity.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::PendingPayment => "pending_payment",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "pending_payment" => Ok(BookingStatus::PendingPayment),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub service_id: ServiceId,
    /// `None` = booked against "any agent" for the service.
    pub agent_id: Option<AgentId>,
    pub customer_id: String,
    /// `[start, start + duration)`.
    pub span: Span,
    /// `span` widened by the service buffers in force when it was booked.
    pub occupied: Span,
    /// Capacity of the service when `occupied` was last computed.
    pub capacity: u32,
    pub status: BookingStatus,
    pub manage_key_digest: TokenDigest,
    pub manage_token_last_used_at: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn scope(&self) -> ResourceScope {
        ResourceScope::for_request(self.service_id, self.agent_id)
    }
}

/// One active booking inside a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeEntry {
    pub booking_id: Ulid,
    pub occupied: Span,
    pub capacity: u32,
}

impl From<&Booking> for ScopeEntry {
    fn from(b: &Booking) -> Self {
        ScopeEntry {
            booking_id: b.id,
            occupied: b.occupied,
            capacity: b.capacity,
        }
    }
}

/// Active bookings of one resource scope, sorted by `occupied.start`.
#[derive(Debug, Clone)]
pub struct ScopeState {
    pub scope: ResourceScope,
    pub entries: Vec<ScopeEntry>,
}

impl ScopeState {
    pub fn new(scope: ResourceScope) -> Self {
        Self {
            scope,
            entries: Vec::new(),
        }
    }

    /// Insert entry maintaining sort order by occupied.start.
    pub fn insert_entry(&mut self, entry: ScopeEntry) {
        let pos = self
            .entries
            .partition_point(|e| e.occupied.start <= entry.occupied.start);
        self.entries.insert(pos, entry);
    }

    pub fn remove_entry(&mut self, booking_id: Ulid) -> Option<ScopeEntry> {
        let pos = self.entries.iter().position(|e| e.booking_id == booking_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose occupied span overlaps the query window.
    /// Everything at index >= right_bound starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ScopeEntry> {
        let right_bound = self
            .entries
            .partition_point(|e| e.occupied.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.occupied.end > query.start)
    }
}

/// WAL record format. Flat, one variant per durable mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        span: Span,
        occupied: Span,
        capacity: u32,
        manage_key_digest: TokenDigest,
        at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        /// Present when the change was made with the manage token, which
        /// is then rotated to this digest.
        rotated_digest: Option<TokenDigest>,
        at: Ms,
    },
}

impl Event {
    pub fn booking_id(&self) -> Ulid {
        match self {
            Event::BookingCreated { booking } => booking.id,
            Event::BookingRescheduled { id, .. } | Event::BookingStatusChanged { id, .. } => *id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A bookable start inside an open window. Times are in the business zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub span: Span,
    pub scope: ResourceScope,
}

/// Booking as shown to callers; never carries the token digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub service_id: ServiceId,
    pub agent_id: Option<AgentId>,
    pub customer_id: String,
    pub status: BookingStatus,
    pub start: Ms,
    pub end: Ms,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub manage_token_last_used_at: Option<Ms>,
}

impl From<&Booking> for BookingInfo {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            service_id: b.service_id,
            agent_id: b.agent_id,
            customer_id: b.customer_id.clone(),
            status: b.status,
            start: b.span.start,
            end: b.span.end,
            created_at: b.created_at,
            updated_at: b.updated_at,
            manage_token_last_used_at: b.manage_token_last_used_at,
        }
    }
}

/// A booking together with a freshly issued manage token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedBooking {
    pub booking: BookingInfo,
    pub manage_token: String,
}
