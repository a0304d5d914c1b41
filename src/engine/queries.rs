use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_capacity, Admission};
use super::schedule::{ms_to_local, resolve_windows};
use super::slots::SlotCandidates;
use super::{token, Engine, EngineError};

impl Engine {
    /// Bookable starts for a local date. Never fails: closed days, unknown
    /// services and dates outside the horizon all give an empty list.
    pub async fn list_slots(
        &self,
        service_id: ServiceId,
        agent_id: Option<AgentId>,
        date: NaiveDate,
        now: Ms,
    ) -> Vec<Slot> {
        let cfg = self.config();
        let Some(service) = cfg.service(service_id).filter(|s| s.active) else {
            return Vec::new();
        };
        let tz = &cfg.timezone;
        let Some(today) = ms_to_local(tz, now).map(|dt| dt.date()) else {
            return Vec::new();
        };
        let last = today.checked_add_days(Days::new(cfg.booking_horizon_days as u64));
        if date < today || last.is_none_or(|last| date > last) {
            return Vec::new();
        }

        let windows = resolve_windows(&cfg, service_id, agent_id, date);
        if windows.is_empty() {
            return Vec::new();
        }

        let before = service.buffer_before_ms();
        let after = service.buffer_after_ms();
        let duration = service.duration_ms();
        let scope = ResourceScope::for_request(service_id, agent_id);

        let step = cfg.slot_step_ms();
        let occupied_ms = service.occupied_minutes() as Ms * MINUTE_MS;
        let candidates: Vec<Ms> = SlotCandidates::new(&windows, step, occupied_ms)
            .filter(|&t| t > now)
            .collect();

        // Read lock for a consistent view; booking re-validates anyway.
        // Same admission rule as a reservation, candidate by candidate.
        let free: Vec<Ms> = match self.existing_scope(&scope) {
            Some(shared) => {
                let guard = shared.read().await;
                candidates
                    .into_iter()
                    .filter(|&t| {
                        let occupied = Span::new(t - before, t + duration + after);
                        check_capacity(&guard, &occupied, service.capacity, None) == Admission::Admit
                    })
                    .collect()
            }
            None => candidates,
        };

        free
            .into_iter()
            .filter_map(|t| {
                let start = ms_to_local(tz, t)?;
                let end = ms_to_local(tz, t + duration)?;
                Some(Slot {
                    date,
                    start_time: start.time(),
                    end_time: end.time(),
                    span: Span::new(t, t + duration),
                    scope,
                })
            })
            .collect()
    }

    pub fn get_booking(&self, id: &Ulid) -> Result<BookingInfo, EngineError> {
        self.bookings
            .get(id)
            .map(|b| BookingInfo::from(b.value()))
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    /// Look a booking up by its current manage token.
    pub fn get_booking_by_token(&self, presented: &str) -> Result<BookingInfo, EngineError> {
        let digest = token::parse(presented)?;
        let id = self
            .tokens
            .get(&digest)
            .map(|e| *e.value())
            .ok_or(EngineError::TokenInvalid)?;
        let booking = self.bookings.get(&id).ok_or(EngineError::TokenInvalid)?;
        if !token::digests_match(&booking.manage_key_digest, &digest) {
            return Err(EngineError::TokenInvalid);
        }
        Ok(BookingInfo::from(booking.value()))
    }

    /// Active occupied spans on a scope, in start order.
    pub async fn scope_occupancy(&self, scope: ResourceScope) -> Vec<(Ulid, Span)> {
        match self.existing_scope(&scope) {
            Some(shared) => shared
                .read()
                .await
                .entries
                .iter()
                .map(|e| (e.booking_id, e.occupied))
                .collect(),
            None => Vec::new(),
        }
    }
}
