use std::collections::BTreeMap;

use chrono::Days;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::config::{Configuration, Service};
use crate::limits::*;
use crate::model::*;
use crate::notify::NoticeKind;
use crate::observability;

use super::conflict::{check_capacity, Admission, Rejection};
use super::lifecycle::{check_transition, is_initial, Actor, Transition};
use super::schedule::{ms_to_local, resolve_windows};
use super::slots::is_candidate;
use super::{token, Engine, EngineError, ScopeGuard, WalCommand};

/// Input to `Engine::create_booking`.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub service_id: ServiceId,
    pub agent_id: Option<AgentId>,
    pub start: Ms,
    pub customer_id: String,
    pub status: BookingStatus,
}

fn reject(rejection: Rejection) -> EngineError {
    metrics::counter!(observability::RESERVATION_REJECTIONS_TOTAL, "reason" => rejection.reason())
        .increment(1);
    EngineError::SlotUnavailable(rejection)
}

fn token_failure() -> EngineError {
    metrics::counter!(observability::TOKEN_FAILURES_TOTAL).increment(1);
    EngineError::TokenInvalid
}

fn occupied_for(service: &Service, start: Ms) -> (Span, Span) {
    let span = Span::new(start, start + service.duration_ms());
    let occupied = span.expand(service.buffer_before_ms(), service.buffer_after_ms());
    (span, occupied)
}

/// Past/horizon, then opening hours, then the slot grid.
fn validate_start(
    cfg: &Configuration,
    service: &Service,
    agent_id: Option<AgentId>,
    start: Ms,
    now: Ms,
) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::Validation("start timestamp out of range".into()));
    }
    if start <= now {
        return Err(EngineError::Validation("start is in the past".into()));
    }
    let tz = &cfg.timezone;
    let (Some(local_start), Some(local_now)) = (ms_to_local(tz, start), ms_to_local(tz, now)) else {
        return Err(EngineError::Validation("start cannot be placed in the business time zone".into()));
    };
    let date = local_start.date();
    let last_bookable = local_now
        .date()
        .checked_add_days(Days::new(cfg.booking_horizon_days as u64));
    if last_bookable.is_none_or(|last| date > last) {
        return Err(EngineError::Validation(format!(
            "start is beyond the {}-day booking horizon",
            cfg.booking_horizon_days
        )));
    }

    let windows = resolve_windows(cfg, service.id, agent_id, date);
    if windows.is_empty() {
        return Err(EngineError::Closed(format!("no opening on {date}")));
    }
    let step = cfg.slot_step_ms();
    let occupied = service.occupied_minutes() as Ms * MINUTE_MS;
    if !windows.iter().any(|w| start >= w.start && start + occupied <= w.end) {
        return Err(EngineError::Closed(format!(
            "{} is outside opening hours",
            local_start.format("%Y-%m-%d %H:%M")
        )));
    }
    if !is_candidate(&windows, step, occupied, start) {
        return Err(EngineError::Validation(format!(
            "start is not on the {}-minute slot grid",
            cfg.slot_step_minutes
        )));
    }
    Ok(())
}

impl Engine {
    /// Validate, then check capacity and insert under the scope lock.
    pub async fn create_booking(&self, req: NewBooking, now: Ms) -> Result<IssuedBooking, EngineError> {
        let cfg = self.config();
        let service = cfg
            .service(req.service_id)
            .filter(|s| s.active)
            .ok_or_else(|| EngineError::not_found("service", req.service_id))?;
        if let Some(agent_id) = req.agent_id {
            cfg.agent(agent_id)
                .filter(|a| a.active && a.performs(req.service_id))
                .ok_or_else(|| EngineError::not_found("agent", agent_id))?;
        }

        let customer_id = req.customer_id.trim();
        if customer_id.is_empty() {
            return Err(EngineError::Validation("customer_id is required".into()));
        }
        if customer_id.len() > MAX_CUSTOMER_ID_LEN {
            return Err(EngineError::Validation("customer_id too long".into()));
        }
        if !is_initial(req.status) {
            return Err(EngineError::Validation(format!(
                "bookings cannot be created as {}",
                req.status
            )));
        }

        validate_start(&cfg, service, req.agent_id, req.start, now)?;

        let (span, occupied) = occupied_for(service, req.start);
        let scope = ResourceScope::for_request(req.service_id, req.agent_id);
        let mut guard = self.lock_scope(scope, cfg.lock_timeout()).await?;

        if guard.state.entries.len() >= MAX_BOOKINGS_PER_SCOPE {
            return Err(EngineError::Validation("too many bookings on this resource".into()));
        }
        // pending_payment does not hold capacity until it is confirmed.
        if req.status.is_active()
            && let Admission::Reject(r) = check_capacity(&guard.state, &occupied, service.capacity, None)
        {
            tracing::debug!(%scope, ?r, "create rejected");
            return Err(reject(r));
        }

        let (manage_token, digest) = self.fresh_token();
        let booking = Booking {
            id: Ulid::new(),
            service_id: req.service_id,
            agent_id: req.agent_id,
            customer_id: customer_id.to_string(),
            span,
            occupied,
            capacity: service.capacity,
            status: req.status,
            manage_key_digest: digest,
            manage_token_last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        let notice = self
            .persist_and_apply(&mut guard.state, Event::BookingCreated { booking }, NoticeKind::Created)
            .await?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "status" => req.status.as_str())
            .increment(1);
        tracing::info!(booking_id = %notice.booking.id, %scope, status = %req.status, "booking created");
        let booking = notice.booking.clone();
        self.notify.send(notice);
        Ok(IssuedBooking { booking, manage_token })
    }

    /// Self-service reschedule. Same id, new interval, rotated token.
    pub async fn reschedule(&self, presented: &str, new_start: Ms, now: Ms) -> Result<IssuedBooking, EngineError> {
        let (id, digest, scope) = self.resolve_token(presented)?;
        let cfg = self.config();
        let mut guard = self.lock_scope(scope, cfg.lock_timeout()).await?;
        let booking = self.verify_token_locked(id, &digest)?;

        if booking.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: booking.status,
            });
        }
        let service = cfg
            .service(booking.service_id)
            .ok_or_else(|| EngineError::not_found("service", booking.service_id))?;
        validate_start(&cfg, service, booking.agent_id, new_start, now)?;

        let (span, occupied) = occupied_for(service, new_start);
        if booking.status.is_active()
            && let Admission::Reject(r) = check_capacity(&guard.state, &occupied, service.capacity, Some(id))
        {
            return Err(reject(r));
        }

        let (manage_token, manage_key_digest) = self.fresh_token();
        let event = Event::BookingRescheduled {
            id,
            span,
            occupied,
            capacity: service.capacity,
            manage_key_digest,
            at: now,
        };
        let notice = self
            .persist_and_apply(&mut guard.state, event, NoticeKind::Rescheduled { previous_start: booking.span.start })
            .await?;
        drop(guard);

        tracing::info!(booking_id = %id, from = booking.span.start, to = new_start, "booking rescheduled");
        let info = notice.booking.clone();
        self.notify.send(notice);
        Ok(IssuedBooking { booking: info, manage_token })
    }

    /// Self-service cancel.
    pub async fn cancel(&self, presented: &str, now: Ms) -> Result<IssuedBooking, EngineError> {
        self.set_status_with_token(presented, BookingStatus::Cancelled, now).await
    }

    /// Status change by the token holder. Rotates the token unless the
    /// booking is already in `to`.
    pub async fn set_status_with_token(
        &self,
        presented: &str,
        to: BookingStatus,
        now: Ms,
    ) -> Result<IssuedBooking, EngineError> {
        let (id, digest, scope) = self.resolve_token(presented)?;
        let cfg = self.config();
        let mut guard = self.lock_scope(scope, cfg.lock_timeout()).await?;
        let booking = self.verify_token_locked(id, &digest)?;

        let elapsed = booking.span.end <= now;
        if check_transition(booking.status, to, Actor::Customer, elapsed)? == Transition::NoOp {
            return Ok(IssuedBooking {
                booking: BookingInfo::from(&booking),
                manage_token: presented.to_ascii_lowercase(),
            });
        }
        self.capacity_for_activation(&guard, &booking, to)?;

        let (manage_token, rotated) = self.fresh_token();
        let event = Event::BookingStatusChanged {
            id,
            status: to,
            rotated_digest: Some(rotated),
            at: now,
        };
        let notice = self
            .persist_and_apply(&mut guard.state, event, NoticeKind::StatusChanged { from: booking.status, actor: Actor::Customer })
            .await?;
        drop(guard);

        tracing::info!(booking_id = %id, from = %booking.status, %to, "status changed by customer");
        let info = notice.booking.clone();
        self.notify.send(notice);
        Ok(IssuedBooking { booking: info, manage_token })
    }

    /// Status change by admin, payment callback or the completion sweep.
    /// The manage token is left alone.
    pub async fn transition(
        &self,
        id: Ulid,
        to: BookingStatus,
        actor: Actor,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let scope = self
            .bookings
            .get(&id)
            .map(|b| b.scope())
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let cfg = self.config();
        let mut guard = self.lock_scope(scope, cfg.lock_timeout()).await?;
        let booking = self
            .bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or_else(|| EngineError::not_found("booking", id))?;

        let elapsed = booking.span.end <= now;
        if check_transition(booking.status, to, actor, elapsed)? == Transition::NoOp {
            return Ok(BookingInfo::from(&booking));
        }
        self.capacity_for_activation(&guard, &booking, to)?;

        let event = Event::BookingStatusChanged {
            id,
            status: to,
            rotated_digest: None,
            at: now,
        };
        let notice = self
            .persist_and_apply(&mut guard.state, event, NoticeKind::StatusChanged { from: booking.status, actor })
            .await?;
        drop(guard);

        tracing::info!(booking_id = %id, from = %booking.status, %to, %actor, "status changed");
        let info = notice.booking.clone();
        self.notify.send(notice);
        Ok(info)
    }

    /// Complete every confirmed booking that ended at or before `now`.
    pub async fn complete_elapsed(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        let due: Vec<Ulid> = self
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed && b.span.end <= now)
            .map(|b| b.id)
            .collect();

        let mut completed = Vec::with_capacity(due.len());
        for id in due {
            match self.transition(id, BookingStatus::Completed, Actor::System, now).await {
                Ok(_) => completed.push(id),
                // Cancelled or rescheduled since it was collected.
                Err(EngineError::InvalidTransition { .. }) => {
                    tracing::debug!(booking_id = %id, "completion skipped");
                }
                // Busy scope; the next sweep picks it up.
                Err(EngineError::SlotUnavailable(Rejection::LockTimeout)) => {
                    tracing::warn!(booking_id = %id, "completion deferred: scope lock timed out");
                }
                Err(e) => return Err(e),
            }
        }
        if !completed.is_empty() {
            tracing::info!(count = completed.len(), "completed elapsed bookings");
        }
        Ok(completed)
    }

    /// Rewrite the WAL as one `BookingCreated` per booking.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        // Exclusive gate: no mutation is between WAL append and apply.
        let _gate = self.maintenance.write().await;

        let ordered: BTreeMap<Ulid, Booking> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let events: Vec<Event> = ordered
            .into_values()
            .map(|booking| Event::BookingCreated { booking })
            .collect();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── helpers ──────────────────────────────────────────

    /// Structural check and index lookup, before any lock is taken.
    fn resolve_token(&self, presented: &str) -> Result<(Ulid, TokenDigest, ResourceScope), EngineError> {
        let digest = token::parse(presented).map_err(|_| token_failure())?;
        let id = self
            .tokens
            .get(&digest)
            .map(|e| *e.value())
            .ok_or_else(token_failure)?;
        let scope = self
            .bookings
            .get(&id)
            .map(|b| b.scope())
            .ok_or_else(token_failure)?;
        Ok((id, digest, scope))
    }

    /// Re-check under the scope lock: the token may have rotated while we waited.
    fn verify_token_locked(&self, id: Ulid, digest: &TokenDigest) -> Result<Booking, EngineError> {
        let booking = self
            .bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or_else(token_failure)?;
        if !token::digests_match(&booking.manage_key_digest, digest) {
            return Err(token_failure());
        }
        Ok(booking)
    }

    /// Moving an inactive booking to an active status takes capacity, so it
    /// has to pass the conflict check like a new booking.
    fn capacity_for_activation(
        &self,
        guard: &ScopeGuard,
        booking: &Booking,
        to: BookingStatus,
    ) -> Result<(), EngineError> {
        if booking.status.is_active() || !to.is_active() {
            return Ok(());
        }
        match check_capacity(&guard.state, &booking.occupied, booking.capacity, Some(booking.id)) {
            Admission::Admit => Ok(()),
            Admission::Reject(r) => Err(reject(r)),
        }
    }

    fn fresh_token(&self) -> (String, TokenDigest) {
        loop {
            let (clear, digest) = token::generate();
            if !self.tokens.contains_key(&digest) {
                return (clear, digest);
            }
        }
    }
}
