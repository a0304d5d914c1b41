mod availability;
mod conflict;
mod error;
pub mod lifecycle;
mod mutations;
mod queries;
pub mod schedule;
pub mod slots;
pub mod token;

pub use availability::{free_windows, merge_overlapping, peak_concurrency, subtract_intervals};
pub use conflict::{check_capacity, Admission, Rejection};
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use lifecycle::{Actor, Transition};
pub use mutations::NewBooking;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::Configuration;
use crate::model::*;
use crate::notify::{BookingNotice, NoticeKind, NotifyHub};
use crate::observability;
use crate::wal::Wal;

pub type SharedScopeState = Arc<RwLock<ScopeState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, and pays one fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't ride
    // along with the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Write access to one scope. Holds the maintenance gate in shared mode so
/// compaction never snapshots a half-applied mutation.
pub(super) struct ScopeGuard {
    pub(super) state: OwnedRwLockWriteGuard<ScopeState>,
    _gate: OwnedRwLockReadGuard<()>,
}

pub struct Engine {
    config: std::sync::RwLock<Arc<Configuration>>,
    scopes: DashMap<ResourceScope, SharedScopeState>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    /// Digest of the current manage token → booking.
    pub(super) tokens: DashMap<TokenDigest, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    maintenance: Arc<RwLock<()>>,
}

/// Apply an event to the indexes. The caller holds the booking's scope lock.
fn apply_event(
    scope: &mut ScopeState,
    event: &Event,
    bookings: &DashMap<Ulid, Booking>,
    tokens: &DashMap<TokenDigest, Ulid>,
) {
    match event {
        Event::BookingCreated { booking } => {
            if booking.status.is_active() {
                scope.insert_entry(ScopeEntry::from(booking));
            }
            tokens.insert(booking.manage_key_digest, booking.id);
            bookings.insert(booking.id, booking.clone());
        }
        Event::BookingRescheduled {
            id,
            span,
            occupied,
            capacity,
            manage_key_digest,
            at,
        } => {
            let Some(mut b) = bookings.get_mut(id) else { return };
            b.span = *span;
            b.occupied = *occupied;
            b.capacity = *capacity;
            if b.status.is_active() {
                scope.remove_entry(*id);
                scope.insert_entry(ScopeEntry::from(&*b));
            }
            tokens.remove(&b.manage_key_digest);
            tokens.insert(*manage_key_digest, *id);
            b.manage_key_digest = *manage_key_digest;
            b.manage_token_last_used_at = Some(*at);
            b.updated_at = *at;
        }
        Event::BookingStatusChanged {
            id,
            status,
            rotated_digest,
            at,
        } => {
            let Some(mut b) = bookings.get_mut(id) else { return };
            match (b.status.is_active(), status.is_active()) {
                (true, false) => {
                    scope.remove_entry(*id);
                }
                (false, true) => scope.insert_entry(ScopeEntry::from(&*b)),
                _ => {}
            }
            if let Some(digest) = rotated_digest {
                tokens.remove(&b.manage_key_digest);
                tokens.insert(*digest, *id);
                b.manage_key_digest = *digest;
                b.manage_token_last_used_at = Some(*at);
            }
            b.status = *status;
            b.updated_at = *at;
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        config: Configuration,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let (wal, replay) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        metrics::gauge!(observability::CONFIG_VERSION).set(config.version as f64);
        let engine = Self {
            config: std::sync::RwLock::new(Arc::new(config)),
            scopes: DashMap::new(),
            bookings: DashMap::new(),
            tokens: DashMap::new(),
            wal_tx,
            notify,
            maintenance: Arc::new(RwLock::new(())),
        };

        // Sole owner of every scope Arc here, so try_write cannot contend.
        // Never block: this may run inside the runtime.
        for event in &replay.events {
            let scope = match event {
                Event::BookingCreated { booking } => booking.scope(),
                other => match engine.bookings.get(&other.booking_id()) {
                    Some(b) => b.scope(),
                    None => {
                        tracing::warn!("replay: event for unknown booking {}", other.booking_id());
                        continue;
                    }
                },
            };
            let shared = engine.scope_state(scope);
            let mut guard = shared.try_write().expect("replay: uncontended write");
            apply_event(&mut guard, event, &engine.bookings, &engine.tokens);
        }
        tracing::info!(
            events = replay.events.len(),
            bookings = engine.bookings.len(),
            scopes = engine.scopes.len(),
            "WAL replayed from {}",
            wal_path.display()
        );

        Ok(engine)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Configuration> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Install a newer configuration. Bookings already made keep the
    /// geometry they were booked with.
    pub fn replace_config(&self, next: Configuration) -> Result<(), EngineError> {
        let mut current = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if next.version <= current.version {
            return Err(EngineError::Validation(format!(
                "configuration version {} is not newer than {}",
                next.version, current.version
            )));
        }
        tracing::info!(from = current.version, to = next.version, "configuration replaced");
        metrics::gauge!(observability::CONFIG_VERSION).set(next.version as f64);
        *current = Arc::new(next);
        Ok(())
    }

    pub(super) fn scope_state(&self, scope: ResourceScope) -> SharedScopeState {
        self.scopes
            .entry(scope)
            .or_insert_with(|| Arc::new(RwLock::new(ScopeState::new(scope))))
            .clone()
    }

    pub(super) fn existing_scope(&self, scope: &ResourceScope) -> Option<SharedScopeState> {
        self.scopes.get(scope).map(|e| e.value().clone())
    }

    /// Take a scope's write lock, giving up after `wait`.
    pub(super) async fn lock_scope(
        &self,
        scope: ResourceScope,
        wait: Duration,
    ) -> Result<ScopeGuard, EngineError> {
        let shared = self.scope_state(scope);
        let gate = self.maintenance.clone();
        let started = Instant::now();
        let acquire = async move {
            let gate = gate.read_owned().await;
            let state = shared.write_owned().await;
            ScopeGuard { state, _gate: gate }
        };
        match tokio::time::timeout(wait, acquire).await {
            Ok(guard) => {
                metrics::histogram!(observability::SCOPE_LOCK_WAIT_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                Ok(guard)
            }
            Err(_) => {
                tracing::warn!(%scope, wait_ms = wait.as_millis() as u64, "scope lock timeout");
                metrics::counter!(observability::RESERVATION_REJECTIONS_TOTAL, "reason" => "lock_timeout")
                    .increment(1);
                Err(EngineError::SlotUnavailable(Rejection::LockTimeout))
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL append, then apply. Returns the notice to publish once the scope
    /// lock is released.
    pub(super) async fn persist_and_apply(
        &self,
        scope: &mut ScopeState,
        event: Event,
        kind: NoticeKind,
    ) -> Result<BookingNotice, EngineError> {
        self.wal_append(&event).await?;
        apply_event(scope, &event, &self.bookings, &self.tokens);
        let id = event.booking_id();
        let booking = self
            .bookings
            .get(&id)
            .map(|b| BookingInfo::from(b.value()))
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let at = booking.updated_at;
        Ok(BookingNotice { kind, booking, at })
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}
