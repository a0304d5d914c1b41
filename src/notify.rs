//! Post-commit notices and their best-effort fan-out to collaborators
//! (audit log, webhooks, email). Nothing here can fail a booking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::engine::Actor;
use crate::model::{BookingInfo, BookingStatus, Ms};
use crate::observability;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NoticeKind {
    Created,
    Rescheduled { previous_start: Ms },
    StatusChanged { from: BookingStatus, actor: Actor },
}

/// Sent once a change is durable and the scope lock is released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    #[serde(flatten)]
    pub kind: NoticeKind,
    pub booking: BookingInfo,
    pub at: Ms,
}

/// Broadcast hub for booking notices.
pub struct NotifyHub {
    tx: broadcast::Sender<BookingNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookingNotice> {
        self.tx.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notice: BookingNotice) {
        let _ = self.tx.send(notice);
    }
}

/// Something outside the engine that wants to hear about bookings.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, notice: &BookingNotice) -> Result<(), String>;
}

/// Writes every notice as one JSON line on the `audit` tracing target.
pub struct AuditLog;

#[async_trait]
impl Collaborator for AuditLog {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn deliver(&self, notice: &BookingNotice) -> Result<(), String> {
        let line = serde_json::to_string(notice).map_err(|e| e.to_string())?;
        tracing::info!(target: "audit", "{line}");
        Ok(())
    }
}

/// Feed every notice to every collaborator, each delivery capped at
/// `timeout`. Ends when the hub is dropped.
pub fn spawn_dispatcher(
    hub: &NotifyHub,
    collaborators: Vec<Arc<dyn Collaborator>>,
    timeout: Duration,
) -> JoinHandle<()> {
    let mut rx = hub.subscribe();
    tokio::spawn(async move {
        loop {
            let notice = match rx.recv().await {
                Ok(n) => n,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("notice dispatcher lagged, {skipped} notices dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            for c in &collaborators {
                let failure = match tokio::time::timeout(timeout, c.deliver(&notice)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(_) => format!("timed out after {}ms", timeout.as_millis()),
                };
                tracing::warn!(
                    collaborator = c.name(),
                    booking_id = %notice.booking.id,
                    "notice delivery failed: {failure}"
                );
                metrics::counter!(observability::NOTICE_FAILURES_TOTAL, "collaborator" => c.name())
                    .increment(1);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use ulid::Ulid;

    fn notice(kind: NoticeKind) -> BookingNotice {
        BookingNotice {
            kind,
            booking: BookingInfo {
                id: Ulid::new(),
                service_id: 1,
                agent_id: None,
                customer_id: "c".into(),
                status: BookingStatus::Confirmed,
                start: 1_000,
                end: 2_000,
                created_at: 10,
                updated_at: 10,
                manage_token_last_used_at: None,
            },
            at: 10,
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Ulid>>,
    }

    #[async_trait]
    impl Collaborator for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        async fn deliver(&self, notice: &BookingNotice) -> Result<(), String> {
            self.seen.lock().unwrap().push(notice.booking.id);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Collaborator for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn deliver(&self, _: &BookingNotice) -> Result<(), String> {
            Err("smtp down".into())
        }
    }

    struct Stuck;

    #[async_trait]
    impl Collaborator for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }
        async fn deliver(&self, _: &BookingNotice) -> Result<(), String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();
        let n = notice(NoticeKind::Created);
        hub.send(n.clone());
        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        NotifyHub::new().send(notice(NoticeKind::Created));
    }

    #[tokio::test]
    async fn failing_and_slow_collaborators_do_not_block_others() {
        let hub = NotifyHub::new();
        let recorder = Arc::new(Recorder::default());
        let handle = spawn_dispatcher(
            &hub,
            vec![Arc::new(Broken), Arc::new(Stuck), recorder.clone()],
            Duration::from_millis(20),
        );

        let a = notice(NoticeKind::Created);
        let b = notice(NoticeKind::Rescheduled { previous_start: 500 });
        hub.send(a.clone());
        hub.send(b.clone());

        for _ in 0..100 {
            if recorder.seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.seen.lock().unwrap(), vec![a.booking.id, b.booking.id]);

        drop(hub);
        handle.await.unwrap();
    }

    #[test]
    fn notice_json_shape() {
        let n = notice(NoticeKind::StatusChanged {
            from: BookingStatus::Pending,
            actor: Actor::Customer,
        });
        let v: serde_json::Value = serde_json::to_value(&n).unwrap();
        assert_eq!(v["event"], "status_changed");
        assert_eq!(v["from"], "pending");
        assert_eq!(v["actor"], "customer");
        assert_eq!(v["booking"]["status"], "confirmed");
    }

    #[tokio::test]
    async fn audit_log_delivers() {
        AuditLog.deliver(&notice(NoticeKind::Created)).await.unwrap();
    }
}
