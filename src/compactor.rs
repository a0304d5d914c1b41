use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once if the log has grown by at least `threshold` appends.
/// Returns the number of bookings written, or `None` if nothing was done.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Option<usize> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return None;
    }
    match engine.compact_wal().await {
        Ok(bookings) => {
            info!(appends, bookings, "WAL compacted");
            Some(bookings)
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            None
        }
    }
}

/// Background WAL maintenance. Runs until the task is dropped.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::engine::NewBooking;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    const CONFIG: &str = r#"
version = 1
timezone = "UTC"

[schedule]
mon = [{ start = "08:00", end = "18:00" }]

[[services]]
id = 1
duration_minutes = 30
"#;

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let cfg = Configuration::from_toml_str(CONFIG).unwrap();
        let engine = Engine::new(path, cfg, Arc::new(NotifyHub::new())).unwrap();

        // Sunday 2026-10-18 00:00 UTC; Monday is the 19th.
        let now: Ms = 1_792_281_600_000;
        let monday_8am = now + 32 * 3_600_000;
        for i in 0..3 {
            let issued = engine
                .create_booking(
                    NewBooking {
                        service_id: 1,
                        agent_id: None,
                        start: monday_8am + i * 30 * MINUTE_MS,
                        customer_id: format!("c{i}"),
                        status: BookingStatus::Confirmed,
                    },
                    now,
                )
                .await
                .unwrap();
            engine.cancel(&issued.manage_token, now).await.unwrap();
        }

        assert_eq!(compact_if_due(&engine, 10).await, None);
        assert_eq!(compact_if_due(&engine, 6).await, Some(3));
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(compact_if_due(&engine, 1).await, None);
    }
}
