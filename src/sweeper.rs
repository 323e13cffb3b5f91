use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};

/// Background task that moves bookings through their lifecycle as time passes.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let report = engine.advance_due_bookings(now_ms()).await;
        if report.failed > 0 {
            warn!(?report, "sweep left bookings for the next pass");
        } else if !report.is_empty() {
            info!(?report, "sweep");
        }
    }
    debug!("sweeper stopped");
}

/// Rewrites the WAL once enough commits have piled up since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(commits) => info!(appends, commits, "compaction done"),
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
    debug!("compactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::model::*;
    use crate::notify::Broadcaster;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stationd_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweeper_activates_current_booking_and_stops_on_cancel() {
        let engine = Arc::new(
            Engine::new(test_wal_path("sweeper.wal"), Broadcaster::default(), EngineConfig::default())
                .unwrap(),
        );
        let station = engine.create_station("pc-01").await.unwrap();
        let person = engine
            .register_person("s1", "s1@uni.example", "Ada", Some(2))
            .await
            .unwrap();

        // Started a minute ago, within the grace window.
        let now = now_ms();
        let booking = engine
            .create_booking(station.id, person.id, Span::new(now - 60_000, now + 3_600_000))
            .await
            .unwrap();

        let mut events = engine.notify.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(
            engine.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        let activated = events.recv().await.unwrap();
        assert_eq!(activated.kind(), "booking_activated");
        assert_eq!(engine.get_booking(booking.id).await.unwrap().status, BookingStatus::Active);
        assert_eq!(engine.get_station(station.id).await.unwrap().occupant, Some(person.id));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let engine = Arc::new(
            Engine::new(test_wal_path("compactor.wal"), Broadcaster::default(), EngineConfig::default())
                .unwrap(),
        );
        for i in 0..5 {
            engine.create_station(&format!("pc-{i}")).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_compactor(
            engine.clone(),
            3,
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        for _ in 0..100 {
            if engine.wal_appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.list_stations().await.unwrap().len(), 5);

        shutdown.cancel();
        task.await.unwrap();
    }
}
