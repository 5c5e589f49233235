use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// How often the compactor checks the WAL growth.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Local wall-clock time. Reservation dates and windows are local.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// One pass of the expiry sweep over every user, followed by housekeeping of
/// idle floor-days and abandoned notify channels. Returns how many
/// reservations were released.
pub async fn sweep_once(engine: &Engine, now: NaiveDateTime) -> usize {
    let mut released = 0;
    for (user_id, date) in engine.collect_expired(now) {
        match engine.expire_reservation(&user_id, date, now).await {
            Ok(true) => released += 1,
            // Cancelled or re-checked as live since collection
            Ok(false) => debug!(user = %user_id, %date, "reaper skip: nothing to release"),
            Err(e) => warn!(user = %user_id, %date, "reaper failed to release: {e}"),
        }
    }
    let pruned = engine.prune_floor_days(now.date()).await;
    if pruned > 0 {
        debug!("pruned {pruned} idle floor-days");
    }
    engine.notify.prune();
    released
}

/// Background task that periodically releases expired reservations.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let released = sweep_once(&engine, local_now()).await;
        if released > 0 {
            info!("reaped {released} expired reservations");
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use tokio_test::assert_ok;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkease_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        parse_date(date).unwrap().and_time(parse_time(time).unwrap())
    }

    fn request(slot: u32, date: &str, end: &str) -> ReservationRequest {
        ReservationRequest {
            floor: "floor1".into(),
            slot: SlotNo(slot),
            date: parse_date(date).unwrap(),
            start: parse_time("09:00").unwrap(),
            end: parse_time(end).unwrap(),
            plate: "ABC123".into(),
        }
    }

    #[tokio::test]
    async fn sweep_releases_only_elapsed_reservations() {
        let path = test_wal_path("sweep_once.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        let booked_at = at("2024-06-01", "08:00");

        assert_ok!(engine.reserve_slot("u1", request(1, "2024-06-01", "10:00"), booked_at).await);
        assert_ok!(engine.reserve_slot("u2", request(2, "2024-06-01", "12:00"), booked_at).await);
        assert_ok!(engine.reserve_slot("u3", request(3, "2024-06-02", "10:00"), booked_at).await);

        assert_eq!(sweep_once(&engine, at("2024-06-01", "10:01")).await, 1);
        assert!(engine.reservation("u1", parse_date("2024-06-01").unwrap()).await.is_none());
        assert!(engine.reservation("u2", parse_date("2024-06-01").unwrap()).await.is_some());

        // nothing left to do at the same instant
        assert_eq!(sweep_once(&engine, at("2024-06-01", "10:01")).await, 0);

        assert_eq!(sweep_once(&engine, at("2024-06-02", "11:00")).await, 2);
        assert!(engine.collect_expired(at("2024-06-02", "11:00")).is_empty());
    }

    #[tokio::test]
    async fn compactor_rewrites_after_threshold() {
        let path = test_wal_path("compactor.wal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
        assert_ok!(engine.add_vehicle("u1", "Toyota", "Vios", "ABC123").await);
        assert_ok!(engine.add_vehicle("u1", "Honda", "City", "XYZ789").await);
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        let handle = tokio::spawn(run_compactor(engine.clone(), 1));
        // the first tick fires immediately
        for _ in 0..50 {
            if engine.wal_appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.vehicles("u1").await.len(), 2);
    }
}
