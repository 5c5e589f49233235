use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::config::Config;
use crate::engine::Engine;
use crate::limits::*;
use crate::model::FloorLayout;
use crate::notify::NotifyHub;
use crate::reaper;

/// Manages per-site engines. Each parking site gets its own Engine + WAL +
/// expiry sweeper + compactor. Site = database name from the pgwire connection.
pub struct SiteManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    sweep_interval: Duration,
    layout: FloorLayout,
}

impl SiteManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        sweep_interval: Duration,
        layout: FloorLayout,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            sweep_interval,
            layout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.data_dir.clone(),
            config.compact_threshold,
            config.sweep_interval,
            config.layout.clone(),
        )
    }

    /// Get or lazily create the engine for a site.
    pub fn get_or_create(&self, site: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(site) {
            return Ok(engine.value().clone());
        }
        if site.len() > MAX_SITE_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "site name too long",
            ));
        }
        if self.engines.len() >= MAX_SITES {
            return Err(std::io::Error::other("too many sites"));
        }

        // Site names become file names verbatim, so one WAL file maps to
        // exactly one site name.
        if site.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty site name",
            ));
        }
        if !site
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid site name",
            ));
        }

        // Two connections may race to open the same site; the entry lock
        // keeps a second engine off the WAL file.
        let entry = self.engines.entry(site.to_string());
        if let dashmap::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{site}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::with_layout(wal_path, notify, self.layout.clone())?);

        let reaper_engine = engine.clone();
        let every = self.sweep_interval;
        tokio::spawn(async move {
            reaper::run_reaper(reaper_engine, every).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        info!(site, users = engine.user_count(), "site opened");
        metrics::gauge!(crate::observability::SITES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn site_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkease_test_site").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> SiteManager {
        SiteManager::new(dir, 1000, Duration::from_secs(3), FloorLayout::default())
    }

    #[tokio::test]
    async fn site_isolation() {
        let sm = manager(test_data_dir("isolation"));

        let north = sm.get_or_create("north_lot").unwrap();
        let south = sm.get_or_create("south_lot").unwrap();

        let now = parse_date("2099-06-01").unwrap().and_time(parse_time("08:00").unwrap());
        let req = ReservationRequest {
            floor: "floor1".into(),
            slot: SlotNo(3),
            date: parse_date("2099-06-01").unwrap(),
            start: parse_time("09:00").unwrap(),
            end: parse_time("10:00").unwrap(),
            plate: "ABC123".into(),
        };
        north.reserve_slot("u1", req.clone(), now).await.unwrap();

        // the same slot at another site is untouched
        south.reserve_slot("u2", req, now).await.unwrap();
        assert_eq!(north.available_count("floor1", parse_date("2099-06-01").unwrap()).await.unwrap(), 9);
        assert!(south.reservation("u1", parse_date("2099-06-01").unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn site_lazy_creation() {
        let dir = test_data_dir("lazy");
        let sm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = sm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(sm.site_count(), 1);
    }

    #[tokio::test]
    async fn site_same_engine_returned() {
        let sm = manager(test_data_dir("same_eng"));

        let eng1 = sm.get_or_create("foo").unwrap();
        let eng2 = sm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn site_uses_configured_layout() {
        let layout = FloorLayout {
            floors: vec!["b1".into(), "g".into()],
            slots_per_floor: 25,
        };
        let sm = SiteManager::new(test_data_dir("layout"), 1000, Duration::from_secs(3), layout);
        let eng = sm.get_or_create("garage").unwrap();

        let counts = eng.floor_counts(parse_date("2024-06-01").unwrap()).await;
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].available, 25);
    }

    #[tokio::test]
    async fn site_name_rejects_path_characters() {
        let dir = test_data_dir("sanitize");
        let sm = manager(dir.clone());

        let err = sm.get_or_create("../evil").err().unwrap();
        assert!(err.to_string().contains("invalid site name"));
        assert!(sm.get_or_create("../..").is_err());
        assert!(sm.get_or_create("").is_err());

        assert!(fs::read_dir(&dir).unwrap().next().is_none());
        assert_eq!(sm.site_count(), 0);
    }

    #[tokio::test]
    async fn distinct_site_names_never_share_a_wal() {
        let dir = test_data_dir("shared_wal");
        let sm = manager(dir.clone());

        // would collapse to lota.wal if punctuation were stripped
        assert!(sm.get_or_create("lot.a").is_err());

        let lota = sm.get_or_create("lota").unwrap();
        let day = parse_date("2099-06-01").unwrap();
        let now = day.and_time(parse_time("08:00").unwrap());
        let req = ReservationRequest {
            floor: "floor1".into(),
            slot: SlotNo(1),
            date: day,
            start: parse_time("09:00").unwrap(),
            end: parse_time("10:00").unwrap(),
            plate: "ABC123".into(),
        };
        lota.reserve_slot("bob", req, now).await.unwrap();

        let files: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec!["lota.wal".to_string()]);
        assert_eq!(sm.site_count(), 1);
    }

    #[tokio::test]
    async fn site_name_too_long() {
        let sm = manager(test_data_dir("name_too_long"));

        let long_name = "x".repeat(MAX_SITE_NAME_LEN + 1);
        let err = sm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("site name too long"));
    }

    #[tokio::test]
    async fn site_count_limit() {
        let sm = manager(test_data_dir("count_limit"));

        for i in 0..MAX_SITES {
            sm.get_or_create(&format!("s{i}")).unwrap();
        }
        let err = sm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many sites"));
    }
}
