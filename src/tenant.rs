use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::{Engine, EngineConfig};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + reaper.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    reaper_interval: Duration,
    engine_config: EngineConfig,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        reaper_interval: Duration,
        engine_config: EngineConfig,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            reaper_interval,
            engine_config,
        }
    }

    /// Get or lazily create an engine for the given tenant. Names that sanitize
    /// to the same string share one engine and one WAL.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Path traversal guard
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }

        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Re-check under the shard lock so two first connections to the same
        // database can't both replay the WAL.
        let entry = self.engines.entry(safe_name.clone());
        if let Entry::Occupied(e) = &entry {
            return Ok(e.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.engine_config)?);

        tokio::spawn(reaper::run_reaper(engine.clone(), self.reaper_interval));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        entry.or_insert(engine.clone());
        tracing::info!("loaded tenant {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;

    const DAY: Ms = 1_704_067_200_000;
    const NOW: Ms = DAY - 3_600_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, Duration::from_secs(5), EngineConfig::default())
    }

    fn req(owner: &str) -> ReserveRequest {
        ReserveRequest {
            id: None,
            resource_id: "room-1".into(),
            owner_id: owner.into(),
            start: DAY,
            end: DAY + 30 * 60_000,
            ttl_ms: None,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));

        let eng_a = tm.get_or_create("clinic_a").unwrap();
        let eng_b = tm.get_or_create("clinic_b").unwrap();

        // Same resource and slot in both tenants: no conflict across them.
        let a = eng_a.reserve(req("alice"), NOW).await.unwrap();
        eng_b.reserve(req("bob"), NOW).await.unwrap();

        assert!(eng_b.get_reservation(a.id, NOW).await.is_none());
        assert!(matches!(
            eng_a.reserve(req("carol"), NOW).await,
            Err(crate::engine::EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_engine_uses_configured_step() {
        let config = EngineConfig {
            slot_step_ms: 30 * 60_000,
            ..EngineConfig::default()
        };
        let tm = TenantManager::new(test_data_dir("config"), 1000, Duration::from_secs(5), config);
        let engine = tm.get_or_create("foo").unwrap();
        assert_eq!(engine.config, config);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tenant_names_with_same_wal_share_engine() {
        let dir = test_data_dir("shared_wal");
        let tm = manager(dir.clone());

        let dotted = tm.get_or_create("clinic.a").unwrap();
        let plain = tm.get_or_create("clinica").unwrap();
        assert!(Arc::ptr_eq(&dotted, &plain));
        assert_eq!(tm.tenant_count(), 1);

        dotted.reserve(req("alice"), NOW).await.unwrap();
        assert!(matches!(
            plain.reserve(req("bob"), NOW).await,
            Err(crate::engine::EngineError::Conflict(_))
        ));

        // A restart replays one non-overlapping set.
        let reopened = manager(dir);
        let engine = reopened.get_or_create("clinica").unwrap();
        let all = engine
            .list_reservations(&ReservationFilter::default(), NOW)
            .await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].owner_id, "alice");
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
