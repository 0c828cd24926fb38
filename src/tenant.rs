use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};

use crate::auth::IdentityProvider;
use crate::compactor;
use crate::engine::{Engine, EngineConfig};
use crate::limits::*;
use crate::notify::{self, LogNotifier, Notifier};

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL,
/// compactor and notice dispatcher. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    config: EngineConfig,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        config: EngineConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            config,
            identity,
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    /// Get or lazily create an engine for the given tenant. Names that differ
    /// only in characters dropped by sanitization share one engine, since
    /// they share one WAL file.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Keep the WAL inside data_dir whatever the client sends.
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

        // Two sessions opening the same tenant race here; the entry lock lets
        // only one of them open the WAL.
        let entry = self.engines.entry(safe_name.clone());
        let engine = match entry {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(notify::NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.config.clone())?);
                for (actor_id, contact) in self.identity.contacts() {
                    if let Err(e) = engine.register_contact(actor_id, &contact) {
                        warn!(%actor_id, "contact not registered: {e}");
                    }
                }
                v.insert(engine.clone());
                engine
            }
        };

        notify::spawn_dispatcher(engine.clone(), self.notifier.clone());
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        info!(tenant = %safe_name, "tenant loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
