use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::limits::*;
use crate::observability::{TENANTS_ACTIVE, WAL_COMPACTIONS_TOTAL};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Per-tenant engines. A tenant is the database name of the pgwire
/// connection; each gets its own engine, WAL file and compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for `tenant`. Names that sanitize to the
    /// same file share one engine.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The entry lock keeps two first connections from opening the same WAL twice.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(run_compactor(engine.clone(), self.compact_threshold));
        metrics::gauge!(TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!("tenant {safe_name} opened");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

/// Keep `[A-Za-z0-9_-]`; the result names a file under the data dir.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe)
}

/// Compact a tenant's WAL whenever enough appends have piled up since the last
/// compaction. Runs for the life of the process.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            debug!("compactor: {appends} appends, below threshold {threshold}");
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            }
            Err(e) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
                warn!("WAL compaction failed: {e}");
            }
        }
    }
}
