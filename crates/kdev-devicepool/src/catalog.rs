//! Pool catalog: the on-disk record of which volume groups this host
//! has dedicated to kdev, persisted as `device-pool.json`.

use anyhow::{Context, Result};
use kdev_core::model::Pool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

const CATALOG_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    version: String,
    #[serde(default)]
    pools: BTreeMap<String, Pool>,
}

impl Default for CatalogFile {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION.to_string(),
            pools: BTreeMap::new(),
        }
    }
}

/// Reads and writes the pool catalog, rewriting the whole file
/// atomically on every mutation.
pub struct PoolCatalog {
    path: PathBuf,
}

impl PoolCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<CatalogFile> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "pool catalog not found, treating as empty");
            return Ok(CatalogFile::default());
        }
        let data = std::fs::read(&self.path)
            .with_context(|| format!("failed to read pool catalog {}", self.path.display()))?;
        let file: CatalogFile = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse pool catalog {}", self.path.display()))?;
        if file.version != CATALOG_VERSION {
            tracing::warn!(version = %file.version, "unknown pool catalog version");
        }
        Ok(file)
    }

    fn save(&self, file: &CatalogFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("failed to create temp file for pool catalog")?;
        let json = serde_json::to_vec_pretty(file).context("failed to serialize pool catalog")?;
        tmp.write_all(&json).context("failed to write pool catalog")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to replace pool catalog {}", self.path.display()))?;
        Ok(())
    }

    pub fn load_pools(&self) -> Result<BTreeMap<String, Pool>> {
        Ok(self.load()?.pools)
    }

    pub fn get_pool(&self, pool_name: &str) -> Result<Option<Pool>> {
        Ok(self.load()?.pools.remove(pool_name))
    }

    pub fn save_pool(&self, pool: Pool) -> Result<()> {
        let mut file = self.load()?;
        file.pools.insert(pool.pool_name.clone(), pool.clone());
        self.save(&file)?;
        tracing::info!(pool = %pool.pool_name, path = %self.path.display(), "saved pool");
        Ok(())
    }

    /// Returns `true` if the pool existed and was removed.
    pub fn delete_pool(&self, pool_name: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file.pools.remove(pool_name).is_some();
        if removed {
            self.save(&file)?;
            tracing::info!(pool = %pool_name, "deleted pool from catalog");
        } else {
            tracing::warn!(pool = %pool_name, "pool not found in catalog");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pool(name: &str) -> Pool {
        Pool {
            pool_name: name.to_string(),
            device_path: "/dev/sdb".to_string(),
            vg_name: format!("kerneldev-{name}-vg"),
            lv_prefix: "kdev".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            created_by: "tester".to_string(),
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = PoolCatalog::new(dir.path().join("device-pool.json"));
        assert!(catalog.load_pools().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = PoolCatalog::new(dir.path().join("device-pool.json"));
        catalog.save_pool(sample_pool("fstests")).unwrap();

        let pools = catalog.load_pools().unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools["fstests"].vg_name, "kerneldev-fstests-vg");
    }

    #[test]
    fn delete_pool_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = PoolCatalog::new(dir.path().join("device-pool.json"));
        catalog.save_pool(sample_pool("fstests")).unwrap();

        assert!(catalog.delete_pool("fstests").unwrap());
        assert!(catalog.get_pool("fstests").unwrap().is_none());
        assert!(!catalog.delete_pool("fstests").unwrap());
    }

    #[test]
    fn get_pool_returns_none_for_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = PoolCatalog::new(dir.path().join("device-pool.json"));
        assert!(catalog.get_pool("nope").unwrap().is_none());
    }
}
