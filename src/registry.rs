//! Site registry: which sites exist and which database file backs each.
//!
//! Persisted as `shaft_list.json` in the data directory. A broken or
//! missing file never stops the service; it falls back to the default
//! site list. All file access goes through `tokio::fs` so callers may
//! hold the registry lock across it without stalling the runtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{error, info, warn};

use crate::error::ConfigError;

// ---

pub const REGISTRY_FILE: &str = "shaft_list.json";

pub const DEFAULT_SITES: [&str; 5] = ["K3", "Saffy", "Rowland", "EPL3", "Glencore"];

/// Database file name for a site: `sentinel_<lowercase, spaces as _>.db`.
pub fn database_file_name(site: &str) -> String {
    format!("sentinel_{}.db", site.trim().to_lowercase().replace(' ', "_"))
}

fn default_sites() -> BTreeMap<String, String> {
    // ---
    DEFAULT_SITES
        .iter()
        .map(|s| (s.to_string(), database_file_name(s)))
        .collect()
}

#[derive(Debug, Clone)]
pub struct SiteRegistry {
    // ---
    path: PathBuf,
    data_dir: PathBuf,
    sites: BTreeMap<String, String>,
}

impl SiteRegistry {
    // ---
    /// Load the registry from `data_dir`.
    ///
    /// Tries UTF-8 first, then Latin-1 (re-saving as UTF-8 when that
    /// works). Anything else yields the default sites, written back to disk.
    pub async fn load(data_dir: &Path) -> Self {
        // ---
        let path = data_dir.join(REGISTRY_FILE);
        let mut registry = SiteRegistry {
            path,
            data_dir: data_dir.to_path_buf(),
            sites: BTreeMap::new(),
        };

        match fs::read(&registry.path).await {
            Ok(bytes) => {
                if let Some(sites) = parse_utf8(&bytes) {
                    registry.sites = sites;
                    info!("Loaded {} sites from {}", registry.sites.len(), registry.path.display());
                    return registry;
                }
                if let Some(sites) = parse_latin1(&bytes) {
                    warn!("Site registry was not valid UTF-8, recovered as Latin-1");
                    registry.sites = sites;
                    if let Err(e) = registry.save().await {
                        error!("Failed to re-save recovered registry: {}", e);
                    }
                    return registry;
                }
                error!(
                    "Site registry {} is unreadable, using default sites",
                    registry.path.display()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No site registry found, creating default sites");
            }
            Err(e) => {
                error!("Cannot read site registry: {}, using default sites", e);
            }
        }

        registry.sites = default_sites();
        if let Err(e) = registry.save().await {
            error!("Failed to write default registry: {}", e);
        }
        registry
    }

    /// Persist the registry, keeping a `.backup` copy of the previous file.
    ///
    /// If the write fails the previous contents are restored from the backup.
    pub async fn save(&self) -> Result<(), ConfigError> {
        // ---
        let json = serde_json::to_string_pretty(&self.sites)
            .map_err(|e| ConfigError::Registry(e.to_string()))?;

        let backup = self.backup_path();
        let had_previous = fs::try_exists(&self.path).await.unwrap_or(false);
        if had_previous {
            fs::copy(&self.path, &backup).await.map_err(|e| {
                ConfigError::Registry(format!("cannot back up registry: {e}"))
            })?;
        }

        if let Err(e) = fs::write(&self.path, json).await {
            error!("Failed to write site registry: {}", e);
            if had_previous {
                match fs::copy(&backup, &self.path).await {
                    Ok(_) => info!("Site registry restored from backup"),
                    Err(restore) => error!("Failed to restore site registry: {}", restore),
                }
            }
            return Err(ConfigError::Registry(e.to_string()));
        }
        Ok(())
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    pub fn sites(&self) -> &BTreeMap<String, String> {
        &self.sites
    }

    pub fn names(&self) -> Vec<String> {
        self.sites.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn contains(&self, site: &str) -> bool {
        self.sites.contains_key(site)
    }

    pub fn database_path(&self, site: &str) -> Result<PathBuf, ConfigError> {
        // ---
        self.sites
            .get(site)
            .map(|file| self.data_dir.join(file))
            .ok_or_else(|| ConfigError::UnknownSite(site.to_string()))
    }

    /// Resolve the selected site to its database path.
    pub fn resolve(&self, site: Option<&str>) -> Result<(String, PathBuf), ConfigError> {
        // ---
        let site = site
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::NoSiteSelected)?;
        Ok((site.to_string(), self.database_path(site)?))
    }

    /// Register a new site and persist the registry.
    pub async fn add_site(&mut self, name: &str) -> Result<(String, PathBuf), ConfigError> {
        // ---
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptySiteName);
        }
        if self.sites.contains_key(name) {
            return Err(ConfigError::SiteExists(name.to_string()));
        }

        let file = database_file_name(name);
        self.sites.insert(name.to_string(), file.clone());
        if let Err(e) = self.save().await {
            self.sites.remove(name);
            return Err(e);
        }

        info!("Added site {} ({})", name, file);
        Ok((name.to_string(), self.data_dir.join(file)))
    }

    /// Unregister a site, optionally deleting its database file.
    ///
    /// Callers must close any open pool on the file before deleting data.
    pub async fn remove_site(
        &mut self,
        name: &str,
        delete_data: bool,
    ) -> Result<PathBuf, ConfigError> {
        // ---
        let file = self
            .sites
            .remove(name)
            .ok_or_else(|| ConfigError::UnknownSite(name.to_string()))?;
        if let Err(e) = self.save().await {
            self.sites.insert(name.to_string(), file);
            return Err(e);
        }

        let path = self.data_dir.join(&file);
        if delete_data {
            match fs::remove_file(&path).await {
                Ok(()) => info!("Deleted database {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Site removed but database {} kept: {}", path.display(), e),
            }
        }

        info!("Removed site {}", name);
        Ok(path)
    }
}

fn parse_utf8(bytes: &[u8]) -> Option<BTreeMap<String, String>> {
    // ---
    let text = std::str::from_utf8(bytes).ok()?;
    serde_json::from_str(text).ok()
}

fn parse_latin1(bytes: &[u8]) -> Option<BTreeMap<String, String>> {
    // ---
    let text: String = bytes.iter().map(|&b| b as char).collect();
    serde_json::from_str(&text).ok()
}
