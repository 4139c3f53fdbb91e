// SPDX-License-Identifier: Apache-2.0

//! YAML configuration parser with strict schema validation.
//!
//! Any invalid field results in a HardValidationError that prevents startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{HardValidationError, WorkerError, WorkerResult};

/// Default location of the package-size catalog.
const DEFAULT_PACKAGE_SIZES_PATH: &str = "/ol/open-lambda/worker/cache-manager/package_sizes.txt";

/// Raw configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    worker: RawWorkerConfig,
}

#[derive(Debug, Deserialize)]
struct RawWorkerConfig {
    #[serde(default = "default_cluster_name")]
    cluster_name: String,
    #[serde(default = "default_import_cache_mb")]
    import_cache_mb: u64,
    #[serde(default = "default_package_sizes_path")]
    package_sizes_path: String,
    #[serde(default)]
    handler_lru_capacity: usize,
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_import_cache_mb() -> u64 {
    512
}

fn default_package_sizes_path() -> String {
    DEFAULT_PACKAGE_SIZES_PATH.to_string()
}

impl Default for RawWorkerConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            import_cache_mb: default_import_cache_mb(),
            package_sizes_path: default_package_sizes_path(),
            handler_lru_capacity: 0,
        }
    }
}

/// Validated worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub cluster_name: String,
    /// Soft memory budget for the import cache, in megabytes.
    /// Zero disables the import cache entirely.
    pub import_cache_mb: u64,
    pub package_sizes_path: PathBuf,
    /// Bound on the paused-handler set; zero means unbounded.
    pub handler_lru_capacity: usize,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> WorkerResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(WorkerError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| WorkerError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> WorkerResult<Config> {
        let raw: RawConfig = serde_yaml::from_str(content).map_err(|e| WorkerError::ConfigParse {
            message: format!("YAML parse error: {}", e),
        })?;

        Self::validate(raw.worker)
    }

    fn validate(raw: RawWorkerConfig) -> WorkerResult<Config> {
        if raw.cluster_name.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "cluster_name",
                value: raw.cluster_name,
                reason: "cluster name cannot be empty".to_string(),
            }
            .into());
        }

        // max 1 TB
        const MAX_IMPORT_CACHE_MB: u64 = 1024 * 1024;
        if raw.import_cache_mb > MAX_IMPORT_CACHE_MB {
            return Err(HardValidationError::InvalidFieldValue {
                field: "import_cache_mb",
                value: raw.import_cache_mb.to_string(),
                reason: format!("must not exceed {} MB", MAX_IMPORT_CACHE_MB),
            }
            .into());
        }

        if raw.package_sizes_path.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "package_sizes_path",
                value: raw.package_sizes_path,
                reason: "path cannot be empty".to_string(),
            }
            .into());
        }

        Ok(Config {
            cluster_name: raw.cluster_name,
            import_cache_mb: raw.import_cache_mb,
            package_sizes_path: PathBuf::from(raw.package_sizes_path),
            handler_lru_capacity: raw.handler_lru_capacity,
        })
    }
}
