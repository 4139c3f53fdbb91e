//! Package-size catalog.

use std::collections::HashMap;
use std::path::Path;

use crate::error::CacheError;
use crate::types::PackageName;

/// Estimated on-import RSS cost per package, keyed by lowercased name.
///
/// Loaded once at startup and immutable afterwards.
#[derive(Debug, Default)]
pub struct PackageSizes {
    sizes: HashMap<PackageName, f64>,
}

impl PackageSizes {
    /// Load the catalog from `path`.
    ///
    /// A missing file degrades to an empty catalog (every size reads as
    /// zero); a malformed line aborts loading.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "package size catalog unavailable, using 0 for all"
                );
                return Ok(Self::default());
            }
        };

        let mut sizes = HashMap::new();
        for (idx, line) in content.lines().enumerate() {
            let malformed = |reason: String| CacheError::CatalogMalformed {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            };

            let (name, size) = line
                .split_once(':')
                .ok_or_else(|| malformed("expected name:size".to_string()))?;
            let size: u64 = size
                .parse()
                .map_err(|e| malformed(format!("bad size: {e}")))?;
            let name = PackageName::new(name).map_err(|e| malformed(e.to_string()))?;
            sizes.insert(name, size as f64);
        }

        tracing::debug!(path = %path.display(), entries = sizes.len(), "package size catalog loaded");
        Ok(Self { sizes })
    }

    /// Size estimate for `package`; unknown packages cost zero.
    pub fn get(&self, package: &PackageName) -> f64 {
        self.sizes.get(package).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}
