use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use portal_core::{DescriptorError, PluginDescriptor, PluginRegistry};
use portal_logging::{portal_info, portal_warn};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read plugin directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("{path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: DescriptorError,
    },
    #[error("{path}: id '{id}' does not match the file name")]
    IdMismatch { path: PathBuf, id: String },
}

/// Outcome of loading a plugin directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<LoadError>,
}

/// Reads `*.ron` plugin descriptors.
pub struct DescriptorLoader;

impl DescriptorLoader {
    /// Loads every descriptor in `dir`, in file-name order.
    ///
    /// Broken files are skipped and listed in the report; only an unreadable
    /// directory fails the whole load.
    pub fn load_dir(dir: &Path) -> Result<(PluginRegistry, LoadReport), LoadError> {
        let entries = fs::read_dir(dir).map_err(|source| LoadError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().is_some_and(|ext| ext == "ron")
            })
            .collect();
        paths.sort();

        let registry = PluginRegistry::new();
        let mut report = LoadReport::default();
        for path in paths {
            match Self::load_file(&path) {
                Ok(descriptor) => {
                    report.loaded.push(descriptor.id.clone());
                    if registry.insert(descriptor).is_some() {
                        portal_warn!("{} replaced an earlier descriptor", path.display());
                    }
                }
                Err(err) => {
                    portal_warn!("skipping plugin file: {}", err);
                    report.skipped.push(err);
                }
            }
        }
        portal_info!(
            "loaded {} plugins from {} ({} skipped)",
            report.loaded.len(),
            dir.display(),
            report.skipped.len()
        );
        Ok((registry, report))
    }

    pub fn load_file(path: &Path) -> Result<PluginDescriptor, LoadError> {
        let text = fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptor: PluginDescriptor =
            ron::from_str(&text).map_err(|err| LoadError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        descriptor.validate().map_err(|source| LoadError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;
        let stem = path.file_stem().and_then(|stem| stem.to_str());
        if stem != Some(descriptor.id.as_str()) {
            return Err(LoadError::IdMismatch {
                path: path.to_path_buf(),
                id: descriptor.id,
            });
        }
        Ok(descriptor)
    }
}
