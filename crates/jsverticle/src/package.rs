//! Package-style component detection.
//!
//! A loading context holds a package-style component when it carries a
//! `package.json` and either a `node_modules` entry (a directory, or an empty
//! marker file) or a manifest declaring `engines.node`. Detecting a package
//! puts its files on disk for the isolated runtime.

use crate::resources::ResourceLoader;
use serde_json::Value;
use std::path::PathBuf;

pub const MANIFEST: &str = "package.json";
pub const DEPENDENCY_DIR: &str = "node_modules";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PackageKind {
    /// An ordinary single-module component.
    Script,
    /// A package, materialized under `root`.
    Package { root: PathBuf },
}

impl PackageKind {
    pub fn is_package(&self) -> bool {
        matches!(self, Self::Package { .. })
    }
}

/// Classify the component held by `loader`.
///
/// Never fails: unreadable manifests, lookup errors and failed
/// materialization all classify as [`PackageKind::Script`].
pub fn detect(loader: &dyn ResourceLoader) -> PackageKind {
    let manifest = match loader.read(MANIFEST) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return PackageKind::Script,
        Err(err) => {
            log::warn!("cannot read {MANIFEST} from {}: {err}", loader.describe());
            return PackageKind::Script;
        }
    };

    if !(has_dependency_dir(loader) || declares_node_engine(&manifest)) {
        return PackageKind::Script;
    }

    match loader.materialize() {
        Ok(root) => {
            log::debug!("{} is a package, materialized at {}", loader.describe(), root.display());
            PackageKind::Package { root }
        }
        Err(err) => {
            log::warn!("cannot materialize package {}: {err}", loader.describe());
            PackageKind::Script
        }
    }
}

fn has_dependency_dir(loader: &dyn ResourceLoader) -> bool {
    match loader.entry(DEPENDENCY_DIR) {
        Ok(Some(entry)) => entry.is_dir || entry.size == 0,
        Ok(None) => false,
        Err(err) => {
            log::warn!("cannot inspect {DEPENDENCY_DIR} in {}: {err}", loader.describe());
            false
        }
    }
}

fn declares_node_engine(manifest: &[u8]) -> bool {
    match serde_json::from_slice::<Value>(manifest) {
        Ok(json) => json
            .get("engines")
            .and_then(Value::as_object)
            .is_some_and(|engines| engines.contains_key("node")),
        Err(err) => {
            log::warn!("invalid {MANIFEST}: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveBuilder, ArchiveLoader};
    use crate::resources::{DirectoryLoader, MemoryLoader};

    #[test]
    fn no_manifest_is_a_script() {
        let loader = MemoryLoader::new()
            .with_file("node_modules/x/index.js", "")
            .with_file("main.js", "");
        assert_eq!(detect(&loader), PackageKind::Script);
    }

    #[test]
    fn non_empty_dependency_file_is_a_script() {
        let loader = MemoryLoader::new()
            .with_file(MANIFEST, r#"{"name": "app"}"#)
            .with_file(DEPENDENCY_DIR, "not a directory");
        assert_eq!(detect(&loader), PackageKind::Script);
    }

    #[test]
    fn engines_without_node_is_a_script() {
        let loader = MemoryLoader::new().with_file(MANIFEST, r#"{"engines": {"npm": ">=6"}}"#);
        assert_eq!(detect(&loader), PackageKind::Script);
    }

    #[test]
    fn invalid_manifest_is_a_script() {
        let loader = MemoryLoader::new().with_file(MANIFEST, "{ nope");
        assert_eq!(detect(&loader), PackageKind::Script);
    }

    #[test]
    fn unmaterializable_package_falls_back_to_script() {
        let loader = MemoryLoader::new()
            .with_file(MANIFEST, r#"{"engines": {"node": ">=18"}}"#);
        assert_eq!(detect(&loader), PackageKind::Script);
    }

    #[test]
    fn engines_node_in_archive_is_a_package() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.zip");
        ArchiveBuilder::new()
            .add_file(MANIFEST, r#"{"engines": {"node": ">=18"}}"#)
            .add_file("server.js", "")
            .write_to(&path)
            .unwrap();
        let kind = detect(&ArchiveLoader::new(&path));
        assert_eq!(
            kind,
            PackageKind::Package {
                root: dir.path().join("svc")
            }
        );
        assert!(dir.path().join("svc/server.js").is_file());
    }

    #[test]
    fn empty_dependency_marker_is_a_package() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.zip");
        ArchiveBuilder::new()
            .add_file(MANIFEST, "{}")
            .add_file(DEPENDENCY_DIR, "")
            .write_to(&path)
            .unwrap();
        assert!(detect(&ArchiveLoader::new(&path)).is_package());
    }

    #[test]
    fn dependency_directory_on_disk_is_a_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST), "{}").unwrap();
        std::fs::create_dir(dir.path().join(DEPENDENCY_DIR)).unwrap();
        assert_eq!(
            detect(&DirectoryLoader::new(dir.path())),
            PackageKind::Package {
                root: dir.path().to_path_buf()
            }
        );
    }
}
