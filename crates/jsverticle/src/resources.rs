//! Loading contexts: where component sources and bundled scripts come from.
//!
//! A [`ResourceLoader`] resolves slash-separated resource names to bytes and
//! answers the archive questions package detection needs (does an entry
//! exist, is it a directory, how large is it, can the whole thing be put on
//! disk).

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Name of the module loader bootstrap script.
pub const MODULE_LOADER: &str = "vertx-js/util/module-loader.js";
/// Name of the Node compatibility layer used by the isolated runtime.
pub const NODE_COMPAT: &str = "vertx-js/node/compat.js";

const BUNDLED: &[(&str, &str)] = &[
    (
        MODULE_LOADER,
        include_str!("../js/vertx-js/util/module-loader.js"),
    ),
    ("vertx-js/future.js", include_str!("../js/vertx-js/future.js")),
    ("vertx-js/vertx.js", include_str!("../js/vertx-js/vertx.js")),
    (
        "vertx-js/util/console.js",
        include_str!("../js/vertx-js/util/console.js"),
    ),
    (NODE_COMPAT, include_str!("../js/vertx-js/node/compat.js")),
];

/// Existence and shape of one entry in a loading context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub is_dir: bool,
    pub size: u64,
}

impl EntryInfo {
    pub fn file(size: u64) -> Self {
        Self {
            is_dir: false,
            size,
        }
    }

    pub fn directory() -> Self {
        Self {
            is_dir: true,
            size: 0,
        }
    }
}

/// A context that resolves named resources for a component.
pub trait ResourceLoader: Send + Sync + 'static {
    /// Read a resource by name. `Ok(None)` when it does not exist.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Look up an entry, file or directory, without reading it.
    fn entry(&self, name: &str) -> Result<Option<EntryInfo>>;

    /// The archive containing this context's resources, if any.
    fn archive(&self) -> Option<&Path> {
        None
    }

    /// Make every resource available as an ordinary file and return the
    /// directory that holds them.
    fn materialize(&self) -> Result<PathBuf>;

    /// Whether this context deploys a component in isolation from others.
    /// Only isolating contexts are considered for the isolated runtime.
    fn is_isolating(&self) -> bool {
        false
    }

    /// Location of a resource, for diagnostics.
    fn resolve_path(&self, name: &str) -> String {
        format!("{}/{name}", self.describe())
    }

    /// Short human-readable description of the context.
    fn describe(&self) -> String;
}

impl fmt::Debug for dyn ResourceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Scripts compiled into the crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct BundledResources;

impl BundledResources {
    fn lookup(name: &str) -> Option<&'static str> {
        BUNDLED
            .iter()
            .find(|(entry, _)| *entry == name)
            .map(|(_, source)| *source)
    }
}

impl ResourceLoader for BundledResources {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(Self::lookup(name).map(|source| source.as_bytes().to_vec()))
    }

    fn entry(&self, name: &str) -> Result<Option<EntryInfo>> {
        if let Some(source) = Self::lookup(name) {
            return Ok(Some(EntryInfo::file(source.len() as u64)));
        }
        let prefix = format!("{}/", name.trim_end_matches('/'));
        let is_dir = BUNDLED.iter().any(|(entry, _)| entry.starts_with(&prefix));
        Ok(is_dir.then(EntryInfo::directory))
    }

    fn materialize(&self) -> Result<PathBuf> {
        Err(Error::NotMaterializable(self.describe()))
    }

    fn resolve_path(&self, name: &str) -> String {
        format!("bundled:{name}")
    }

    fn describe(&self) -> String {
        "bundled".to_string()
    }
}

/// Resources read from a directory tree.
#[derive(Clone, Debug)]
pub struct DirectoryLoader {
    root: PathBuf,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        let normalized = normalize_name(name)?;
        Ok(self.root.join(normalized))
    }
}

impl ResourceLoader for DirectoryLoader {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(name)?;
        if !path.is_file() {
            return Ok(None);
        }
        std::fs::read(&path)
            .map(Some)
            .map_err(|err| Error::resource(path.display().to_string(), err))
    }

    fn entry(&self, name: &str) -> Result<Option<EntryInfo>> {
        let path = self.path_of(name)?;
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(Some(EntryInfo::directory())),
            Ok(meta) => Ok(Some(EntryInfo::file(meta.len()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::resource(path.display().to_string(), err)),
        }
    }

    fn materialize(&self) -> Result<PathBuf> {
        Ok(self.root.clone())
    }

    fn resolve_path(&self, name: &str) -> String {
        self.root.join(name).display().to_string()
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Resources held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryLoader {
    files: BTreeMap<String, Vec<u8>>,
    isolating: bool,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn with_file(mut self, name: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files
            .insert(name.trim_start_matches('/').to_string(), content.into());
        self
    }

    /// Mark the context as isolating.
    pub fn isolating(mut self, isolating: bool) -> Self {
        self.isolating = isolating;
        self
    }
}

impl ResourceLoader for MemoryLoader {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get(name).cloned())
    }

    fn entry(&self, name: &str) -> Result<Option<EntryInfo>> {
        if let Some(content) = self.files.get(name) {
            return Ok(Some(EntryInfo::file(content.len() as u64)));
        }
        let prefix = format!("{}/", name.trim_end_matches('/'));
        let is_dir = self.files.keys().any(|key| key.starts_with(&prefix));
        Ok(is_dir.then(EntryInfo::directory))
    }

    fn materialize(&self) -> Result<PathBuf> {
        Err(Error::NotMaterializable(self.describe()))
    }

    fn is_isolating(&self) -> bool {
        self.isolating
    }

    fn resolve_path(&self, name: &str) -> String {
        format!("memory:{name}")
    }

    fn describe(&self) -> String {
        format!("memory({} files)", self.files.len())
    }
}

/// Collapse `.` and `..` segments and backslashes in a resource name.
///
/// Leading separators are dropped; a name that climbs above the root is
/// rejected.
pub fn normalize_name(name: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::InvalidName(name.to_string()));
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(parts.join("/"))
}

/// Remove a `scheme:` deployment prefix, if present.
pub fn strip_prefix(identifier: &str) -> &str {
    match identifier.split_once(':') {
        Some((_, rest)) => rest,
        None => identifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bundled_contains_bootstrap_scripts() {
        let bundled = BundledResources;
        assert!(bundled.read(MODULE_LOADER).unwrap().is_some());
        assert!(bundled.read("vertx-js/future.js").unwrap().is_some());
        assert!(bundled.read("vertx-js/missing.js").unwrap().is_none());
        assert_eq!(
            bundled.entry("vertx-js/util").unwrap(),
            Some(EntryInfo::directory())
        );
        assert!(bundled.materialize().is_err());
    }

    #[test]
    fn bundled_paths_are_labelled() {
        assert_eq!(
            BundledResources.resolve_path(MODULE_LOADER),
            "bundled:vertx-js/util/module-loader.js"
        );
    }

    #[test]
    fn memory_loader_reports_files_and_implicit_dirs() {
        let loader = MemoryLoader::new()
            .with_file("package.json", "{}")
            .with_file("node_modules/left-pad/index.js", "module.exports = 1;");
        assert_eq!(loader.entry("package.json").unwrap(), Some(EntryInfo::file(2)));
        assert_eq!(
            loader.entry("node_modules").unwrap(),
            Some(EntryInfo::directory())
        );
        assert_eq!(loader.entry("lib").unwrap(), None);
        assert!(!loader.is_isolating());
        assert!(loader.clone().isolating(true).is_isolating());
    }

    #[test]
    fn directory_loader_reads_and_inspects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/a.js"), "exports.a = 1;").unwrap();

        let loader = DirectoryLoader::new(dir.path());
        assert_eq!(
            loader.read("lib/a.js").unwrap().as_deref(),
            Some(&b"exports.a = 1;"[..])
        );
        assert!(loader.read("lib/b.js").unwrap().is_none());
        assert!(loader.read("lib").unwrap().is_none());
        assert_eq!(loader.entry("lib").unwrap(), Some(EntryInfo::directory()));
        assert_eq!(loader.entry("lib/a.js").unwrap(), Some(EntryInfo::file(14)));
        assert_eq!(loader.materialize().unwrap(), dir.path());
    }

    #[test]
    fn directory_loader_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DirectoryLoader::new(dir.path());
        assert!(matches!(
            loader.read("../etc/passwd"),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn normalize_collapses_segments() {
        assert_eq!(normalize_name("a/./b/../c.js").unwrap(), "a/c.js");
        assert_eq!(normalize_name("/abs//path.js").unwrap(), "abs/path.js");
        assert_eq!(normalize_name("dir\\file.js").unwrap(), "dir/file.js");
        assert!(normalize_name("../up.js").is_err());
        assert!(normalize_name("a/../../up.js").is_err());
        assert!(normalize_name("./").is_err());
    }

    #[test]
    fn strip_prefix_removes_scheme() {
        assert_eq!(strip_prefix("js:app/main.js"), "app/main.js");
        assert_eq!(strip_prefix("app/main.js"), "app/main.js");
    }

    proptest! {
        #[test]
        fn normalized_names_are_canonical(parts in prop::collection::vec("[a-z]{1,6}", 1..6)) {
            let joined = parts.join("/./");
            let normalized = normalize_name(&joined).unwrap();
            prop_assert_eq!(&normalized, &parts.join("/"));
            prop_assert_eq!(normalize_name(&normalized).unwrap(), normalized.clone());
            prop_assert!(!normalized.split('/').any(|p| p == ".." || p == "." || p.is_empty()));
        }
    }
}
