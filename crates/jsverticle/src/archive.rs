//! Deployable archives (zip) as loading contexts.
//!
//! An [`ArchiveLoader`] reads resources straight out of a zip file and, when
//! a package-style component needs real files, extracts the archive into a
//! sibling directory named after it (`app.zip` → `app/`).

use crate::error::{Error, Result};
use crate::resources::{EntryInfo, ResourceLoader};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Written into the extraction directory; holds the archive's SHA-256.
const STAMP_FILE: &str = ".jsverticle-extracted";

/// An isolating loading context backed by a zip archive on disk.
#[derive(Clone, Debug)]
pub struct ArchiveLoader {
    path: PathBuf,
    extract_to: Option<PathBuf>,
}

impl ArchiveLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extract_to: None,
        }
    }

    /// Extract into `dir` instead of the directory next to the archive.
    pub fn with_extract_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extract_to = Some(dir.into());
        self
    }

    /// Where [`ResourceLoader::materialize`] puts the archive contents.
    pub fn extract_dir(&self) -> PathBuf {
        self.extract_to
            .clone()
            .unwrap_or_else(|| self.path.with_extension(""))
    }

    fn open(&self) -> Result<zip::ZipArchive<File>> {
        let file = File::open(&self.path)
            .map_err(|err| Error::resource(self.path.display().to_string(), err))?;
        zip::ZipArchive::new(file).map_err(|err| Error::archive(&self.path, err))
    }
}

impl ResourceLoader for ArchiveLoader {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut archive = self.open()?;
        let mut file = match archive.by_name(name) {
            Ok(file) if !file.is_dir() => file,
            Ok(_) | Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(Error::archive(&self.path, err)),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|err| Error::resource(name, err))?;
        Ok(Some(buf))
    }

    fn entry(&self, name: &str) -> Result<Option<EntryInfo>> {
        let mut archive = self.open()?;
        let bare = name.trim_end_matches('/');
        for candidate in [bare.to_string(), format!("{bare}/")] {
            match archive.by_name(&candidate) {
                Ok(file) if file.is_dir() => return Ok(Some(EntryInfo::directory())),
                Ok(file) => return Ok(Some(EntryInfo::file(file.size()))),
                Err(zip::result::ZipError::FileNotFound) => {}
                Err(err) => return Err(Error::archive(&self.path, err)),
            }
        }
        // Archives written without explicit directory entries.
        let prefix = format!("{bare}/");
        let implicit = archive.file_names().any(|entry| entry.starts_with(&prefix));
        Ok(implicit.then(EntryInfo::directory))
    }

    fn archive(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn materialize(&self) -> Result<PathBuf> {
        let dest = self.extract_dir();
        extract(&self.path, &dest)?;
        Ok(dest)
    }

    fn is_isolating(&self) -> bool {
        true
    }

    fn resolve_path(&self, name: &str) -> String {
        format!("{}!/{name}", self.path.display())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Extract `archive` into `dest`.
///
/// Skipped when `dest` already holds an extraction of identical archive
/// bytes. Entries that would land outside `dest` are rejected.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let bytes =
        std::fs::read(archive).map_err(|err| Error::resource(archive.display().to_string(), err))?;
    let digest = hex_encode(&Sha256::digest(&bytes));

    let stamp = dest.join(STAMP_FILE);
    if std::fs::read_to_string(&stamp).is_ok_and(|existing| existing.trim() == digest) {
        log::debug!("{} already extracted to {}", archive.display(), dest.display());
        return Ok(());
    }

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|err| Error::archive(archive, err))?;
    std::fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(|err| Error::archive(archive, err))?;
        let Some(relative) = file.enclosed_name() else {
            return Err(Error::InvalidName(file.name().to_string()));
        };
        let out_path = dest.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|err| Error::resource(file.name().to_string(), err))?;
        std::fs::write(&out_path, &buf)?;
    }

    std::fs::write(&stamp, &digest)?;
    log::info!("extracted {} to {}", archive.display(), dest.display());
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Build a zip archive in memory (tests, tooling).
#[derive(Default)]
pub struct ArchiveBuilder {
    entries: Vec<(String, Option<Vec<u8>>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file entry.
    pub fn add_file(mut self, name: &str, content: impl AsRef<[u8]>) -> Self {
        self.entries
            .push((name.to_string(), Some(content.as_ref().to_vec())));
        self
    }

    /// Add an explicit directory entry.
    pub fn add_directory(mut self, name: &str) -> Self {
        self.entries.push((name.to_string(), None));
        self
    }

    /// Build the archive and return its bytes.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            let builder_err = |err| Error::archive("<memory>", err);

            for (name, content) in &self.entries {
                match content {
                    Some(content) => {
                        writer.start_file(name.as_str(), options).map_err(builder_err)?;
                        writer.write_all(content)?;
                    }
                    None => writer.add_directory(name.as_str(), options).map_err(builder_err)?,
                }
            }
            writer.finish().map_err(builder_err)?;
        }
        Ok(buf)
    }

    /// Build the archive and write it to `path`.
    pub fn write_to(self, path: &Path) -> Result<()> {
        let bytes = self.build()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}
