//! Run work directory layout and tarball packaging.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::info;
use wapmetrics_core::{Result, WapmError};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const FINDINGS_FILE: &str = "findings.json";
pub const SUMMARY_FILE: &str = "summary.md";

/// Pretty-printed JSON, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Absolute, `.`/`..`-free form of `path`. Symlinks are resolved on the
/// longest prefix that exists, so paths that do not exist yet still
/// compare equal to their canonical siblings.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    let mut missing = Vec::new();
    let mut existing = normalized.clone();
    loop {
        if let Ok(mut resolved) = fs::canonicalize(&existing) {
            resolved.extend(missing.iter().rev());
            return Ok(resolved);
        }
        let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
            return Ok(normalized);
        };
        if !existing.pop() {
            return Ok(normalized);
        }
        missing.push(name);
    }
}

/// Reject a bundle path that would land inside the directory it packages.
pub fn check_bundle_path(work_dir: &Path, out: &Path) -> Result<()> {
    if resolve_path(out)?.starts_with(resolve_path(work_dir)?) {
        return Err(WapmError::ConfigInvalid(format!(
            "bundle path {} must be outside the work directory {}",
            out.display(),
            work_dir.display()
        )));
    }
    Ok(())
}

/// Package `work_dir` into a gzip-compressed tarball at `out`.
pub fn package_dir(work_dir: &Path, out: &Path) -> Result<PathBuf> {
    check_bundle_path(work_dir, out)?;
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(out)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", work_dir)?;
    builder.into_inner()?.finish()?;

    info!(bundle = %out.display(), "Packaged run bundle");
    Ok(out.to_path_buf())
}

/// Entry paths of a bundle, for inspection.
pub fn list_bundle(path: &Path) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        if !name.is_empty() {
            entries.push(name);
        }
    }
    Ok(entries)
}
