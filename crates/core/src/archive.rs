use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::ignore_filter::compute_included_files;
use crate::{Error, Result};

pub fn archive_file_name(bundle_id: &str) -> String {
    format!("{bundle_id}.tar.gz")
}

/// Packs the included files of `project_dir` into `<out_dir>/<bundle_id>.tar.gz`.
///
/// Entries are stored relative to the project root in sorted order. Blocking.
pub fn build_archive(project_dir: &Path, out_dir: &Path, bundle_id: &str) -> Result<PathBuf> {
    let started = Instant::now();
    let included = compute_included_files(project_dir)?;

    std::fs::create_dir_all(out_dir).map_err(|e| Error::filesystem(out_dir, e))?;
    let path = out_dir.join(archive_file_name(bundle_id));
    let file = File::create(&path).map_err(|e| Error::filesystem(&path, e))?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(true);
    for rel in &included {
        let source = project_dir.join(rel);
        builder
            .append_path_with_name(&source, rel)
            .map_err(|e| Error::filesystem(&source, e))?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|e| Error::filesystem(&path, e))?;
    encoder.finish().map_err(|e| Error::filesystem(&path, e))?;

    debug!(
        event = "archive.finish",
        path = %path.display(),
        files = included.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "archive.finish"
    );
    Ok(path)
}
