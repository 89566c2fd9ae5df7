// infrahub-backup/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Creates a GZipped TAR archive from a source directory.
///
/// Paths inside the archive are relative to `source_dir`. The archive is written to a
/// temporary file next to `archive_dest_path` and only renamed into place once it is
/// complete, so a failed run never leaves a partial archive under the final name.
/// An existing file at the destination is never overwritten.
pub fn create_tar_gz_archive(source_dir: &Path, archive_dest_path: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        anyhow::bail!("Source for archival is not a directory: {}", source_dir.display());
    }
    let parent = archive_dest_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).with_context(|| {
        format!("Failed to create parent directory for archive: {}", parent.display())
    })?;

    info!(
        "Creating tar.gz archive from {} to {}",
        source_dir.display(),
        archive_dest_path.display()
    );

    let staged = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create staging file in {}", parent.display()))?;
    let enc = GzEncoder::new(staged, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let name = path.strip_prefix(source_dir).with_context(|| {
            format!("Failed to strip prefix {} from {}", source_dir.display(), path.display())
        })?;

        if name.as_os_str().is_empty() {
            continue;
        }

        // WalkDir already visits children, so directories are added as single entries.
        if entry.file_type().is_dir() {
            tar_builder
                .append_dir(name, path)
                .with_context(|| format!("Failed to append directory {} to archive", path.display()))?;
        } else if entry.file_type().is_file() {
            debug!(entry = %name.display(), "adding to archive");
            tar_builder.append_path_with_name(path, name).with_context(|| {
                format!("Failed to append file {} as {} to archive", path.display(), name.display())
            })?;
        }
    }

    let encoder = tar_builder
        .into_inner()
        .context("Failed to finish tar stream")?;
    let staged = encoder
        .finish()
        .with_context(|| format!("Failed to finish Gzip encoding for archive: {}", archive_dest_path.display()))?;

    staged
        .persist_noclobber(archive_dest_path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move archive into place at {}", archive_dest_path.display()))?;

    info!("✓ Tar.gz archive created successfully at {}", archive_dest_path.display());
    Ok(archive_dest_path.to_path_buf())
}

/// Extracts a GZipped TAR archive to a destination directory.
pub fn extract_tar_gz_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    if !archive_path.is_file() {
        anyhow::bail!("Archive for extraction is not a file: {}", archive_path.display());
    }

    if !extract_to_dir.exists() {
        std::fs::create_dir_all(extract_to_dir).with_context(|| {
            format!("Failed to create extraction directory: {}", extract_to_dir.display())
        })?;
    } else if !extract_to_dir.is_dir() {
        anyhow::bail!(
            "Extraction path exists but is not a directory: {}",
            extract_to_dir.display()
        );
    }

    info!(
        "Extracting tar.gz archive from {} to {}",
        archive_path.display(),
        extract_to_dir.display()
    );

    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let gz_decoder = flate2::read::GzDecoder::new(archive_file);
    let mut archive = tar::Archive::new(gz_decoder);

    archive.unpack(extract_to_dir).with_context(|| {
        format!(
            "Failed to unpack archive {} to {}",
            archive_path.display(),
            extract_to_dir.display()
        )
    })?;

    info!("✓ Tar.gz archive extracted successfully to {}", extract_to_dir.display());
    Ok(extract_to_dir.to_path_buf())
}
