use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use drydock_file::{File, FileAction};

use crate::{FileFetchContext, Source, SourceId, SourceSet};

/// The built-in `files` source: a plain, fixed list of files fetched and
/// applied per their own `FileAction`.
#[derive(Debug, Clone)]
pub struct FilesSource {
    pub name: String,
    pub files: Vec<File>,
}

impl FilesSource {
    pub fn new(name: impl Into<String>, files: Vec<File>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }
}

impl Source for FilesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            bail!("files source {} has no files configured", self.name);
        }
        Ok(())
    }

    fn fetch(
        &self,
        _source_set: &SourceSet,
        dest: &Path,
        fetch_ctx: &dyn FileFetchContext,
    ) -> Result<()> {
        std::fs::create_dir_all(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;

        let scratch_root = dest.join(".fetch");
        for file in &self.files {
            let scratch = scratch_root.join(sanitize_location(&file.location));
            if let Some(parent) = scratch.parent() {
                fs::create_dir_all(parent)?;
            }
            fetch_ctx
                .fetch_and_verify(file, &scratch)
                .with_context(|| format!("failed to fetch {}/{}", file.server, file.location))?;
            apply_file(file, &scratch, dest).with_context(|| {
                format!(
                    "failed to apply {}/{} ({:?}) into {}",
                    file.server,
                    file.location,
                    file.action,
                    dest.display()
                )
            })?;
        }
        let _ = fs::remove_dir_all(&scratch_root);
        Ok(())
    }

    fn update(
        &self,
        _source_set: &SourceSet,
        _dest: &Path,
        _fetch_ctx: &dyn FileFetchContext,
    ) -> Result<()> {
        Ok(())
    }

    fn prepare(
        &self,
        source_set: &SourceSet,
        dest: &Path,
        fetch_ctx: &dyn FileFetchContext,
    ) -> Result<()> {
        self.fetch(source_set, dest, fetch_ctx)
    }

    fn display(&self) -> String {
        format!("files:{} ({} file(s))", self.name, self.files.len())
    }

    fn source_id(
        &self,
        _source_set: &SourceSet,
        dest: &Path,
        fetch_ctx: &dyn FileFetchContext,
    ) -> Result<SourceId> {
        let mut hasher = drydock_hash::Hasher::new();
        hasher.hash_line("files");
        hasher.hash_line(&self.name);
        let scratch_root = dest.join(".fileid-scratch");
        for file in &self.files {
            let computed = if file.sha1.is_some() || file.sha256.is_some() {
                None
            } else {
                let scratch = scratch_root.join(sanitize_location(&file.location));
                if let Some(parent) = scratch.parent() {
                    fs::create_dir_all(parent)?;
                }
                Some(fetch_ctx.resolve_content_checksum(file, &scratch)?)
            };
            let id = file.file_id(|name| fetch_ctx.licence_id_of(name), computed.as_deref())?;
            hasher.hash_line(&id.to_hex());
        }
        let _ = fs::remove_dir_all(&scratch_root);
        Ok(hasher.finish())
    }

    fn working_copy_available(&self, dest: &Path) -> bool {
        dest.exists()
    }

    fn check_working_copy(&self, _dest: &Path) -> Result<()> {
        Ok(())
    }
}

/// Turn a possibly-slashed location into a single path segment, so a fetch
/// scratch tree never escapes its own directory.
fn sanitize_location(location: &str) -> String {
    location.replace(['/', '\\'], "_")
}

fn apply_file(file: &File, fetched: &Path, dest: &Path) -> Result<()> {
    match file.action {
        FileAction::Unpack => unpack_archive(fetched, dest),
        FileAction::Copy => {
            let name = Path::new(&file.location)
                .file_name()
                .with_context(|| format!("file location {} has no file name", file.location))?;
            fs::copy(fetched, dest.join(name)).with_context(|| {
                format!("failed to copy {} into {}", file.location, dest.display())
            })?;
            Ok(())
        }
        FileAction::Patch => {
            let status = Command::new("patch")
                .arg("-p1")
                .arg("-i")
                .arg(fetched)
                .current_dir(dest)
                .status()
                .context("failed to spawn patch")?;
            if !status.success() {
                bail!("patch {} failed to apply cleanly", file.location);
            }
            Ok(())
        }
    }
}

fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let opened = fs::File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let lower = archive_path.to_string_lossy().to_lowercase();
    if lower.ends_with(".gz") || lower.ends_with(".tgz") {
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(opened));
        tar.unpack(dest)
            .with_context(|| format!("failed to unpack {}", archive_path.display()))
    } else {
        let mut tar = tar::Archive::new(opened);
        tar.unpack(dest)
            .with_context(|| format!("failed to unpack {}", archive_path.display()))
    }
}
