use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use drydock_environment::Environment;

use crate::{FileFetchContext, Source, SourceId, SourceSet};

/// The built-in `git` source.
#[derive(Debug, Clone)]
pub struct GitSource {
    pub name: String,
    pub url: String,
    pub server: String,
    pub location: String,
    /// Whether this source is allowed to build from a dirty, uncommitted
    /// working copy (`SourceSet::WorkingCopy`).
    pub working: bool,
    pub licences: Vec<String>,
    pub env: Environment,
}

impl GitSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            server: String::new(),
            location: String::new(),
            working: false,
            licences: Vec::new(),
            env: Environment::new(),
        }
    }

    /// Name of the `git` binary to invoke. Overridable via `DRYDOCK_GIT_BIN`
    /// so tests can substitute a fake binary without touching a real
    /// repository.
    fn git_program() -> String {
        std::env::var("DRYDOCK_GIT_BIN").unwrap_or_else(|_| "git".to_string())
    }

    fn run(&self, dest: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(Self::git_program())
            .args(args)
            .current_dir(dest)
            .output()
            .with_context(|| format!("failed to spawn {}", Self::git_program()))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn resolve_ref(&self, dest: &Path, source_set: &SourceSet) -> Result<String> {
        let rev = match source_set {
            SourceSet::Branch(name) => format!("refs/heads/{name}"),
            SourceSet::Tag(name) => format!("refs/tags/{name}"),
            SourceSet::Release | SourceSet::WorkingCopy => "HEAD".to_string(),
        };
        self.run(dest, &["rev-parse", &rev])
    }

    fn remote_matches(&self, dest: &Path) -> Result<bool> {
        let remote = self.run(dest, &["remote", "get-url", "origin"])?;
        Ok(remote.trim_end_matches('/') == self.url.trim_end_matches('/'))
    }

    fn current_branch(&self, dest: &Path) -> Result<String> {
        self.run(dest, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn clone_into(&self, dest: &Path) -> Result<()> {
        let parent = dest
            .parent()
            .with_context(|| format!("destination {} has no parent", dest.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let status = Command::new(Self::git_program())
            .args(["clone", &self.url, &dest.to_string_lossy()])
            .status()
            .with_context(|| format!("failed to spawn {}", Self::git_program()))?;
        if !status.success() {
            bail!("git clone of {} failed", self.url);
        }
        Ok(())
    }
}

impl Source for GitSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            bail!("git source {} has no url configured", self.name);
        }
        Ok(())
    }

    fn fetch(
        &self,
        source_set: &SourceSet,
        dest: &Path,
        fetch_ctx: &dyn FileFetchContext,
    ) -> Result<()> {
        if dest.exists() {
            return self.update(source_set, dest, fetch_ctx);
        }
        self.clone_into(dest)?;

        match source_set {
            SourceSet::Branch(name) => {
                self.run(dest, &["checkout", name])?;
            }
            SourceSet::Tag(name) => {
                self.run(dest, &["checkout", &format!("tags/{name}")])?;
            }
            SourceSet::Release | SourceSet::WorkingCopy => {}
        }
        Ok(())
    }

    /// Refresh every remote ref, then fast-forward the checked-out branch
    /// only when it is the branch this build was requested against —
    /// otherwise the working copy is left exactly as `fetch` leaves it.
    fn update(
        &self,
        source_set: &SourceSet,
        dest: &Path,
        _fetch_ctx: &dyn FileFetchContext,
    ) -> Result<()> {
        self.run(dest, &["fetch", "--tags", "origin"])?;
        if let SourceSet::Branch(name) = source_set {
            if let Ok(current) = self.current_branch(dest) {
                if &current == name {
                    self.run(dest, &["merge", "--ff-only", &format!("origin/{name}")])?;
                }
            }
        }
        Ok(())
    }

    /// Materialize `source_set` into `dest` without a `.git` directory: a
    /// `git archive` extraction for a pinned tag/branch/release, or a plain
    /// file copy of the working tree (minus `.git`) for `WorkingCopy`.
    fn prepare(
        &self,
        source_set: &SourceSet,
        dest: &Path,
        fetch_ctx: &dyn FileFetchContext,
    ) -> Result<()> {
        std::fs::create_dir_all(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;

        let scratch = dest.join(".git-scratch");
        if scratch.exists() {
            fs::remove_dir_all(&scratch).ok();
        }
        self.fetch(source_set, &scratch, fetch_ctx)
            .with_context(|| format!("failed to prepare a checkout of {}", self.name))?;

        match source_set {
            SourceSet::WorkingCopy => {
                copy_excluding_git(&scratch, dest)?;
            }
            SourceSet::Branch(_) | SourceSet::Tag(_) | SourceSet::Release => {
                let commit = self.resolve_ref(&scratch, source_set)?;
                let archive_path = scratch.join("archive.tar");
                self.run(
                    &scratch,
                    &[
                        "archive",
                        "--format=tar",
                        "--output",
                        &archive_path.to_string_lossy(),
                        &commit,
                    ],
                )?;
                let archive_file = fs::File::open(&archive_path)
                    .with_context(|| format!("failed to open {}", archive_path.display()))?;
                tar::Archive::new(archive_file)
                    .unpack(dest)
                    .with_context(|| format!("failed to extract git archive for {}", self.name))?;
            }
        }

        fs::remove_dir_all(&scratch).ok();
        Ok(())
    }

    fn display(&self) -> String {
        format!("git:{} ({})", self.name, self.url)
    }

    /// SourceID is derived from the resolved commit id, not branch/tag
    /// *names* — re-pointing a branch at the same commit never changes the
    /// SourceID, and a rebuild is driven solely by content.
    fn source_id(
        &self,
        source_set: &SourceSet,
        dest: &Path,
        fetch_ctx: &dyn FileFetchContext,
    ) -> Result<SourceId> {
        if matches!(source_set, SourceSet::WorkingCopy) {
            bail!(
                "working-copy source sets do not have a stable SourceID; use the policy crate's scratch BuildID derivation instead"
            );
        }
        let (_commit, id) = self.resolve(dest, source_set, &|name| fetch_ctx.licence_id_of(name))?;
        Ok(id)
    }

    fn working_copy_available(&self, dest: &Path) -> bool {
        dest.join(".git").exists()
    }

    fn check_working_copy(&self, dest: &Path) -> Result<()> {
        if !self.working_copy_available(dest) {
            bail!("no working copy present at {}", dest.display());
        }
        if !self.remote_matches(dest)? {
            bail!(
                "working copy at {} has a remote that does not match configured url {}",
                dest.display(),
                self.url
            );
        }
        let branch = self.current_branch(dest)?;
        if branch == "HEAD" {
            bail!("working copy at {} is in detached HEAD state", dest.display());
        }
        Ok(())
    }
}

impl GitSource {
    /// Compute the SourceID from an already-resolved commit id: type,
    /// name, envid, each referenced licence's ID, server, location,
    /// working-copy flag, and the commit.
    pub fn commit_source_id(
        &self,
        commit: &str,
        licence_id_of: &dyn Fn(&str) -> Option<drydock_hash::Digest>,
    ) -> Result<SourceId> {
        let mut hasher = drydock_hash::Hasher::new();
        hasher.hash_line("git");
        hasher.hash_line(&self.name);
        hasher.hash_line(&self.env.env_id().to_string());
        for name in &self.licences {
            let id = licence_id_of(name)
                .with_context(|| format!("unknown licence referenced by git source {}: {name}", self.name))?;
            hasher.hash_line(&id.to_hex());
        }
        hasher.hash_line(&self.server);
        hasher.hash_line(&self.location);
        hasher.hash_line(if self.working { "working" } else { "pinned" });
        hasher.hash_line(commit);
        Ok(hasher.finish())
    }

    /// Resolve `source_set` against an existing working copy and return
    /// both the commit id and its SourceID.
    pub fn resolve(
        &self,
        dest: &Path,
        source_set: &SourceSet,
        licence_id_of: &dyn Fn(&str) -> Option<drydock_hash::Digest>,
    ) -> Result<(String, SourceId)> {
        let commit = self.resolve_ref(dest, source_set)?;
        let id = self.commit_source_id(&commit, licence_id_of)?;
        Ok((commit, id))
    }
}

/// Recursively copy `src` into `dest`, skipping any `.git` entry.
fn copy_excluding_git(src: &Path, dest: &Path) -> Result<()> {
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            copy_excluding_git(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}
