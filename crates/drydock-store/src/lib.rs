//! Content-addressed result storage.
//!
//! A completed build lives at `<result>/<buildid>/` under the store root, in
//! a fixed `result.tar`-style layout (`result/files/<outputs>`,
//! `result/checksums`, `result/build.log.gz`): this crate only manages the
//! receipt/manifest bookkeeping around that tree, not the archive format
//! itself (drydock-pipeline owns populating `files/`).
//!
//! Every write (`save_receipt`, `deploy`) goes through a tmp-file-then-rename
//! so a crash never leaves a half-written receipt readable. `deploy`'s final
//! `out/<result>/last` symlink swap is the one documented exception: see [`deploy`]'s doc comment.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const RECEIPT_FILE: &str = "receipt.json";
pub const CURRENT_RECEIPT_VERSION: &str = "drydock.receipt.v1";
pub const MINIMUM_SUPPORTED_VERSION: &str = "drydock.receipt.v1";

/// Informational environment/CI fingerprint recorded alongside a receipt.
/// Never part of any ID computation; purely descriptive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentFingerprint {
    pub tool_version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub ci: Option<String>,
}

impl EnvironmentFingerprint {
    pub fn collect(tool_version: impl Into<String>) -> Self {
        Self {
            tool_version: tool_version.into(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            ci: detect_ci(),
        }
    }
}

fn detect_ci() -> Option<String> {
    for (var, name) in [
        ("GITHUB_ACTIONS", "github-actions"),
        ("GITLAB_CI", "gitlab-ci"),
        ("JENKINS_URL", "jenkins"),
        ("CI", "ci"),
    ] {
        if std::env::var_os(var).is_some() {
            return Some(name.to_string());
        }
    }
    None
}

/// A completed (or failed) build's receipt: everything recorded about one
/// BuildID's outcome, schema-versioned so a future incompatible receipt
/// shape can be detected rather than silently misread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_version: String,
    pub result: String,
    pub build_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub checksums: Vec<FileChecksum>,
    pub environment: EnvironmentFingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChecksum {
    pub path: String,
    /// The digest recorded in `result/checksums`, sha1 to match
    /// `sha1sum -c checksums`.
    pub sha1: String,
}

/// Validate a schema version string of the shape `drydock.receipt.vN`
/// against [`MINIMUM_SUPPORTED_VERSION`].
pub fn validate_schema_version(version: &str) -> Result<()> {
    let got = parse_schema_version(version)
        .with_context(|| format!("invalid schema version format: {version}"))?;
    let minimum = parse_schema_version(MINIMUM_SUPPORTED_VERSION)
        .expect("MINIMUM_SUPPORTED_VERSION is well-formed");
    if got < minimum {
        bail!("schema version {version} is too old; minimum supported version is {MINIMUM_SUPPORTED_VERSION}");
    }
    Ok(())
}

fn parse_schema_version(version: &str) -> Result<u32> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 || parts[0] != "drydock" || parts[1] != "receipt" || !parts[2].starts_with('v') {
        bail!("invalid schema version format: {version}");
    }
    parts[2][1..]
        .parse::<u32>()
        .with_context(|| format!("invalid version number in schema version: {version}"))
}

/// A content-addressed result store rooted at `root`, laid out as
/// `<root>/<result>/<buildid>/{receipt.json, result/...}`.
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn build_dir(&self, result: &str, build_id: &str) -> PathBuf {
        self.root.join(result).join(build_id)
    }

    fn receipt_path(&self, result: &str, build_id: &str) -> PathBuf {
        self.build_dir(result, build_id).join(RECEIPT_FILE)
    }

    /// Whether a build's result is already available.
    pub fn is_available(&self, result: &str, build_id: &str) -> bool {
        self.receipt_path(result, build_id).exists()
    }

    /// Persist `receipt` for `result`/`build_id`, creating the build
    /// directory as needed. Fails loudly rather than silently leaving a
    /// half-written receipt (Open-Question decision: `store_result` never
    /// returns `Ok` on a detected problem — see DESIGN.md).
    pub fn save_receipt(&self, receipt: &Receipt) -> Result<()> {
        let dir = self.build_dir(&receipt.result, &receipt.build_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create build dir {}", dir.display()))?;

        let path = dir.join(RECEIPT_FILE);
        atomic_write_json(&path, receipt)
    }

    pub fn load_receipt(&self, result: &str, build_id: &str) -> Result<Option<Receipt>> {
        let path = self.receipt_path(result, build_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read receipt {}", path.display()))?;
        let receipt: Receipt = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse receipt JSON {}", path.display()))?;
        validate_schema_version(&receipt.receipt_version)
            .with_context(|| format!("receipt at {} failed schema validation", path.display()))?;
        Ok(Some(receipt))
    }

    /// Path to a build's result payload directory
    /// (`<result>/<buildid>/result/`), where `files/`, `checksums` and
    /// `build.log.gz` live.
    pub fn result_payload_dir(&self, result: &str, build_id: &str) -> PathBuf {
        self.build_dir(result, build_id).join("result")
    }

    /// Deploy a completed build as `<out_dir>/<result>/last`, the deploy
    /// step for release-mode builds. The symlink swap itself is not
    /// made atomic (`std::os::unix::fs::symlink` has no atomic-replace
    /// primitive the way a file rename does): a crash between removing the
    /// old link and creating the new one leaves `last` briefly absent
    /// rather than ever pointing at a partially-written build — see
    /// DESIGN.md's Open Question decision on this exact tradeoff.
    pub fn deploy(&self, out_dir: &Path, result: &str, build_id: &str) -> Result<PathBuf> {
        let build_dir = self.build_dir(result, build_id);
        if !build_dir.exists() {
            bail!("cannot deploy {result}/{build_id}: build directory does not exist");
        }

        let result_out_dir = out_dir.join(result);
        fs::create_dir_all(&result_out_dir)
            .with_context(|| format!("failed to create {}", result_out_dir.display()))?;

        let link_path = result_out_dir.join("last");
        if link_path.exists() || link_path.symlink_metadata().is_ok() {
            fs::remove_file(&link_path)
                .with_context(|| format!("failed to remove existing symlink {}", link_path.display()))?;
        }

        #[cfg(unix)]
        std::os::unix::fs::symlink(&build_dir, &link_path)
            .with_context(|| format!("failed to symlink {} -> {}", link_path.display(), build_dir.display()))?;
        #[cfg(not(unix))]
        fs::write(&link_path, build_dir.to_string_lossy().as_bytes())
            .with_context(|| format!("failed to write deploy marker {}", link_path.display()))?;

        Ok(link_path)
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        file.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        file.sync_all().ok();
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn receipt(result: &str, build_id: &str, success: bool) -> Receipt {
        Receipt {
            receipt_version: CURRENT_RECEIPT_VERSION.to_string(),
            result: result.to_string(),
            build_id: build_id.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            success,
            checksums: vec![FileChecksum {
                path: "bin/hello".to_string(),
                sha1: "deadbeef".to_string(),
            }],
            environment: EnvironmentFingerprint::collect("0.3.0-rc.1"),
        }
    }

    #[test]
    fn is_available_false_until_receipt_is_saved() {
        let td = tempdir().unwrap();
        let store = ResultStore::new(td.path());
        assert!(!store.is_available("hello", "abc123"));

        store.save_receipt(&receipt("hello", "abc123", true)).unwrap();
        assert!(store.is_available("hello", "abc123"));
    }

    #[test]
    fn save_and_load_receipt_round_trips() {
        let td = tempdir().unwrap();
        let store = ResultStore::new(td.path());
        let r = receipt("hello", "abc123", true);
        store.save_receipt(&r).unwrap();

        let loaded = store.load_receipt("hello", "abc123").unwrap().unwrap();
        assert_eq!(loaded.build_id, "abc123");
        assert_eq!(loaded.checksums, r.checksums);
    }

    #[test]
    fn load_receipt_returns_none_when_missing() {
        let td = tempdir().unwrap();
        let store = ResultStore::new(td.path());
        assert!(store.load_receipt("hello", "missing").unwrap().is_none());
    }

    #[test]
    fn load_receipt_rejects_too_old_a_schema_version() {
        let td = tempdir().unwrap();
        let store = ResultStore::new(td.path());
        let mut r = receipt("hello", "abc123", true);
        r.receipt_version = "drydock.receipt.v0".to_string();
        store.save_receipt(&r).unwrap();

        let err = store.load_receipt("hello", "abc123").unwrap_err();
        assert!(err.to_string().contains("schema validation"));
    }

    #[test]
    fn validate_schema_version_rejects_malformed_strings() {
        assert!(validate_schema_version("garbage").is_err());
        assert!(validate_schema_version("drydock.receipt.v1").is_ok());
    }

    #[test]
    fn deploy_creates_a_symlink_to_the_build_dir() {
        let td = tempdir().unwrap();
        let store = ResultStore::new(td.path().join("store"));
        fs::create_dir_all(store.build_dir("hello", "abc123")).unwrap();

        let out_dir = td.path().join("out");
        let link = store.deploy(&out_dir, "hello", "abc123").unwrap();

        assert_eq!(
            fs::read_link(&link).unwrap(),
            store.build_dir("hello", "abc123")
        );
    }

    #[test]
    fn deploy_replaces_an_existing_last_symlink() {
        let td = tempdir().unwrap();
        let store = ResultStore::new(td.path().join("store"));
        fs::create_dir_all(store.build_dir("hello", "abc123")).unwrap();
        fs::create_dir_all(store.build_dir("hello", "def456")).unwrap();

        let out_dir = td.path().join("out");
        store.deploy(&out_dir, "hello", "abc123").unwrap();
        let link = store.deploy(&out_dir, "hello", "def456").unwrap();

        assert_eq!(
            fs::read_link(&link).unwrap(),
            store.build_dir("hello", "def456")
        );
    }

    #[test]
    fn deploy_fails_when_build_directory_is_missing() {
        let td = tempdir().unwrap();
        let store = ResultStore::new(td.path().join("store"));
        let out_dir = td.path().join("out");
        assert!(store.deploy(&out_dir, "hello", "missing").is_err());
    }

    #[test]
    fn environment_fingerprint_collects_a_nonempty_hostname_and_os() {
        let fp = EnvironmentFingerprint::collect("0.3.0-rc.1");
        assert!(!fp.hostname.is_empty());
        assert_eq!(fp.os, std::env::consts::OS);
    }
}
