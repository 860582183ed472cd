//! Typed, `deny_unknown_fields` deserialization of the on-disk config DSL
//!: every recognized key table (`e2project`, `e2chroot`,
//! `e2licence`, `e2source`, `e2result`, file entry) gets one struct here.
//! Loading a config is `toml::from_str` into these types plus
//! [`super::validate`]; there is no interpreter, only a strict
//! deserialize-then-validate pass.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// `chroot_arch`: the two architectures a project's sandbox
/// can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChrootArch {
    #[serde(rename = "x86_32")]
    X86_32,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl ChrootArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChrootArch::X86_32 => "x86_32",
            ChrootArch::X86_64 => "x86_64",
        }
    }
}

/// `required_checksums`: which checksum algorithms a file
/// entry is allowed to satisfy the non-local-server invariant with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgo {
    Sha1,
    Sha256,
}

/// A named upstream server, as declared under `proj/config`'s `servers`
/// table. There is no separate server config file; servers are declared
/// inline alongside the project's own attributes — see DESIGN.md's Open
/// Question notes.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntryConfig {
    pub url: String,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub writeback: bool,
    #[serde(default)]
    pub push_permissions: bool,
}

/// `proj/config`: the `e2project` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectFileConfig {
    pub name: String,
    pub release_id: String,
    pub chroot_arch: ChrootArch,
    #[serde(default)]
    pub default_results: Vec<String>,
    #[serde(default)]
    pub deploy_results: Vec<String>,
    #[serde(default)]
    pub checksums: Vec<ChecksumAlgo>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerEntryConfig>,
}

/// A file entry, shared verbatim across `e2chroot`, `e2licence` and
/// `e2source` files tables.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntryConfig {
    pub location: String,
    /// Absent means "inherit the enclosing group/licence/source's server".
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub unpack: bool,
    #[serde(default)]
    pub copy: bool,
    #[serde(default)]
    pub patch: bool,
    #[serde(default)]
    pub licences: Vec<String>,
}

impl FileEntryConfig {
    /// Resolve this entry's server against `inherited`, and its action
    /// against the exactly-one-of `unpack`/`copy`/`patch` invariant.
    pub fn resolve(&self, inherited_server: Option<&str>) -> Result<drydock_file::File> {
        let server = self
            .server
            .as_deref()
            .or(inherited_server)
            .with_context(|| format!("file entry {} has no server and none is inherited", self.location))?;

        let action = match (self.unpack, self.copy, self.patch) {
            (true, false, false) => drydock_file::FileAction::Unpack,
            (false, true, false) => drydock_file::FileAction::Copy,
            (false, false, true) => drydock_file::FileAction::Patch,
            _ => bail!(
                "file entry {} must set exactly one of unpack/copy/patch",
                self.location
            ),
        };

        let mut file = drydock_file::File::new(server, self.location.clone(), action);
        file.sha1 = self.sha1.clone();
        file.sha256 = self.sha256.clone();
        file.licences = self.licences.clone();
        Ok(file)
    }
}

/// One named group within `proj/chroot`'s `e2chroot` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChrootGroupEntryConfig {
    pub name: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntryConfig>,
}

/// `proj/chroot`: the `e2chroot` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChrootFileConfig {
    #[serde(default)]
    pub groups: Vec<ChrootGroupEntryConfig>,
    #[serde(default)]
    pub default_groups: Vec<String>,
}

/// One named licence within `proj/licences`'s `e2licence` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LicenceEntryConfig {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntryConfig>,
}

/// `proj/licences`: the `e2licence` table, keyed by licence name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct LicenceFileConfig(pub BTreeMap<String, LicenceEntryConfig>);

/// `src/<name>/config`: the `e2source` table. Fields not relevant to
/// `source_type` are simply left at their default and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceFileConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    /// `git`-specific.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub working: bool,
    #[serde(default)]
    pub licences: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// `files`-specific.
    #[serde(default)]
    pub files: Vec<FileEntryConfig>,
}

/// `res/<name>/config`: the `e2result` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultFileConfig {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub chroot: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Whether this result is assembled into the standalone,
    /// fetch-and-verify-only project reproduction under `project/` during
    /// the pipeline's `collect_project` step.
    #[serde(default)]
    pub collect_project: bool,
}

/// Parse `path` as a single TOML-backed config file of type `T`, rejecting
/// unrecognized keys.
pub fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// A plain `key = "value"` map, used for `proj/env` and a result's own
/// `env` table override.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    load_toml(path)
}
