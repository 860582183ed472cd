//! File objects: a single fetchable unit, located on a named server, with an
//! action describing how it is applied once fetched, and the set of
//! licences that cover it.
//!
//! File does not depend on the licence crate: cross-references to licences
//! are by name, resolved through a caller-supplied lookup when computing a
//! [`FileId`] (see [`File::file_id`]), which keeps the crate graph acyclic
//! even though `Licence` objects themselves embed `File`s for their licence
//! text.

use anyhow::{Context, Result, bail};
use drydock_cache::{ChecksumAlgorithm, FileIdentity, HashCache, Transport};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use drydock_hash::Digest;

/// Content-addressed identifier for a [`File`].
pub type FileId = Digest;

/// What happens to a fetched file once it lands locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// Unpack an archive into the destination directory.
    Unpack,
    /// Copy the file byte-for-byte into the destination directory.
    Copy,
    /// Apply the file as a patch against the destination directory.
    Patch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub server: String,
    pub location: String,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub action: FileAction,
    /// Names of the licences covering this file, resolved against a
    /// `LicenceRegistry` elsewhere in the object graph.
    pub licences: Vec<String>,
}

impl File {
    pub fn new(server: impl Into<String>, location: impl Into<String>, action: FileAction) -> Self {
        Self {
            server: server.into(),
            location: location.into(),
            sha1: None,
            sha256: None,
            action,
            licences: Vec::new(),
        }
    }

    /// Enforce the non-local-server checksum-required invariant: a file
    /// served from anywhere other than a local server must carry at least
    /// one checksum.
    pub fn validate(&self, server_is_local: bool) -> Result<()> {
        if !server_is_local && self.sha1.is_none() && self.sha256.is_none() {
            bail!(
                "file {}/{} is served from a non-local server and must carry a checksum",
                self.server,
                self.location
            );
        }
        Ok(())
    }

    /// Compute this file's FileID: a digest of server, location, enabled
    /// checksum algorithm values (falling back to `computed_checksum` when
    /// neither is configured), each referenced licence's ID (in order,
    /// resolved via `licence_id_of`), and the action kind.
    ///
    /// `computed_checksum` is the content hash the caller obtained by
    /// fetching and hashing the file itself, for a file that declares no
    /// checksum of its own (see [`File::resolve_content_checksum`]). It is
    /// ignored when either `sha1` or `sha256` is set, and it is an error to
    /// omit both a declared checksum and a computed one: every FileID must
    /// be anchored to the file's actual content.
    pub fn file_id(
        &self,
        licence_id_of: impl Fn(&str) -> Option<Digest>,
        computed_checksum: Option<&str>,
    ) -> Result<FileId> {
        let mut hasher = drydock_hash::Hasher::new();
        hasher.hash_line(&self.server);
        hasher.hash_line(&self.location);
        if let Some(sha1) = &self.sha1 {
            hasher.hash_line("sha1");
            hasher.hash_line(sha1);
        }
        if let Some(sha256) = &self.sha256 {
            hasher.hash_line("sha256");
            hasher.hash_line(sha256);
        }
        if self.sha1.is_none() && self.sha256.is_none() {
            let computed = computed_checksum.with_context(|| {
                format!(
                    "file {}/{} has no checksum configured and none was computed",
                    self.server, self.location
                )
            })?;
            hasher.hash_line("sha256");
            hasher.hash_line(computed);
        }
        for name in &self.licences {
            let id = licence_id_of(name)
                .with_context(|| format!("unknown licence referenced by file: {name}"))?;
            hasher.hash_line(&id.to_hex());
        }
        hasher.hash_line(match self.action {
            FileAction::Unpack => "unpack",
            FileAction::Copy => "copy",
            FileAction::Patch => "patch",
        });
        Ok(hasher.finish())
    }

    /// Fetch this file through `transport`, consulting/updating `cache` for
    /// a previously-verified digest, and cross-check every checksum this
    /// file actually declares against the fetched bytes. A file with
    /// neither `sha1` nor `sha256` set passes trivially.
    ///
    /// When `check_remote` is set and the transport supports it (spec.md
    /// §4.2: `ssh`/`scp` and `rsync+ssh` verify via remote `sha1sum`/
    /// `sha256sum`), the locally-computed digest is additionally
    /// cross-checked against a freshly-computed remote digest for each
    /// algorithm this file declares; a disagreement is a transport-level
    /// corruption and fails just like a configured-vs-computed mismatch.
    pub fn checksum_verify(
        &self,
        transport: &dyn Transport,
        cache: &mut HashCache,
        dest: &Path,
        check_remote: bool,
    ) -> Result<()> {
        transport.fetch_file(&self.location, dest)?;

        if let Some(expected) = &self.sha256 {
            let actual = self.cached_digest(cache, dest, ChecksumKind::Sha256)?;
            if expected != &actual {
                bail!(
                    "sha256 checksum mismatch for {}/{}: expected {expected}, got {actual}",
                    self.server,
                    self.location
                );
            }
            if check_remote {
                self.verify_remote(transport, ChecksumKind::Sha256, &actual)?;
            }
        }
        if let Some(expected) = &self.sha1 {
            let actual = self.cached_digest(cache, dest, ChecksumKind::Sha1)?;
            if expected != &actual {
                bail!(
                    "sha1 checksum mismatch for {}/{}: expected {expected}, got {actual}",
                    self.server,
                    self.location
                );
            }
            if check_remote {
                self.verify_remote(transport, ChecksumKind::Sha1, &actual)?;
            }
        }
        Ok(())
    }

    /// Cross-check `expected` (the cached-or-freshly-fetched local digest)
    /// against the transport's remote-side digest for `kind`. A transport
    /// with no remote-hashing capability (`None`) passes trivially; a
    /// transport that attempted the remote hash and failed (connection
    /// error, missing remote binary) fails this file's verification rather
    /// than being silently ignored, since `--check-remote` was explicitly
    /// requested.
    fn verify_remote(&self, transport: &dyn Transport, kind: ChecksumKind, expected: &str) -> Result<()> {
        let algo = match kind {
            ChecksumKind::Sha1 => ChecksumAlgorithm::Sha1,
            ChecksumKind::Sha256 => ChecksumAlgorithm::Sha256,
        };
        match transport.remote_digest(&self.location, algo) {
            None => Ok(()),
            Some(Err(e)) => Err(e).with_context(|| {
                format!(
                    "remote {} verification for {}/{} could not be completed",
                    kind.name(),
                    self.server,
                    self.location
                )
            }),
            Some(Ok(remote)) => {
                if remote != expected {
                    bail!(
                        "{} checksum verification failed for {}/{}: computed {expected} remote {remote}",
                        kind.name(),
                        self.server,
                        self.location
                    );
                }
                Ok(())
            }
        }
    }

    /// Resolve the digest this file's FileID should fold in: the declared
    /// `sha256`, else the declared `sha1`, else fetch the file through
    /// `transport` into `dest` and hash it locally.
    pub fn resolve_content_checksum(
        &self,
        transport: &dyn Transport,
        cache: &mut HashCache,
        dest: &Path,
    ) -> Result<String> {
        if let Some(sha256) = &self.sha256 {
            return Ok(sha256.clone());
        }
        if let Some(sha1) = &self.sha1 {
            return Ok(sha1.clone());
        }
        transport
            .fetch_file(&self.location, dest)
            .with_context(|| format!("failed to fetch {}/{}", self.server, self.location))?;
        self.cached_digest(cache, dest, ChecksumKind::Sha256)
    }

    fn cached_digest(&self, cache: &mut HashCache, dest: &Path, kind: ChecksumKind) -> Result<String> {
        let identity = FileIdentity::from_path(dest)?;
        if kind == ChecksumKind::Sha256 {
            if let Some(cached) = cache.lookup(&identity) {
                return Ok(cached);
            }
        }
        let bytes = std::fs::read(dest)
            .with_context(|| format!("failed to read fetched file {}", dest.display()))?;
        let digest = match kind {
            ChecksumKind::Sha256 => {
                let digest = drydock_hash::hash_bytes(&bytes).to_hex();
                cache.insert(identity, digest.clone());
                digest
            }
            ChecksumKind::Sha1 => {
                use sha1::{Digest as _, Sha1};
                let mut hasher = Sha1::new();
                hasher.update(&bytes);
                hex::encode(hasher.finalize())
            }
        };
        Ok(digest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChecksumKind {
    Sha1,
    Sha256,
}

impl ChecksumKind {
    fn name(self) -> &'static str {
        match self {
            ChecksumKind::Sha1 => "sha1",
            ChecksumKind::Sha256 => "sha256",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_cache::transport;
    use drydock_url::{Server, ServerFlags};
    use tempfile::tempdir;

    fn licence_ids(names: &[(&str, Digest)]) -> impl Fn(&str) -> Option<Digest> + '_ {
        move |name| names.iter().find(|(n, _)| *n == name).map(|(_, id)| *id)
    }

    #[test]
    fn validate_requires_checksum_for_non_local_server() {
        let f = File::new("remote", "pkg.tar.gz", FileAction::Unpack);
        let err = f.validate(false).unwrap_err();
        assert!(err.to_string().contains("must carry a checksum"));
        assert!(f.validate(true).is_ok());
    }

    #[test]
    fn validate_passes_with_checksum() {
        let mut f = File::new("remote", "pkg.tar.gz", FileAction::Unpack);
        f.sha256 = Some("abc".into());
        assert!(f.validate(false).is_ok());
    }

    #[test]
    fn file_id_depends_on_server_location_checksum_licences_and_action() {
        let mut f = File::new("s", "loc", FileAction::Copy);
        f.sha256 = Some("abc".into());
        let id_a = f.file_id(licence_ids(&[]), None).unwrap();

        let mut g = f.clone();
        g.location = "other".into();
        let id_b = g.file_id(licence_ids(&[]), None).unwrap();

        assert_ne!(id_a, id_b);
    }

    #[test]
    fn file_id_is_stable_for_identical_inputs() {
        let mut f = File::new("s", "loc", FileAction::Copy);
        f.sha256 = Some("abc".into());
        assert_eq!(
            f.file_id(licence_ids(&[]), None).unwrap(),
            f.file_id(licence_ids(&[]), None).unwrap()
        );
    }

    #[test]
    fn file_id_errors_on_unresolvable_licence() {
        let mut f = File::new("s", "loc", FileAction::Copy);
        f.sha256 = Some("abc".into());
        f.licences.push("gpl".into());
        assert!(f.file_id(licence_ids(&[]), None).is_err());
    }

    #[test]
    fn file_id_requires_a_checksum_declared_or_computed() {
        let f = File::new("s", "loc", FileAction::Copy);
        assert!(f.file_id(licence_ids(&[]), None).is_err());
        assert!(f.file_id(licence_ids(&[]), Some("computed-digest")).is_ok());
    }

    #[test]
    fn file_id_ignores_computed_checksum_when_one_is_declared() {
        let mut f = File::new("s", "loc", FileAction::Copy);
        f.sha256 = Some("abc".into());
        assert_eq!(
            f.file_id(licence_ids(&[]), None).unwrap(),
            f.file_id(licence_ids(&[]), Some("something-else")).unwrap()
        );
    }

    #[test]
    fn checksum_verify_accepts_matching_checksum() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("a.bin"), b"payload").unwrap();

        let server = Server::new(
            "local",
            format!("file://{}", td.path().display()),
            ServerFlags {
                cache: true,
                writeback: false,
                push_permissions: false,
            },
        );
        let transport = transport::for_server(server).unwrap();

        let mut f = File::new("local", "a.bin", FileAction::Copy);
        f.sha256 = Some(drydock_hash::hash_bytes(b"payload").to_hex());

        let mut cache = HashCache::load(Path::new("/nonexistent"), false).unwrap();
        let dest = td.path().join("dest.bin");
        f.checksum_verify(transport.as_ref(), &mut cache, &dest, false)
            .unwrap();
    }

    #[test]
    fn checksum_verify_accepts_a_file_transport_with_check_remote_on() {
        // file:// has no remote-hashing capability; remote_digest returns
        // None and --check-remote passes trivially rather than failing.
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("a.bin"), b"payload").unwrap();

        let server = Server::new(
            "local",
            format!("file://{}", td.path().display()),
            ServerFlags::default(),
        );
        let transport = transport::for_server(server).unwrap();

        let mut f = File::new("local", "a.bin", FileAction::Copy);
        f.sha256 = Some(drydock_hash::hash_bytes(b"payload").to_hex());

        let mut cache = HashCache::load(Path::new("/nonexistent"), false).unwrap();
        let dest = td.path().join("dest.bin");
        f.checksum_verify(transport.as_ref(), &mut cache, &dest, true)
            .unwrap();
    }

    #[test]
    fn checksum_verify_rejects_mismatched_checksum() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("a.bin"), b"payload").unwrap();

        let server = Server::new(
            "local",
            format!("file://{}", td.path().display()),
            ServerFlags::default(),
        );
        let transport = transport::for_server(server).unwrap();

        let mut f = File::new("local", "a.bin", FileAction::Copy);
        f.sha256 = Some("not-the-real-hash".into());

        let mut cache = HashCache::load(Path::new("/nonexistent"), false).unwrap();
        let dest = td.path().join("dest.bin");
        let err = f
            .checksum_verify(transport.as_ref(), &mut cache, &dest, false)
            .unwrap_err();
        assert!(err.to_string().contains("sha256 checksum mismatch"));
    }

    #[test]
    fn checksum_verify_rejects_mismatched_sha1_even_with_matching_sha256() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("a.bin"), b"payload").unwrap();

        let server = Server::new(
            "local",
            format!("file://{}", td.path().display()),
            ServerFlags::default(),
        );
        let transport = transport::for_server(server).unwrap();

        let mut f = File::new("local", "a.bin", FileAction::Copy);
        f.sha256 = Some(drydock_hash::hash_bytes(b"payload").to_hex());
        f.sha1 = Some("0000000000000000000000000000000000000000".into());

        let mut cache = HashCache::load(Path::new("/nonexistent"), false).unwrap();
        let dest = td.path().join("dest.bin");
        let err = f
            .checksum_verify(transport.as_ref(), &mut cache, &dest, false)
            .unwrap_err();
        assert!(err.to_string().contains("sha1 checksum mismatch"));
    }

    #[test]
    fn resolve_content_checksum_fetches_and_hashes_when_undeclared() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("a.bin"), b"payload").unwrap();

        let server = Server::new(
            "local",
            format!("file://{}", td.path().display()),
            ServerFlags::default(),
        );
        let transport = transport::for_server(server).unwrap();

        let f = File::new("local", "a.bin", FileAction::Copy);
        let mut cache = HashCache::load(Path::new("/nonexistent"), false).unwrap();
        let dest = td.path().join("dest.bin");
        let digest = f
            .resolve_content_checksum(transport.as_ref(), &mut cache, &dest)
            .unwrap();
        assert_eq!(digest, drydock_hash::hash_bytes(b"payload").to_hex());
    }

    #[test]
    fn resolve_content_checksum_prefers_declared_checksum() {
        let mut f = File::new("local", "a.bin", FileAction::Copy);
        f.sha256 = Some("declared".into());
        let mut cache = HashCache::load(Path::new("/nonexistent"), false).unwrap();
        let server = Server::new("local", "file:///nonexistent", ServerFlags::default());
        let transport = transport::for_server(server).unwrap();
        let digest = f
            .resolve_content_checksum(transport.as_ref(), &mut cache, Path::new("/unused"))
            .unwrap();
        assert_eq!(digest, "declared");
    }
}
