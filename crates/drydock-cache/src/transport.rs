use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};

use drydock_url::Server;

/// The transport scheme a [`Server`] url resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    File,
    Rsync,
    RsyncSsh,
    ScpSsh,
    Http,
}

/// A checksum algorithm a transport may be able to compute on the remote
/// side, without fetching the file locally first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    fn remote_command(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha1 => "sha1sum",
            ChecksumAlgorithm::Sha256 => "sha256sum",
        }
    }
}

/// Fetches and (where supported) pushes files to a remote server.
///
/// Every method here corresponds 1:1 to a transport-layer capability:
/// `fetch_file`, `fetch_file_path`, `push_file`, `remote_url`,
/// `cache_enabled`, `writeback_enabled`.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Copy the remote file's bytes into `local`.
    fn fetch_file(&self, location: &str, local: &Path) -> Result<()>;

    /// Like `fetch_file`, but returns a path to the fetched content instead
    /// of requiring the caller to provide a destination; local transports
    /// may return the original path without copying.
    fn fetch_file_path(&self, location: &str) -> Result<PathBuf>;

    /// Push a local file to the server. Read-only transports (plain http)
    /// reject this.
    fn push_file(&self, local: &Path, location: &str) -> Result<()>;

    /// Fully-qualified URL for a location on this server, for
    /// display/logging purposes.
    fn remote_url(&self, location: &str) -> String;

    fn cache_enabled(&self) -> bool {
        self.server().flags.cache
    }

    fn writeback_enabled(&self) -> bool {
        self.server().flags.writeback
    }

    /// Compute `location`'s checksum on the remote side, without fetching
    /// it locally first (spec.md §4.2: `ssh`/`scp` and `rsync+ssh` verify
    /// via remote `sha1sum`/`sha256sum`). `None` means this transport has
    /// no remote-hashing capability (`file://`, `http(s)://`, plain
    /// `rsync://`); the default implementation used by those transports.
    fn remote_digest(&self, _location: &str, _algo: ChecksumAlgorithm) -> Option<Result<String>> {
        None
    }

    fn server(&self) -> &Server;
}

/// Name of the `ssh` binary used for remote-side checksum verification.
/// Overridable via `DRYDOCK_SSH_BIN` so tests can substitute a fake binary.
fn ssh_bin() -> String {
    std::env::var("DRYDOCK_SSH_BIN").unwrap_or_else(|_| "ssh".to_string())
}

/// Split a transport url (scheme already stripped) into the ssh host and
/// the path prefix under that host, for `ssh <host> <command> <path>`
/// invocations. A url with no `/` is a bare host with no path prefix.
fn ssh_host_and_base(stripped_url: &str) -> (&str, &str) {
    match stripped_url.split_once('/') {
        Some((host, rest)) => (host, rest.trim_end_matches('/')),
        None => (stripped_url, ""),
    }
}

fn ssh_remote_path(base: &str, location: &str) -> String {
    if base.is_empty() {
        location.to_string()
    } else {
        format!("{base}/{location}")
    }
}

/// Run `<algo's command> <path>` on `host` over ssh and parse the leading
/// hex digest off its `sha1sum`/`sha256sum`-style output
/// (`<digest>  <filename>`).
fn run_remote_digest(host: &str, path: &str, algo: ChecksumAlgorithm) -> Result<String> {
    let output = Command::new(ssh_bin())
        .args([host, algo.remote_command(), path])
        .output()
        .with_context(|| format!("failed to spawn {}", ssh_bin()))?;
    if !output.status.success() {
        bail!(
            "remote {} on {host}:{path} failed: {}",
            algo.remote_command(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .next()
        .map(|digest| digest.to_string())
        .with_context(|| format!("empty output from remote {} on {host}:{path}", algo.remote_command()))
}

/// Construct the right [`Transport`] implementation for a server's URL
/// scheme.
pub fn for_server(server: Server) -> Result<Box<dyn Transport>> {
    if server.is_local() {
        return Ok(Box::new(FileTransport { server }));
    }
    if server.url.starts_with("rsync+ssh://") {
        return Ok(Box::new(RsyncTransport {
            server,
            over_ssh: true,
        }));
    }
    if server.url.starts_with("rsync://") {
        return Ok(Box::new(RsyncTransport {
            server,
            over_ssh: false,
        }));
    }
    if server.url.starts_with("ssh+scp://") || server.url.starts_with("scp://") {
        return Ok(Box::new(ScpTransport { server }));
    }
    if server.url.starts_with("http://") || server.url.starts_with("https://") {
        return Ok(Box::new(HttpTransport {
            server,
            client: reqwest::blocking::Client::new(),
        }));
    }
    bail!("unrecognized server url scheme: {}", server.url);
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map(|(_, rest)| rest).unwrap_or(url)
}

struct FileTransport {
    server: Server,
}

impl Transport for FileTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::File
    }

    fn fetch_file(&self, location: &str, local: &Path) -> Result<()> {
        let src = self.local_path(location);
        std::fs::copy(&src, local)
            .with_context(|| format!("failed to copy {} to {}", src.display(), local.display()))?;
        Ok(())
    }

    fn fetch_file_path(&self, location: &str) -> Result<PathBuf> {
        let path = self.local_path(location);
        if !path.exists() {
            bail!("file not found on local server: {}", path.display());
        }
        Ok(path)
    }

    fn push_file(&self, local: &Path, location: &str) -> Result<()> {
        if !self.server.flags.push_permissions {
            bail!(
                "server {} does not grant push permissions",
                self.server.name
            );
        }
        let dest = self.local_path(location);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::copy(local, &dest)
            .with_context(|| format!("failed to copy {} to {}", local.display(), dest.display()))?;
        Ok(())
    }

    fn remote_url(&self, location: &str) -> String {
        format!("{}/{}", self.server.url.trim_end_matches('/'), location)
    }

    fn server(&self) -> &Server {
        &self.server
    }
}

impl FileTransport {
    fn local_path(&self, location: &str) -> PathBuf {
        PathBuf::from(strip_scheme(&self.server.url)).join(location)
    }
}

/// `rsync://` and `rsync+ssh://` transports, implemented by shelling out to
/// the `rsync` binary. The binary name is overridable via
/// `DRYDOCK_RSYNC_BIN` so tests can substitute a fake binary.
struct RsyncTransport {
    server: Server,
    over_ssh: bool,
}

impl RsyncTransport {
    fn bin() -> String {
        std::env::var("DRYDOCK_RSYNC_BIN").unwrap_or_else(|_| "rsync".to_string())
    }

    fn remote_spec(&self, location: &str) -> String {
        format!(
            "{}/{}",
            strip_scheme(&self.server.url).trim_end_matches('/'),
            location
        )
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(Self::bin());
        if self.over_ssh {
            cmd.args(["-e", "ssh"]);
        }
        cmd.args(args);
        let status = cmd
            .status()
            .with_context(|| format!("failed to spawn {}", Self::bin()))?;
        if !status.success() {
            bail!("rsync exited with status {status}");
        }
        Ok(())
    }
}

impl Transport for RsyncTransport {
    fn kind(&self) -> TransportKind {
        if self.over_ssh {
            TransportKind::RsyncSsh
        } else {
            TransportKind::Rsync
        }
    }

    fn fetch_file(&self, location: &str, local: &Path) -> Result<()> {
        self.run(&[&self.remote_spec(location), &local.to_string_lossy()])
    }

    fn fetch_file_path(&self, location: &str) -> Result<PathBuf> {
        bail!(
            "rsync transport requires an explicit destination for location {location}; use fetch_file"
        )
    }

    fn push_file(&self, local: &Path, location: &str) -> Result<()> {
        if !self.server.flags.push_permissions {
            bail!(
                "server {} does not grant push permissions",
                self.server.name
            );
        }
        self.run(&[&local.to_string_lossy(), &self.remote_spec(location)])
    }

    fn remote_url(&self, location: &str) -> String {
        format!("{}/{}", self.server.url.trim_end_matches('/'), location)
    }

    fn remote_digest(&self, location: &str, algo: ChecksumAlgorithm) -> Option<Result<String>> {
        if !self.over_ssh {
            return None;
        }
        let (host, base) = ssh_host_and_base(strip_scheme(&self.server.url));
        Some(run_remote_digest(host, &ssh_remote_path(base, location), algo))
    }

    fn server(&self) -> &Server {
        &self.server
    }
}

/// `ssh+scp://` transport, implemented by shelling out to `scp`. Overridable
/// via `DRYDOCK_SCP_BIN` for tests.
struct ScpTransport {
    server: Server,
}

impl ScpTransport {
    fn bin() -> String {
        std::env::var("DRYDOCK_SCP_BIN").unwrap_or_else(|_| "scp".to_string())
    }

    fn remote_spec(&self, location: &str) -> String {
        format!("{}:{}", strip_scheme(&self.server.url), location)
    }
}

impl Transport for ScpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ScpSsh
    }

    fn fetch_file(&self, location: &str, local: &Path) -> Result<()> {
        let status = Command::new(Self::bin())
            .args([self.remote_spec(location), local.to_string_lossy().into_owned()])
            .status()
            .with_context(|| format!("failed to spawn {}", Self::bin()))?;
        if !status.success() {
            bail!("scp exited with status {status}");
        }
        Ok(())
    }

    fn fetch_file_path(&self, location: &str) -> Result<PathBuf> {
        bail!("scp transport requires an explicit destination for location {location}; use fetch_file")
    }

    fn push_file(&self, local: &Path, location: &str) -> Result<()> {
        if !self.server.flags.push_permissions {
            bail!(
                "server {} does not grant push permissions",
                self.server.name
            );
        }
        let status = Command::new(Self::bin())
            .args([local.to_string_lossy().into_owned(), self.remote_spec(location)])
            .status()
            .with_context(|| format!("failed to spawn {}", Self::bin()))?;
        if !status.success() {
            bail!("scp exited with status {status}");
        }
        Ok(())
    }

    fn remote_url(&self, location: &str) -> String {
        format!("{}/{}", self.server.url.trim_end_matches('/'), location)
    }

    fn remote_digest(&self, location: &str, algo: ChecksumAlgorithm) -> Option<Result<String>> {
        let (host, base) = ssh_host_and_base(strip_scheme(&self.server.url));
        Some(run_remote_digest(host, &ssh_remote_path(base, location), algo))
    }

    fn server(&self) -> &Server {
        &self.server
    }
}

struct HttpTransport {
    server: Server,
    client: reqwest::blocking::Client,
}

impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn fetch_file(&self, location: &str, local: &Path) -> Result<()> {
        let url = self.remote_url(location);
        let resp = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        if !resp.status().is_success() {
            bail!("fetching {url} returned status {}", resp.status());
        }
        let bytes = resp.bytes().with_context(|| format!("reading body of {url}"))?;
        std::fs::write(local, bytes)
            .with_context(|| format!("writing fetched file to {}", local.display()))?;
        Ok(())
    }

    fn fetch_file_path(&self, location: &str) -> Result<PathBuf> {
        bail!("http transport requires an explicit destination for location {location}; use fetch_file")
    }

    fn push_file(&self, _local: &Path, _location: &str) -> Result<()> {
        bail!("http(s) transport does not support push_file");
    }

    fn remote_url(&self, location: &str) -> String {
        format!("{}/{}", self.server.url.trim_end_matches('/'), location)
    }

    fn server(&self) -> &Server {
        &self.server
    }
}
