//! The privileged helper protocol: a small setuid binary that
//! exposes exactly four verbs — `set_permissions`, `extract_tar`, `chroot`,
//! `remove_chroot` — so that the unprivileged driver never runs arbitrary
//! commands as root itself.
//!
//! Every call validates that the target sandbox looks like one drydock
//! actually created (a marker file present, path under the configured
//! temp-directory prefix) before invoking the helper, and wraps the
//! invocation so the helper runs with umask 022 regardless of the caller's
//! own umask, restoring the caller's umask when the call returns.

use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};

pub const SANDBOX_MARKER: &str = ".drydock-sandbox";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A handle to the privileged helper binary.
#[derive(Debug, Clone)]
pub struct PrivilegedHelper {
    binary: PathBuf,
    tmp_prefix: PathBuf,
}

impl PrivilegedHelper {
    pub fn new(binary: impl Into<PathBuf>, tmp_prefix: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            tmp_prefix: tmp_prefix.into(),
        }
    }

    /// Validate that `sandbox` is one this process is allowed to operate
    /// on: it must live under the configured temp prefix and carry the
    /// sandbox marker file (or be about to, for `set_permissions` on a
    /// not-yet-marked fresh sandbox — callers pass `require_marker: false`
    /// for that one case).
    fn validate_sandbox(&self, sandbox: &Path, require_marker: bool) -> Result<()> {
        if !sandbox.starts_with(&self.tmp_prefix) {
            bail!(
                "sandbox {} is not under the required tmp prefix {}",
                sandbox.display(),
                self.tmp_prefix.display()
            );
        }
        if require_marker && !sandbox.join(SANDBOX_MARKER).exists() {
            bail!(
                "sandbox {} is missing its marker file; refusing to operate on it",
                sandbox.display()
            );
        }
        Ok(())
    }

    /// Run the helper binary with `args`, wrapped in a shell that sets
    /// umask 022 for the helper's process tree only — the caller's own
    /// umask is never touched, so there is nothing to restore in this
    /// process.
    fn invoke(&self, args: &[String]) -> Result<CommandOutput> {
        let quoted: Vec<String> = std::iter::once(shell_quote(&self.binary.to_string_lossy()))
            .chain(args.iter().map(|a| shell_quote(a)))
            .collect();
        let script = format!("umask 022 && exec {}", quoted.join(" "));

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn privileged helper")?;

        let status = child.wait().context("failed to wait on privileged helper")?;
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout);
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    pub fn set_permissions(&self, sandbox: &Path, require_marker: bool) -> Result<()> {
        self.validate_sandbox(sandbox, require_marker)?;
        let out = self.invoke(&[
            "set_permissions".to_string(),
            sandbox.to_string_lossy().into_owned(),
        ])?;
        ensure_success(&out, "set_permissions")
    }

    pub fn extract_tar(&self, sandbox: &Path, tartype: &str, archive: &Path) -> Result<()> {
        self.validate_sandbox(sandbox, true)?;
        let out = self.invoke(&[
            "extract_tar".to_string(),
            sandbox.to_string_lossy().into_owned(),
            tartype.to_string(),
            archive.to_string_lossy().into_owned(),
        ])?;
        ensure_success(&out, "extract_tar")
    }

    pub fn chroot(&self, sandbox: &Path, command: &[String]) -> Result<CommandOutput> {
        self.validate_sandbox(sandbox, true)?;
        let mut args = vec!["chroot".to_string(), sandbox.to_string_lossy().into_owned()];
        args.extend(command.iter().cloned());
        self.invoke(&args)
    }

    pub fn remove_chroot(&self, sandbox: &Path) -> Result<()> {
        self.validate_sandbox(sandbox, true)?;
        let out = self.invoke(&[
            "remove_chroot".to_string(),
            sandbox.to_string_lossy().into_owned(),
        ])?;
        ensure_success(&out, "remove_chroot")
    }
}

fn ensure_success(out: &CommandOutput, verb: &str) -> Result<()> {
    if out.exit_code != 0 {
        bail!(
            "privileged helper verb {verb} exited with status {}: {}",
            out.exit_code,
            out.stderr.trim()
        );
    }
    Ok(())
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Caller-side helper invocation timeout, used by the pipeline's runbuild
/// step when running inside a chroot.
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(3600);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn validate_sandbox_rejects_paths_outside_tmp_prefix() {
        let td = tempdir().unwrap();
        let helper = PrivilegedHelper::new("/bin/true", td.path().join("tmp"));
        let err = helper
            .validate_sandbox(Path::new("/etc/passwd"), false)
            .unwrap_err();
        assert!(err.to_string().contains("tmp prefix"));
    }

    #[test]
    fn validate_sandbox_requires_marker_by_default() {
        let td = tempdir().unwrap();
        let tmp_prefix = td.path().join("tmp");
        std::fs::create_dir_all(&tmp_prefix).unwrap();
        let sandbox = tmp_prefix.join("sandbox1");
        std::fs::create_dir_all(&sandbox).unwrap();

        let helper = PrivilegedHelper::new("/bin/true", &tmp_prefix);
        assert!(helper.validate_sandbox(&sandbox, true).is_err());

        std::fs::write(sandbox.join(SANDBOX_MARKER), b"").unwrap();
        assert!(helper.validate_sandbox(&sandbox, true).is_ok());
    }

    #[test]
    fn set_permissions_runs_the_configured_binary() {
        let td = tempdir().unwrap();
        let tmp_prefix = td.path().join("tmp");
        let sandbox = tmp_prefix.join("sandbox1");
        std::fs::create_dir_all(&sandbox).unwrap();
        std::fs::write(sandbox.join(SANDBOX_MARKER), b"").unwrap();

        let helper = PrivilegedHelper::new("/bin/true", &tmp_prefix);
        helper.set_permissions(&sandbox, true).unwrap();
    }

    #[test]
    fn chroot_surfaces_nonzero_exit_as_output_not_error() {
        let td = tempdir().unwrap();
        let tmp_prefix = td.path().join("tmp");
        let sandbox = tmp_prefix.join("sandbox1");
        std::fs::create_dir_all(&sandbox).unwrap();
        std::fs::write(sandbox.join(SANDBOX_MARKER), b"").unwrap();

        let helper = PrivilegedHelper::new("/bin/false", &tmp_prefix);
        let out = helper.chroot(&sandbox, &["true".to_string()]).unwrap();
        assert_ne!(out.exit_code, 0);
    }
}
