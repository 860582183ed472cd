//! Per-result build configuration: the fixed set of paths, builtin environment variables and
//! arch-dependent exec prefix that every later step reads.

use std::path::PathBuf;

use drydock_environment::Environment;
use drydock_project::ChrootArch;

/// Name of the directory, inside the chroot, that the build runs in. Fixed
/// rather than configurable: a single `<builddir>` token used throughout
/// the build configuration.
const BUILD_DIR_NAME: &str = "build";

/// The materialized layout and fixed environment for one result's build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// `<tmpdir>/<project>/<result>`.
    pub base: PathBuf,
    /// `<base>/chroot`, spec's `c`.
    pub chroot: PathBuf,
    /// `<chroot>/<builddir>`, spec's `T` (the build directory as seen from
    /// outside the chroot).
    pub build_dir: PathBuf,
    /// `/<builddir>`, spec's `Tc` (the same directory as seen from inside
    /// the chroot, i.e. the path the build script itself observes).
    pub tc: String,
    /// Marker file proving `chroot` was created by this tool, checked by
    /// the privileged helper before it will touch the sandbox.
    pub chroot_marker: PathBuf,
    /// Build log, outside the chroot so it survives `chroot_cleanup`.
    pub buildlog: PathBuf,
    /// `E2_TMPDIR`, `E2_RESULT`, `E2_RELEASE_ID`, `E2_PROJECT_NAME`,
    /// `E2_BUILDID`, `T`, `r`, `R`.
    pub builtin_env: Environment,
    /// Prepended to every `chroot` helper invocation's argv. Non-empty only
    /// when building `x86_32` results on an `x86_64` host, where it is the
    /// external personality-switching wrapper (`linux32`).
    pub chroot_call_prefix: Vec<String>,
}

impl BuildConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tmp_root: &std::path::Path,
        project_name: &str,
        release_id: &str,
        result_name: &str,
        build_id: &str,
        chroot_arch: ChrootArch,
        host_arch: &str,
    ) -> Self {
        let base = tmp_root.join(project_name).join(result_name);
        let chroot = base.join("chroot");
        let build_dir = chroot.join(BUILD_DIR_NAME);
        let tc = format!("/{BUILD_DIR_NAME}");

        let mut builtin_env = Environment::new();
        builtin_env.set("E2_TMPDIR", &tc);
        builtin_env.set("E2_RESULT", result_name);
        builtin_env.set("E2_RELEASE_ID", release_id);
        builtin_env.set("E2_PROJECT_NAME", project_name);
        builtin_env.set("E2_BUILDID", build_id);
        builtin_env.set("T", &tc);
        builtin_env.set("r", result_name);
        builtin_env.set("R", result_name);

        let chroot_call_prefix = if host_arch == "x86_64" && chroot_arch == ChrootArch::X86_32 {
            vec!["linux32".to_string()]
        } else {
            Vec::new()
        };

        Self {
            base,
            chroot_marker: chroot.join(drydock_helper::SANDBOX_MARKER),
            buildlog: base.join("build.log"),
            build_dir,
            tc,
            builtin_env,
            chroot_call_prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_derived_from_project_and_result_name() {
        let cfg = BuildConfig::new(
            std::path::Path::new("/tmp/drydock"),
            "demo",
            "2026.1",
            "libc",
            "abc123",
            ChrootArch::X86_64,
            "x86_64",
        );
        assert_eq!(cfg.base, std::path::PathBuf::from("/tmp/drydock/demo/libc"));
        assert_eq!(cfg.chroot, std::path::PathBuf::from("/tmp/drydock/demo/libc/chroot"));
        assert_eq!(cfg.build_dir, std::path::PathBuf::from("/tmp/drydock/demo/libc/chroot/build"));
        assert_eq!(cfg.tc, "/build");
    }

    #[test]
    fn builtin_env_carries_the_fixed_variable_set() {
        let cfg = BuildConfig::new(
            std::path::Path::new("/tmp/drydock"),
            "demo",
            "2026.1",
            "libc",
            "abc123",
            ChrootArch::X86_64,
            "x86_64",
        );
        assert_eq!(cfg.builtin_env.get("E2_TMPDIR"), Some("/build"));
        assert_eq!(cfg.builtin_env.get("E2_RESULT"), Some("libc"));
        assert_eq!(cfg.builtin_env.get("E2_RELEASE_ID"), Some("2026.1"));
        assert_eq!(cfg.builtin_env.get("E2_PROJECT_NAME"), Some("demo"));
        assert_eq!(cfg.builtin_env.get("E2_BUILDID"), Some("abc123"));
        assert_eq!(cfg.builtin_env.get("T"), Some("/build"));
        assert_eq!(cfg.builtin_env.get("r"), Some("libc"));
        assert_eq!(cfg.builtin_env.get("R"), Some("libc"));
    }

    #[test]
    fn chroot_call_prefix_is_empty_for_native_builds() {
        let cfg = BuildConfig::new(
            std::path::Path::new("/tmp"),
            "demo",
            "r",
            "libc",
            "x",
            ChrootArch::X86_64,
            "x86_64",
        );
        assert!(cfg.chroot_call_prefix.is_empty());
    }

    #[test]
    fn chroot_call_prefix_wraps_x86_32_targets_on_an_x86_64_host() {
        let cfg = BuildConfig::new(
            std::path::Path::new("/tmp"),
            "demo",
            "r",
            "libc",
            "x",
            ChrootArch::X86_32,
            "x86_64",
        );
        assert_eq!(cfg.chroot_call_prefix, vec!["linux32".to_string()]);
    }

    #[test]
    fn chroot_call_prefix_is_empty_on_a_non_x86_64_host() {
        let cfg = BuildConfig::new(
            std::path::Path::new("/tmp"),
            "demo",
            "r",
            "libc",
            "x",
            ChrootArch::X86_32,
            "aarch64",
        );
        assert!(cfg.chroot_call_prefix.is_empty());
    }
}
