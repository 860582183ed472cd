//! The build pipeline: per-result configuration, shared run context, the
//! fifteen named steps, and the single-threaded
//! driver that sequences them across a project's results.

mod config;
mod context;
mod driver;
mod steps;

pub use config::BuildConfig;
pub use context::{
    DEPLOY_SERVER_NAME, PipelineContext, PipelineOptions, RESULTS_SERVER_NAME, ShutdownFlag, default_helper_binary,
    default_tmp_root, ensure_dir, host_arch,
};
pub use driver::{NullReporter, Reporter, build_ids_only, run};
pub use steps::RunState;

pub use drydock_events::StepOutcome;

#[cfg(test)]
mod integration_tests {
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use drydock_chroot::ChrootGroupRegistry;
    use drydock_environment::Environment;
    use drydock_project::{ChrootArch, LoadedProject, Project, ProjEnv};
    use drydock_result::{ResultDef, ResultGraph};
    use drydock_source::SourceRegistry;
    use drydock_url::ServerRegistry;

    use super::*;

    /// Build a minimal single-result project with no sources, no chroot
    /// groups and an empty build script, rooted at a fresh tempdir, enough
    /// to drive `result_available`'s scratch-BuildID path through
    /// `driver::run` end to end without ever invoking the privileged
    /// helper.
    fn minimal_loaded_project(root: &Path, result_name: &str) -> LoadedProject {
        std::fs::create_dir_all(root.join("proj/init")).unwrap();

        let project = Project {
            name: "demo".to_string(),
            release_id: "0".to_string(),
            chroot_arch: ChrootArch::X86_64,
            default_results: vec![result_name.to_string()],
            deploy_results: Vec::new(),
            required_checksums: BTreeSet::new(),
        };

        let mut results = ResultGraph::new();
        results.insert(ResultDef::new(result_name)).unwrap();

        LoadedProject {
            root: root.to_path_buf(),
            project,
            env: ProjEnv { global: Environment::new() },
            servers: ServerRegistry::new(),
            licences: Default::default(),
            chroot_groups: ChrootGroupRegistry::new(),
            sources: SourceRegistry::with_builtins(),
            results,
        }
    }

    #[test]
    fn run_computes_a_working_copy_build_and_reports_ok() {
        let td = tempfile::tempdir().unwrap();
        let loaded = minimal_loaded_project(td.path(), "libc");

        let ctx = PipelineContext::new(
            loaded,
            drydock_policy::BuildMode::WorkingCopy,
            td.path().join("tmp"),
            td.path().join("out"),
            td.path().join("store"),
            Path::new("/bin/true").to_path_buf(),
            PipelineOptions {
                dry_run: true,
                ..Default::default()
            },
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let outcomes = run(&ctx, &["libc".to_string()], &mut NullReporter).unwrap();
        assert_eq!(outcomes.get("libc"), Some(&StepOutcome::Ok));
    }

    #[test]
    fn closure_with_depends_pulls_in_transitive_dependencies() {
        let td = tempfile::tempdir().unwrap();
        let mut loaded = minimal_loaded_project(td.path(), "app");
        let mut libc = ResultDef::new("libc");
        libc.depends = vec![];
        loaded.results.insert(libc).unwrap();
        let mut app = ResultDef::new("app2");
        app.depends = vec!["libc".to_string()];
        loaded.results.insert(app).unwrap();

        let ctx = PipelineContext::new(
            loaded,
            drydock_policy::BuildMode::WorkingCopy,
            td.path().join("tmp"),
            td.path().join("out"),
            td.path().join("store"),
            Path::new("/bin/true").to_path_buf(),
            PipelineOptions {
                dry_run: true,
                ..Default::default()
            },
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let outcomes = run(&ctx, &["app2".to_string()], &mut NullReporter).unwrap();
        assert_eq!(outcomes.get("app2"), Some(&StepOutcome::Ok));
        assert_eq!(outcomes.get("libc"), Some(&StepOutcome::Ok));
    }

    #[test]
    fn build_ids_only_computes_without_running_steps() {
        let td = tempfile::tempdir().unwrap();
        let loaded = minimal_loaded_project(td.path(), "libc");

        let ctx = PipelineContext::new(
            loaded,
            drydock_policy::BuildMode::WorkingCopy,
            td.path().join("tmp"),
            td.path().join("out"),
            td.path().join("store"),
            Path::new("/bin/true").to_path_buf(),
            PipelineOptions::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let ids = build_ids_only(&ctx, &["libc".to_string()]).unwrap();
        assert!(ids.contains_key("libc"));
        // Helper binary is never consulted: the chroot dir is never created.
        assert!(!td.path().join("tmp/chroot").exists());
    }
}
