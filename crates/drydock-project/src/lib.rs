//! Projects: the top-level unit a drydock invocation builds against.
//!
//! A [`Project`] carries the handful of attributes assigned to it
//! directly (name, release id, chroot arch, default/deploy result sets,
//! required checksum algorithms) and its `ProjID`. Everything else —
//! servers, licences, chroot groups, sources, results — lives in the
//! registries from `drydock-url`/`drydock-licence`/`drydock-chroot`/
//! `drydock-source`/`drydock-result`; [`load_project`] is what ties the
//! on-disk config DSL to all of it in one pass.

pub mod config;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use drydock_chroot::{ChrootGroup, ChrootGroupRegistry};
use drydock_environment::Environment;
use drydock_hash::{Digest, Hasher};
use drydock_licence::{Licence, LicenceRegistry};
use drydock_result::{ResultDef, ResultGraph};
use drydock_source::SourceRegistry;
use drydock_url::{Server, ServerFlags, ServerRegistry};

pub use config::{ChecksumAlgo, ChrootArch};

pub type ProjId = Digest;

/// The project-level attributes named directly by a project's config.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub release_id: String,
    pub chroot_arch: ChrootArch,
    pub default_results: Vec<String>,
    pub deploy_results: Vec<String>,
    pub required_checksums: BTreeSet<ChecksumAlgo>,
}

impl Project {
    /// Compute this project's `ProjID`: the contents of every non-backup
    /// file under `proj/init/` (keyed by its relative location, sorted for
    /// determinism), followed by `release_id`, `name`, `chroot_arch` and
    /// the tool's major version — so a project's identity changes if its
    /// init scaffolding, its declared release, or the tool building it
    /// changes incompatibly.
    pub fn proj_id(&self, init_dir: &Path, tool_major_version: u32) -> Result<ProjId> {
        let mut entries = Vec::new();
        if init_dir.exists() {
            collect_init_files(init_dir, init_dir, &mut entries)?;
        }
        entries.sort();

        let mut hasher = Hasher::new();
        for (relative, path) in &entries {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read init file {}", path.display()))?;
            hasher.hash_line(relative);
            hasher.hash_line(&drydock_hash::hash_bytes(&bytes).to_hex());
        }
        hasher.hash_line(&self.release_id);
        hasher.hash_line(&self.name);
        hasher.hash_line(self.chroot_arch.as_str());
        hasher.hash_line(&tool_major_version.to_string());
        Ok(hasher.finish())
    }
}

/// A backup file (editor swap/backup artifact) is excluded from `ProjID`
/// computation: only non-backup files under `proj/init/` count.
fn is_backup_file(name: &str) -> bool {
    name.ends_with('~') || name.ends_with(".bak")
}

fn collect_init_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<()> {
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_init_files(root, &path, out)?;
            continue;
        }
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if is_backup_file(&file_name) {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        out.push((relative, path));
    }
    Ok(())
}

/// The project's own default environment (`proj/env`), kept separate from
/// any individual result's environment so the merge direction — project
/// defaults first, then source-attached variables, then a result's own
/// overrides — stays explicit at every step.
#[derive(Debug, Clone, Default)]
pub struct ProjEnv {
    pub global: Environment,
}

impl ProjEnv {
    /// Layer `source_env` (non-overriding — first writer wins among
    /// sources) and then `result_env` (always overriding) on top of the
    /// project's global environment, producing the environment a single
    /// result actually builds with.
    pub fn resolve_for_result(&self, source_env: &Environment, result_env: &Environment) -> Environment {
        let mut env = self.global.clone();
        env.merge(source_env, false);
        env.merge(result_env, true);
        env
    }
}

/// Everything [`load_project`] assembles from one project's on-disk tree:
/// the typed [`Project`]/[`ProjEnv`], and the frozen registries every other
/// crate's ID computation or pipeline step needs to look names up in.
pub struct LoadedProject {
    /// The project's root directory, kept around so later callers (e.g. the
    /// pipeline's `result_available` step) can recompute `ProjID` via
    /// `project.proj_id(&root.join("proj/init"), ...)` without the loader
    /// needing to bake a tool version into `LoadedProject` itself.
    pub root: PathBuf,
    pub project: Project,
    pub env: ProjEnv,
    pub servers: ServerRegistry,
    pub licences: LicenceRegistry,
    pub chroot_groups: ChrootGroupRegistry,
    pub sources: SourceRegistry,
    pub results: ResultGraph,
}

/// Load and fully validate a project rooted at `root`, following the
/// directory layout `proj/{config,env,chroot,licences,init/}`,
/// `src/<name>/config`, `res/<name>/{config,build-script}`.
pub fn load_project(root: &Path) -> Result<LoadedProject> {
    let proj_dir = root.join("proj");
    let project_cfg: config::ProjectFileConfig = config::load_toml(&proj_dir.join("config"))
        .context("failed to load proj/config")?;
    let global_env = config::load_env_file(&proj_dir.join("env")).context("failed to load proj/env")?;

    let servers = load_servers(&project_cfg)?;
    let required_checksums: BTreeSet<ChecksumAlgo> = project_cfg.checksums.iter().cloned().collect();

    let chroot_cfg: config::ChrootFileConfig = load_optional(&proj_dir.join("chroot"))?;
    let licence_cfg: config::LicenceFileConfig = load_optional(&proj_dir.join("licences"))?;

    let licences = load_licences(&licence_cfg, &servers, &required_checksums)?;
    let chroot_groups = load_chroot_groups(&chroot_cfg, &servers, &required_checksums)?;

    let project_env = ProjEnv {
        global: Environment::from_iter(global_env),
    };

    let sources = load_sources(&root.join("src"), &servers, &licences, &required_checksums)?;
    let results = load_results(
        &root.join("src"),
        &root.join("res"),
        &sources,
        &chroot_groups,
        &project_env,
    )?;

    let project = Project {
        name: project_cfg.name,
        release_id: project_cfg.release_id,
        chroot_arch: project_cfg.chroot_arch,
        default_results: project_cfg.default_results,
        deploy_results: project_cfg.deploy_results,
        required_checksums,
    };

    for name in &project.default_results {
        results
            .get(name)
            .with_context(|| format!("default_results names unknown result {name}"))?;
    }
    for name in &project.deploy_results {
        results
            .get(name)
            .with_context(|| format!("deploy_results names unknown result {name}"))?;
    }
    results.topo_sort().context("result dependency graph is invalid")?;

    Ok(LoadedProject {
        root: root.to_path_buf(),
        project,
        env: project_env,
        servers,
        licences,
        chroot_groups,
        sources,
        results,
    })
}

fn load_optional<T: Default + for<'de> serde::Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    config::load_toml(path)
}

fn load_servers(project_cfg: &config::ProjectFileConfig) -> Result<ServerRegistry> {
    let mut registry = ServerRegistry::new();
    for (name, entry) in &project_cfg.servers {
        registry.insert(Server::new(
            name.clone(),
            entry.url.clone(),
            ServerFlags {
                cache: entry.cache,
                writeback: entry.writeback,
                push_permissions: entry.push_permissions,
            },
        ))?;
    }
    Ok(registry)
}

fn server_is_local(servers: &ServerRegistry, name: &str) -> Result<bool> {
    Ok(servers
        .get(name)
        .with_context(|| format!("unknown server: {name}"))?
        .is_local())
}

/// Enforce both the generic "a non-local file needs *a* checksum" invariant
/// (`drydock_file::File::validate`) and, when the project names a non-empty
/// `required_checksums` set, that at least one of those *specific*
/// algorithms is present — a project that requires `sha256` rejects a file
/// that only carries `sha1`.
fn validate_file_checksums(
    file: &drydock_file::File,
    local: bool,
    required: &BTreeSet<ChecksumAlgo>,
) -> Result<()> {
    file.validate(local)?;
    if !local && !required.is_empty() {
        let satisfied = required.iter().any(|algo| match algo {
            ChecksumAlgo::Sha1 => file.sha1.is_some(),
            ChecksumAlgo::Sha256 => file.sha256.is_some(),
        });
        if !satisfied {
            bail!(
                "file {}/{} does not carry any of the project's required checksum algorithms",
                file.server,
                file.location
            );
        }
    }
    Ok(())
}

fn load_licences(
    cfg: &config::LicenceFileConfig,
    servers: &ServerRegistry,
    required_checksums: &BTreeSet<ChecksumAlgo>,
) -> Result<LicenceRegistry> {
    let mut registry = LicenceRegistry::new();
    for (name, entry) in &cfg.0 {
        let mut licence = Licence::new(name.clone());
        for file_cfg in &entry.files {
            let file = file_cfg.resolve(entry.server.as_deref())?;
            validate_file_checksums(&file, server_is_local(servers, &file.server)?, required_checksums)?;
            licence.files.push(file);
        }
        registry.insert(licence)?;
    }
    Ok(registry)
}

fn load_chroot_groups(
    cfg: &config::ChrootFileConfig,
    servers: &ServerRegistry,
    required_checksums: &BTreeSet<ChecksumAlgo>,
) -> Result<ChrootGroupRegistry> {
    let mut registry = ChrootGroupRegistry::new();
    for group_cfg in &cfg.groups {
        let mut group = ChrootGroup::new(group_cfg.name.clone());
        for file_cfg in &group_cfg.files {
            let file = file_cfg.resolve(group_cfg.server.as_deref())?;
            validate_file_checksums(&file, server_is_local(servers, &file.server)?, required_checksums)?;
            group.files.push(file);
        }
        registry.insert(group)?;
    }
    registry.set_default_groups(cfg.default_groups.iter().cloned());
    Ok(registry)
}

fn subdirectories(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            out.push((name, entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

fn load_sources(
    src_dir: &Path,
    servers: &ServerRegistry,
    licences: &LicenceRegistry,
    required_checksums: &BTreeSet<ChecksumAlgo>,
) -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::with_builtins();
    for (name, dir) in subdirectories(src_dir)? {
        let cfg: config::SourceFileConfig = config::load_toml(&dir.join("config"))
            .with_context(|| format!("failed to load src/{name}/config"))?;

        match cfg.source_type.as_str() {
            "files" => {
                // `FilesSource` needs fully resolved `File` objects, which
                // the generic `SourceFactory::build` signature (string args
                // only) cannot express, so it is built directly rather than
                // through the string-args factory path.
                let files = cfg
                    .files
                    .iter()
                    .map(|f| {
                        let file = f.resolve(cfg.server.as_deref())?;
                        validate_file_checksums(&file, server_is_local(servers, &file.server)?, required_checksums)?;
                        Ok(file)
                    })
                    .collect::<Result<Vec<_>>>()?;
                registry.insert(
                    name.clone(),
                    Box::new(drydock_source::FilesSource::new(name.clone(), files)),
                )?;
            }
            "git" => {
                let server_name = cfg.server.clone().unwrap_or_default();
                let server_url = match &cfg.server {
                    Some(server_name) => servers
                        .get(server_name)
                        .with_context(|| format!("source {name} references unknown server {server_name}"))?
                        .url
                        .clone(),
                    None => String::new(),
                };
                let location = cfg.location.clone().unwrap_or_default();
                let url = join_server_location(&server_url, &location);

                licences
                    .require_all(&cfg.licences)
                    .with_context(|| format!("source {name} references an unknown licence"))?;

                // `GitSource` needs a richer set of fields (server/location/
                // working/licences/env) than the generic string-args
                // `SourceFactory::build` signature can express, so it is
                // built directly, the same way `FilesSource` is above.
                let mut source = drydock_source::GitSource::new(name.clone(), url);
                source.server = server_name;
                source.location = location;
                source.working = cfg.working;
                source.licences = cfg.licences.clone();
                source.env = Environment::from_iter(cfg.env.clone());
                registry.insert(name.clone(), Box::new(source))?;
            }
            other => bail!("src/{name}/config names unsupported source type: {other}"),
        }
    }
    Ok(registry)
}

fn join_server_location(server_url: &str, location: &str) -> String {
    if server_url.is_empty() {
        return location.to_string();
    }
    if server_url.ends_with('/') || location.is_empty() {
        format!("{server_url}{location}")
    } else {
        format!("{server_url}/{location}")
    }
}

/// Recover each source's `env` table,
/// tracked outside `SourceRegistry` since that crate's `Source` trait has
/// no notion of a config-supplied environment.
fn reload_source_envs(src_dir: &Path) -> Result<std::collections::BTreeMap<String, Environment>> {
    let mut out = std::collections::BTreeMap::new();
    for (name, dir) in subdirectories(src_dir)? {
        let cfg: config::SourceFileConfig = config::load_toml(&dir.join("config"))
            .with_context(|| format!("failed to load src/{name}/config"))?;
        out.insert(name, Environment::from_iter(cfg.env));
    }
    Ok(out)
}

fn load_results(
    src_dir: &Path,
    res_dir: &Path,
    sources: &SourceRegistry,
    chroot_groups: &ChrootGroupRegistry,
    project_env: &ProjEnv,
) -> Result<ResultGraph> {
    let source_envs = reload_source_envs(src_dir)?;
    let mut graph = ResultGraph::new();
    for (name, dir) in subdirectories(res_dir)? {
        let cfg: config::ResultFileConfig = config::load_toml(&dir.join("config"))
            .with_context(|| format!("failed to load res/{name}/config"))?;

        let build_script_path = dir.join("build-script");
        let build_script_bytes = fs::read(&build_script_path)
            .with_context(|| format!("res/{name}/build-script must exist"))?;
        let build_script_digest = drydock_hash::hash_bytes(&build_script_bytes).to_hex();

        let mut result = ResultDef::new(name.clone());
        result.sources = cfg.sources.clone();
        result.depends = cfg.depends;
        result.chroot_groups = cfg.chroot;
        result.build_script = build_script_digest;
        result.collect_project = cfg.collect_project;

        let mut combined_source_env = Environment::new();
        for source_name in &cfg.sources {
            if let Some(source_env) = source_envs.get(source_name) {
                combined_source_env.merge(source_env, false);
            }
        }
        let result_env = Environment::from_iter(cfg.env);
        result.env = project_env.resolve_for_result(&combined_source_env, &result_env);

        result.validate_against(sources, chroot_groups)?;
        graph.insert(result)?;
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn minimal_project(root: &Path) {
        write(
            &root.join("proj/config"),
            r#"
name = "demo"
release_id = "2026.1"
chroot_arch = "x86_64"
default_results = ["hello"]
"#,
        );
        write(&root.join("proj/env"), "");
        write(
            &root.join("res/hello/config"),
            r#"
sources = []
"#,
        );
        write(&root.join("res/hello/build-script"), "#!/bin/sh\necho hi\n");
    }

    #[test]
    fn loads_a_minimal_project() {
        let td = tempdir().unwrap();
        minimal_project(td.path());

        let loaded = load_project(td.path()).unwrap();
        assert_eq!(loaded.project.name, "demo");
        assert_eq!(loaded.project.release_id, "2026.1");
        assert!(loaded.results.get("hello").is_some());
    }

    #[test]
    fn rejects_unknown_keys_in_project_config() {
        let td = tempdir().unwrap();
        minimal_project(td.path());
        write(
            &td.path().join("proj/config"),
            r#"
name = "demo"
release_id = "2026.1"
chroot_arch = "x86_64"
bogus_key = true
"#,
        );
        assert!(load_project(td.path()).is_err());
    }

    #[test]
    fn default_results_must_reference_a_real_result() {
        let td = tempdir().unwrap();
        minimal_project(td.path());
        write(
            &td.path().join("proj/config"),
            r#"
name = "demo"
release_id = "2026.1"
chroot_arch = "x86_64"
default_results = ["missing"]
"#,
        );
        assert!(load_project(td.path()).is_err());
    }

    #[test]
    fn proj_id_changes_when_an_init_file_changes() {
        let td = tempdir().unwrap();
        minimal_project(td.path());
        let loaded = load_project(td.path()).unwrap();

        write(&td.path().join("proj/init/bootstrap.sh"), "echo one\n");
        let before = loaded.project.proj_id(&td.path().join("proj/init"), 1).unwrap();

        write(&td.path().join("proj/init/bootstrap.sh"), "echo two\n");
        let after = loaded.project.proj_id(&td.path().join("proj/init"), 1).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn proj_id_ignores_backup_files() {
        let td = tempdir().unwrap();
        minimal_project(td.path());
        let loaded = load_project(td.path()).unwrap();

        write(&td.path().join("proj/init/bootstrap.sh"), "echo one\n");
        let before = loaded.project.proj_id(&td.path().join("proj/init"), 1).unwrap();

        write(&td.path().join("proj/init/bootstrap.sh~"), "echo stale\n");
        let after = loaded.project.proj_id(&td.path().join("proj/init"), 1).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn file_entry_without_server_or_inheritance_fails() {
        let entry = config::FileEntryConfig {
            location: "a.tar".to_string(),
            server: None,
            sha1: None,
            sha256: None,
            unpack: true,
            copy: false,
            patch: false,
            licences: Vec::new(),
        };
        assert!(entry.resolve(None).is_err());
        assert!(entry.resolve(Some("local")).is_ok());
    }

    #[test]
    fn file_entry_requires_exactly_one_action() {
        let mut entry = config::FileEntryConfig {
            location: "a.tar".to_string(),
            server: Some("local".to_string()),
            sha1: None,
            sha256: None,
            unpack: true,
            copy: true,
            patch: false,
            licences: Vec::new(),
        };
        assert!(entry.resolve(None).is_err());
        entry.copy = false;
        assert!(entry.resolve(None).is_ok());
    }

    #[test]
    fn proj_env_resolve_applies_source_then_result_precedence() {
        let mut global = Environment::new();
        global.set("A", "project");
        global.set("B", "project");
        let env = ProjEnv { global };

        let mut source_env = Environment::new();
        source_env.set("B", "source");
        source_env.set("C", "source");

        let mut result_env = Environment::new();
        result_env.set("C", "result");

        let resolved = env.resolve_for_result(&source_env, &result_env);
        assert_eq!(resolved.get("A"), Some("project"));
        assert_eq!(resolved.get("B"), Some("source"));
        assert_eq!(resolved.get("C"), Some("result"));
    }

    #[test]
    fn required_checksum_algorithm_is_enforced_on_non_local_files() {
        let mut required = BTreeSet::new();
        required.insert(ChecksumAlgo::Sha256);

        let mut file = drydock_file::File::new("remote", "pkg.tar", drydock_file::FileAction::Unpack);
        file.sha1 = Some("deadbeef".to_string());
        assert!(validate_file_checksums(&file, false, &required).is_err());

        file.sha256 = Some("cafef00d".to_string());
        assert!(validate_file_checksums(&file, false, &required).is_ok());
    }
}
