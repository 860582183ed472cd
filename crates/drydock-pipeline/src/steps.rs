//! The fifteen ordered, named pipeline steps.
//!
//! Each function below corresponds to exactly one step and returns a
//! [`StepOutcome`]; the driver (`driver.rs`) sequences them, stopping a
//! result's build on `Skip`, propagating `Error` as a whole-build abort, and
//! unconditionally running the chroot-teardown steps on every exit path
//! (section 8, property 6) except the playground's deliberate exception
//! (see [`playground`]).

use std::fs;
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;

use drydock_events::StepOutcome;
use drydock_lock::LockFile;
use drydock_policy::BuildId;
use drydock_source::FileFetchContext as _;
use drydock_store::{CURRENT_RECEIPT_VERSION, EnvironmentFingerprint, FileChecksum, Receipt};

use crate::config::BuildConfig;
use crate::context::{DEPLOY_SERVER_NAME, RESULTS_SERVER_NAME, PipelineContext, ensure_dir};

/// Mutable, per-result state threaded through the step sequence. Everything
/// here is either produced by an earlier step and consumed by a later one,
/// or spans the whole run (the chroot lock, held from `chroot_lock` through
/// `chroot_unlock`).
pub struct RunState {
    pub result: String,
    pub build_id: BuildId,
    pub config: BuildConfig,
    pub is_playground: bool,
    /// Each dependency's already-resolved BuildID, in `depends` order, so
    /// `sources` can unpack `dep/<name>/` without recomputing anything the
    /// driver already knows.
    pub depend_build_ids: Vec<(String, BuildId)>,
    pub lock: Option<LockFile>,
    pub started_at: chrono::DateTime<Utc>,
}

impl RunState {
    pub fn new(result: impl Into<String>, build_id: BuildId, config: BuildConfig, is_playground: bool) -> Self {
        Self {
            result: result.into(),
            build_id,
            config,
            is_playground,
            depend_build_ids: Vec::new(),
            lock: None,
            started_at: Utc::now(),
        }
    }
}

/// Step 1 — materialize the per-result build configuration. The struct
/// itself is built by the driver (it needs the already-computed BuildID),
/// so this step's own job is just to stake out the directory tree the rest
/// of the pipeline writes into.
pub fn build_config(state: &RunState) -> Result<StepOutcome> {
    ensure_dir(&state.config.base)?;
    Ok(StepOutcome::Ok)
}

/// Step 2 — is this BuildID already built? A cache hit short-circuits the
/// rest of the pipeline with `Skip`; working-copy builds, forced rebuilds,
/// and playground builds always proceed regardless of cache state.
pub fn result_available(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    if matches!(ctx.mode, drydock_policy::BuildMode::WorkingCopy) || ctx.options.force_rebuild || state.is_playground {
        return Ok(StepOutcome::Ok);
    }

    if ctx.store.is_available(&state.result, state.build_id.as_str()) {
        ctx.store
            .deploy(&ctx.out_dir, &state.result, state.build_id.as_str())
            .context("relinking out/<result>/last for an already-available build")?;
        return Ok(StepOutcome::Skip);
    }

    let skip_remote_check = ctx.options.dry_run && !ctx.options.check_remote;
    if !skip_remote_check {
        if let Ok(transport) = ctx.transport_for(RESULTS_SERVER_NAME) {
            let location = format!(
                "{}/{}/result.tar",
                ctx.mode.storage_path(&ctx.loaded.project.release_id, &state.result),
                state.build_id
            );
            let build_dir = ctx.store.build_dir(&state.result, state.build_id.as_str());
            ensure_dir(&build_dir)?;
            let tar_path = build_dir.join("result.tar");
            if transport.fetch_file(&location, &tar_path).is_ok() {
                unpack_pulled_result(ctx, &state.result, state.build_id.as_str(), &tar_path)?;
                ctx.store
                    .deploy(&ctx.out_dir, &state.result, state.build_id.as_str())
                    .context("relinking out/<result>/last for a pulled build")?;
                return Ok(StepOutcome::Skip);
            }
            let _ = fs::remove_file(&tar_path);
        }
    }

    Ok(StepOutcome::Ok)
}

/// Unpack a freshly-pulled `result.tar` into the store's payload directory
/// and write a minimal receipt, so later dependents can install it and
/// `is_available` reports it from now on.
fn unpack_pulled_result(ctx: &PipelineContext, result: &str, build_id: &str, tar_path: &Path) -> Result<()> {
    let payload_dir = ctx.store.result_payload_dir(result, build_id);
    ensure_dir(&payload_dir)?;
    let file = fs::File::open(tar_path).with_context(|| format!("failed to open {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(file);
    archive
        .unpack(&payload_dir)
        .with_context(|| format!("failed to unpack pulled archive {}", tar_path.display()))?;

    let checksums = read_checksums_file(&payload_dir.join("checksums")).unwrap_or_default();
    ctx.store.save_receipt(&Receipt {
        receipt_version: CURRENT_RECEIPT_VERSION.to_string(),
        result: result.to_string(),
        build_id: build_id.to_string(),
        started_at: Utc::now(),
        finished_at: Utc::now(),
        success: true,
        checksums,
        environment: EnvironmentFingerprint::collect(env!("CARGO_PKG_VERSION")),
    })
}

fn read_checksums_file(path: &Path) -> Option<Vec<FileChecksum>> {
    let content = fs::read_to_string(path).ok()?;
    Some(
        content
            .lines()
            .filter_map(|line| {
                let (sha1, rel) = line.split_once("  ")?;
                Some(FileChecksum {
                    path: rel.trim_start_matches("files/").to_string(),
                    sha1: sha1.to_string(),
                })
            })
            .collect(),
    )
}

/// Step 3 — create the sandbox base directory and take the exclusive
/// filesystem lock that covers this build's entire chroot lifetime.
/// Failure here is fatal: no chroot is ever touched without the lock held.
pub fn chroot_lock(state: &mut RunState) -> Result<StepOutcome> {
    ensure_dir(&state.config.base)?;
    let lock = LockFile::acquire(&state.config.base).context("failed to acquire chroot lock")?;
    lock.set_build_id(state.build_id.as_str()).ok();
    state.lock = Some(lock);
    Ok(StepOutcome::Ok)
}

/// Step 4 — tear down a stale chroot left behind by a previous, interrupted
/// run, detected by the marker file it would have created.
pub fn chroot_cleanup_if_exists(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    if state.config.chroot_marker.exists() {
        ctx.helper
            .remove_chroot(&state.config.chroot)
            .context("failed to remove a stale chroot left by a previous run")?;
    }
    Ok(StepOutcome::Ok)
}

fn tar_type_for(location: &str) -> Result<&'static str> {
    if location.ends_with(".tar.gz") || location.ends_with(".tgz") {
        Ok("tar.gz")
    } else if location.ends_with(".tar.bz2") {
        Ok("tar.bz2")
    } else if location.ends_with(".tar.xz") {
        Ok("tar.xz")
    } else if location.ends_with(".tar") {
        Ok("tar")
    } else {
        bail!("file {location} does not have a recognized tar suffix (.tar, .tar.gz/.tgz, .tar.bz2, .tar.xz)")
    }
}

/// Step 5 — create the chroot, mark it as ours, and populate its root
/// filesystem from every file in every resolved chroot group.
pub fn setup_chroot(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    ensure_dir(&state.config.chroot)?;
    fs::write(&state.config.chroot_marker, Utc::now().to_rfc3339())
        .with_context(|| format!("failed to write chroot marker {}", state.config.chroot_marker.display()))?;

    ctx.helper
        .set_permissions(&state.config.chroot, false)
        .context("failed to apply the initial sandbox permission policy")?;

    let result = ctx
        .loaded
        .results
        .get(&state.result)
        .with_context(|| format!("unknown result: {}", state.result))?;
    let groups = ctx.loaded.chroot_groups.resolve(&result.chroot_groups)?;

    let fetch_dir = state.config.base.join("chroot-fetch");
    ensure_dir(&fetch_dir)?;

    for group in groups {
        for file in &group.files {
            let transport = ctx.transport_for(&file.server)?;
            let local = fetch_dir.join(sanitize_location(&file.location));
            if let Some(parent) = local.parent() {
                ensure_dir(parent)?;
            }
            {
                let mut cache = ctx.hash_cache();
                file.checksum_verify(transport.as_ref(), &mut cache, &local, ctx.options.check_remote)
                    .with_context(|| format!("failed to fetch/verify {}/{}", file.server, file.location))?;
            }
            let tar_type = tar_type_for(&file.location)?;
            ctx.helper
                .extract_tar(&state.config.chroot, tar_type, &local)
                .with_context(|| format!("failed to extract {tar_type} archive {}", file.location))?;
        }
    }

    Ok(StepOutcome::Ok)
}

fn sanitize_location(location: &str) -> String {
    location.replace(['/', '\\'], "_")
}

/// Build a shell-escaped `KEY=VALUE` assignment line, the format used for
/// `env/builtin` and `env/env`.
fn shell_assignment(key: &str, value: &str) -> String {
    format!("{key}={}", shell_quote_single(value))
}

fn shell_quote_single(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Step 6 — populate the in-chroot build tree: fixed subdirectories, the
/// build script, the environment files, project init files, the generated
/// build-driver scripts, unpacked build-time dependencies, and each
/// source's prepared content.
pub fn sources(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    let build_root = &state.config.build_dir;
    for sub in ["out", "init", "script", "build", "root", "env", "dep"] {
        ensure_dir(&build_root.join(sub))?;
    }

    let result = ctx
        .loaded
        .results
        .get(&state.result)
        .with_context(|| format!("unknown result: {}", state.result))?;

    fs::write(build_root.join("script/build-script"), &result.build_script)
        .context("failed to write script/build-script")?;

    write_env_file(&build_root.join("env/builtin"), state.config.builtin_env.iter())?;
    write_env_file(&build_root.join("env/env"), result.env.iter())?;

    copy_init_files(&ctx.loaded.root.join("proj/init"), &build_root.join("init"))?;

    let init_names = list_init_file_names(&ctx.loaded.root.join("proj/init"))?;
    write_build_driver_scripts(&build_root.join("script"), &state.config.tc, &init_names)?;

    for (dep_name, dep_build_id) in &state.depend_build_ids {
        let payload = ctx.store.result_payload_dir(dep_name, dep_build_id.as_str()).join("files");
        let dest = build_root.join("dep").join(dep_name);
        ensure_dir(&dest)?;
        if payload.exists() {
            copy_dir_recursive(&payload, &dest)
                .with_context(|| format!("failed to install dependency {dep_name} into dep/{dep_name}"))?;
        }
    }

    let source_set = ctx.mode.source_set();
    for source_name in &result.sources {
        let source = ctx
            .loaded
            .sources
            .get(source_name)
            .with_context(|| format!("unknown source: {source_name}"))?;
        source
            .prepare(&source_set, &build_root.join("build"), ctx)
            .with_context(|| format!("failed to prepare source {source_name}"))?;
    }

    Ok(StepOutcome::Ok)
}

fn write_env_file<'a>(path: &Path, vars: impl Iterator<Item = (&'a str, &'a str)>) -> Result<()> {
    let mut out = String::new();
    for (k, v) in vars {
        out.push_str(&shell_assignment(k, v));
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

fn is_backup_file(name: &str) -> bool {
    name.ends_with('~') || name.ends_with(".bak")
}

fn copy_init_files(init_dir: &Path, dest: &Path) -> Result<()> {
    if !init_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(init_dir).with_context(|| format!("failed to read {}", init_dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_backup_file(&name) {
            continue;
        }
        fs::copy(entry.path(), dest.join(name.as_ref()))
            .with_context(|| format!("failed to copy init file {name}"))?;
    }
    Ok(())
}

fn list_init_file_names(init_dir: &Path) -> Result<Vec<String>> {
    if !init_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(init_dir).with_context(|| format!("failed to read {}", init_dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_backup_file(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Write `build-driver`, `buildrc` and `buildrc-noinit` under `script/`: a
/// deterministic composition of sourcing the builtin and merged
/// environments, every init file in directory order, `cd`-ing into the
/// build directory, and finally the build script itself.
fn write_build_driver_scripts(script_dir: &Path, tc: &str, init_names: &[String]) -> Result<()> {
    let mut noinit = String::from("#!/bin/sh\nset -e\n");
    noinit.push_str("source env/builtin\n");
    noinit.push_str("source env/env\n");
    noinit.push_str(&format!("cd {tc}/build\n"));

    let mut with_init = noinit.clone();
    for name in init_names {
        with_init.push_str(&format!("source init/{name}\n"));
    }
    with_init.push_str(&format!("cd {tc}/build\n"));

    let mut buildrc = with_init.clone();
    buildrc.push_str("set\n");

    let mut driver = with_init;
    driver.push_str("source script/build-script\n");

    fs::write(script_dir.join("build-driver"), driver).context("failed to write script/build-driver")?;
    fs::write(script_dir.join("buildrc"), buildrc).context("failed to write script/buildrc")?;
    fs::write(script_dir.join("buildrc-noinit"), noinit).context("failed to write script/buildrc-noinit")?;
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to).with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

/// Step 7 — for a result carrying the `collect_project` marker, assemble a
/// standalone, fetch-and-verify-only reproduction of the whole project
/// under `<Tc>/project/`: every chroot group's files, every licence's
/// files, each result's `env`/`build-driver`/`config`, each source's
/// name+SourceID via `to_result`, a Makefile per result plus a root one,
/// and `resultlist`. Every file involved is fetched through the cache and
/// hash-verified rather than trusted from a prior local copy.
pub fn collect_project(ctx: &PipelineContext, state: &RunState, enabled: bool) -> Result<StepOutcome> {
    if !enabled {
        return Ok(StepOutcome::Ok);
    }

    let project_dir = state.config.build_dir.join("project");
    ensure_dir(&project_dir.join("chroot"))?;
    ensure_dir(&project_dir.join("licences"))?;
    ensure_dir(&project_dir.join("res"))?;

    collect_project_chroots(ctx, &project_dir.join("chroot"))?;
    collect_project_licences(ctx, &project_dir.join("licences"))?;

    let order = ctx.loaded.results.topo_sort().context("project has a cyclic result graph")?;
    for name in &order {
        collect_project_result(ctx, &project_dir.join("res").join(name), name)
            .with_context(|| format!("failed to assemble project reproduction for result {name}"))?;
    }

    let mut resultlist = String::new();
    for name in &order {
        resultlist.push_str(name);
        resultlist.push('\n');
    }
    fs::write(project_dir.join("resultlist"), resultlist).context("failed to write project/resultlist")?;

    write_project_makefile(&project_dir, &order)?;

    Ok(StepOutcome::Ok)
}

/// Fetch, hash-verify and extract every chroot group's files into
/// `project/chroot/<group>/`.
fn collect_project_chroots(ctx: &PipelineContext, chroot_dir: &Path) -> Result<()> {
    for group_name in ctx.loaded.chroot_groups.names() {
        let group = ctx
            .loaded
            .chroot_groups
            .get(group_name)
            .with_context(|| format!("unknown chroot group: {group_name}"))?;
        let dest = chroot_dir.join(group_name);
        ensure_dir(&dest)?;
        let fetch_dir = dest.join(".fetch");
        for file in &group.files {
            let local = fetch_dir.join(sanitize_location(&file.location));
            if let Some(parent) = local.parent() {
                ensure_dir(parent)?;
            }
            ctx.fetch_and_verify(file, &local)
                .with_context(|| format!("failed to fetch/verify chroot file {}/{}", file.server, file.location))?;
            let tar_type = tar_type_for(&file.location)?;
            extract_local_tar(&local, &dest)
                .with_context(|| format!("failed to extract {tar_type} archive {}", file.location))?;
        }
        let _ = fs::remove_dir_all(&fetch_dir);
    }
    Ok(())
}

/// Fetch and hash-verify every licence's text files into
/// `project/licences/<name>/`.
fn collect_project_licences(ctx: &PipelineContext, licences_dir: &Path) -> Result<()> {
    for name in ctx.loaded.licences.names() {
        let licence = ctx
            .loaded
            .licences
            .get(name)
            .with_context(|| format!("unknown licence: {name}"))?;
        let dest = licences_dir.join(name);
        ensure_dir(&dest)?;
        for file in &licence.files {
            let local = dest.join(sanitize_location(&file.location));
            if let Some(parent) = local.parent() {
                ensure_dir(parent)?;
            }
            ctx.fetch_and_verify(file, &local)
                .with_context(|| format!("failed to fetch/verify licence file {}/{}", file.server, file.location))?;
        }
    }
    Ok(())
}

/// Write one result's `config`, `env`, `build-driver`/`buildrc*` and
/// `sources` (each referenced source's name and resolved SourceID, via
/// `to_result`) into `project/res/<name>/`.
fn collect_project_result(ctx: &PipelineContext, dest: &Path, name: &str) -> Result<()> {
    ensure_dir(dest)?;
    let result = ctx
        .loaded
        .results
        .get(name)
        .with_context(|| format!("unknown result: {name}"))?;

    let mut config = String::new();
    config.push_str(&format!("sources = {:?}\n", result.sources));
    config.push_str(&format!("depends = {:?}\n", result.depends));
    config.push_str(&format!("chroot = {:?}\n", result.chroot_groups));
    fs::write(dest.join("config"), config).context("failed to write project result config")?;

    write_env_file(&dest.join("env"), result.env.iter())?;

    let init_names = list_init_file_names(&ctx.loaded.root.join("proj/init"))?;
    write_build_driver_scripts(dest, ".", &init_names)?;

    let source_set = ctx.mode.source_set();
    let mut sources = String::new();
    for source_name in &result.sources {
        let source = ctx
            .loaded
            .sources
            .get(source_name)
            .with_context(|| format!("unknown source: {source_name}"))?;
        let working_copy = ctx.source_working_copy(source_name);
        let (resolved_name, source_id) = source
            .to_result(&source_set, &working_copy, ctx)
            .with_context(|| format!("failed to resolve source {source_name} for the project reproduction"))?;
        sources.push_str(&format!("{resolved_name} {}\n", source_id.to_hex()));
    }
    fs::write(dest.join("sources"), sources).context("failed to write project result sources")?;

    Ok(())
}

/// Extract a tar archive (auto-detecting gzip/bzip2/xz compression) via the
/// system `tar` binary — this runs outside the chroot sandbox, so it has no
/// need for the privileged helper's `extract_tar` verb.
fn extract_local_tar(archive: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    let status = std::process::Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .status()
        .with_context(|| format!("failed to spawn tar for {}", archive.display()))?;
    if !status.success() {
        bail!("tar extraction of {} failed", archive.display());
    }
    Ok(())
}

/// Write a root `Makefile` that builds every result in topological order,
/// plus a trivial per-result `Makefile` that re-runs that result's
/// build-driver.
fn write_project_makefile(project_dir: &Path, order: &[String]) -> Result<()> {
    let mut root = String::from("all:\n");
    for name in order {
        root.push_str(&format!("\t$(MAKE) -C res/{name}\n"));
    }
    fs::write(project_dir.join("Makefile"), root).context("failed to write project/Makefile")?;

    for name in order {
        let per_result = "all:\n\tsh build-driver\n".to_string();
        fs::write(project_dir.join("res").join(name).join("Makefile"), per_result)
            .with_context(|| format!("failed to write project/res/{name}/Makefile"))?;
    }
    Ok(())
}

/// Step 8 — apply the fixed ownership/mode policy to the whole build tree.
/// Reuses the `set_permissions` verb (the helper protocol has no dedicated
/// "fix permissions" verb; `set_permissions` is described generically as
/// "applies a pre-defined ownership/mode policy").
pub fn fix_permissions(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    ctx.helper
        .set_permissions(&state.config.chroot, true)
        .context("failed to fix ownership/mode on the build tree")?;
    Ok(StepOutcome::Ok)
}

/// Step 9 — if this result was selected as a playground, stop here with the
/// chroot left populated for interactive entry. The driver, not this
/// function, is responsible for not releasing the chroot lock in that case.
pub fn playground(state: &RunState) -> Result<StepOutcome> {
    if state.is_playground {
        return Ok(StepOutcome::Skip);
    }
    Ok(StepOutcome::Ok)
}

/// Step 10 — run the in-chroot build script and capture its output to the
/// external build log.
///
/// The privileged helper (`drydock-helper`) buffers the child's stdout and
/// stderr fully rather than streaming them line-by-line, so this step
/// writes the captured output to the log once the helper returns rather
/// than flushing per line — documented as a known simplification in
/// DESIGN.md.
pub fn runbuild(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    rotate_log(&state.config.buildlog)?;

    let argv = vec![
        "/bin/bash".to_string(),
        "-e".to_string(),
        "-x".to_string(),
        format!("{}/script/build-driver", state.config.tc),
    ];
    let mut full_argv = state.config.chroot_call_prefix.clone();
    full_argv.extend(argv);

    let output = ctx
        .helper
        .chroot(&state.config.chroot, &full_argv)
        .context("failed to invoke the build script through the privileged helper")?;

    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&state.config.buildlog)
        .with_context(|| format!("failed to open build log {}", state.config.buildlog.display()))?;
    log.write_all(output.stdout.as_bytes()).ok();
    log.write_all(output.stderr.as_bytes()).ok();

    if output.exit_code != 0 {
        return Err(anyhow!(
            "build script for result {} exited with status {}; see {}",
            state.result,
            output.exit_code,
            state.config.buildlog.display()
        ));
    }

    Ok(StepOutcome::Ok)
}

fn rotate_log(path: &Path) -> Result<()> {
    if path.exists() {
        let rotated = path.with_extension(format!("{}.log", Utc::now().timestamp()));
        fs::rename(path, rotated).ok();
    }
    Ok(())
}

/// Step 11 — assemble `result/{files/,checksums,build.log.gz}` in a scratch
/// directory, tar it, and push the archive to the configured results
/// server. Also writes the local receipt and payload copy the result store
/// and dependency-installing `sources` step rely on.
pub fn store_result(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    let scratch = state.config.base.join("store-scratch");
    if scratch.exists() {
        fs::remove_dir_all(&scratch).ok();
    }
    let files_dir = scratch.join("result/files");
    ensure_dir(&files_dir)?;

    let out_dir = state.config.build_dir.join("out");
    if out_dir.exists() {
        copy_dir_recursive(&out_dir, &files_dir)?;
    }

    let mut checksums = String::new();
    let mut receipt_checksums = Vec::new();
    let mut artifact_paths = collect_file_list(&files_dir)?;
    artifact_paths.sort();
    for relative in &artifact_paths {
        let bytes = fs::read(files_dir.join(relative))
            .with_context(|| format!("failed to read output artifact {relative}"))?;
        let digest = {
            use sha1::{Digest as _, Sha1};
            let mut hasher = Sha1::new();
            hasher.update(&bytes);
            hex::encode(hasher.finalize())
        };
        checksums.push_str(&format!("{digest}  files/{relative}\n"));
        receipt_checksums.push(FileChecksum {
            path: relative.clone(),
            sha1: digest,
        });
    }
    fs::write(scratch.join("result/checksums"), &checksums).context("failed to write result/checksums")?;

    let log_bytes = fs::read(&state.config.buildlog).unwrap_or_default();
    let gz_path = scratch.join("result/build.log.gz");
    {
        let gz_file = fs::File::create(&gz_path).with_context(|| format!("failed to create {}", gz_path.display()))?;
        let mut encoder = flate2::write::GzEncoder::new(gz_file, flate2::Compression::default());
        encoder.write_all(&log_bytes).context("failed to gzip build log")?;
        encoder.finish().context("failed to finish gzip stream")?;
    }

    let tar_path = scratch.join("result.tar");
    {
        let tar_file = fs::File::create(&tar_path).with_context(|| format!("failed to create {}", tar_path.display()))?;
        let mut builder = tar::Builder::new(tar_file);
        builder
            .append_dir_all("result", scratch.join("result"))
            .context("failed to build result.tar")?;
        builder.finish().context("failed to finalize result.tar")?;
    }

    if let Ok(transport) = ctx.transport_for(RESULTS_SERVER_NAME) {
        let location = format!(
            "{}/{}/result.tar",
            ctx.mode.storage_path(&ctx.loaded.project.release_id, &state.result),
            state.build_id
        );
        transport
            .push_file(&tar_path, &location)
            .with_context(|| format!("failed to push result.tar to {location}"))?;
    }

    let payload_dir = ctx.store.result_payload_dir(&state.result, state.build_id.as_str());
    if payload_dir.exists() {
        fs::remove_dir_all(&payload_dir).ok();
    }
    ensure_dir(&payload_dir)?;
    copy_dir_recursive(&scratch.join("result"), &payload_dir)?;

    ctx.store.save_receipt(&Receipt {
        receipt_version: CURRENT_RECEIPT_VERSION.to_string(),
        result: state.result.clone(),
        build_id: state.build_id.to_string(),
        started_at: state.started_at,
        finished_at: Utc::now(),
        success: true,
        checksums: receipt_checksums,
        environment: EnvironmentFingerprint::collect(env!("CARGO_PKG_VERSION")),
    })?;

    Ok(StepOutcome::Ok)
}

fn collect_file_list(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    collect_file_list_into(root, root, &mut out)?;
    Ok(out)
}

fn collect_file_list_into(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_file_list_into(root, &path, out)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
            out.push(relative);
        }
    }
    Ok(())
}

/// Step 12 — for `release`-mode builds of a result in `deploy_results`, push
/// the result's checksums and artifacts to the deployment server, unless a
/// `checksums` file already exists at the destination (a short-circuit
/// warning rather than a silent re-deployment).
pub fn deploy(ctx: &PipelineContext, state: &RunState, mut warn: impl FnMut(&str)) -> Result<StepOutcome> {
    if !ctx.mode.deploys() || !ctx.loaded.project.deploy_results.iter().any(|r| r == &state.result) {
        return Ok(StepOutcome::Ok);
    }

    let Ok(transport) = ctx.transport_for(DEPLOY_SERVER_NAME) else {
        warn(&format!(
            "result {} is marked for deployment but no '{}' server is configured; skipping deploy",
            state.result, DEPLOY_SERVER_NAME
        ));
        return Ok(StepOutcome::Ok);
    };

    let base = format!("archive/{}/{}", ctx.loaded.project.release_id, state.result);
    let checksums_location = format!("{base}/checksums");

    let precheck_dest = state.config.base.join("deploy-precheck-checksums");
    if transport.fetch_file(&checksums_location, &precheck_dest).is_ok() {
        warn(&format!(
            "result {} is already deployed at {}; skipping re-deployment",
            state.result, checksums_location
        ));
        let _ = fs::remove_file(&precheck_dest);
        return Ok(StepOutcome::Ok);
    }

    let payload_dir = ctx.store.result_payload_dir(&state.result, state.build_id.as_str());
    let files_dir = payload_dir.join("files");
    if files_dir.exists() {
        for relative in collect_file_list(&files_dir)? {
            let local = files_dir.join(&relative);
            let location = format!("{base}/files/{relative}");
            transport
                .push_file(&local, &location)
                .with_context(|| format!("failed to deploy {relative} to {location}"))?;
        }
    }
    transport
        .push_file(&payload_dir.join("checksums"), &checksums_location)
        .context("failed to deploy checksums file")?;

    Ok(StepOutcome::Ok)
}

/// Step 13 — update `out/<result>/last` to point at the just-stored build.
pub fn linklast(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    ctx.store
        .deploy(&ctx.out_dir, &state.result, state.build_id.as_str())
        .context("failed to update out/<result>/last")?;
    Ok(StepOutcome::Ok)
}

/// Step 14 — tear down the chroot (unless `--keep` was given) and remove
/// the marker file.
pub fn chroot_cleanup(ctx: &PipelineContext, state: &RunState) -> Result<StepOutcome> {
    if ctx.options.keep_chroot {
        return Ok(StepOutcome::Ok);
    }
    if state.config.chroot.exists() {
        ctx.helper
            .remove_chroot(&state.config.chroot)
            .context("failed to remove the chroot")?;
    }
    let _ = fs::remove_file(&state.config.chroot_marker);
    Ok(StepOutcome::Ok)
}

/// Step 15 — release the per-build filesystem lock.
pub fn chroot_unlock(state: &mut RunState) -> Result<StepOutcome> {
    if let Some(mut lock) = state.lock.take() {
        lock.release().context("failed to release the chroot lock")?;
    }
    Ok(StepOutcome::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_type_for_recognizes_every_supported_suffix() {
        assert_eq!(tar_type_for("pkg.tar").unwrap(), "tar");
        assert_eq!(tar_type_for("pkg.tar.gz").unwrap(), "tar.gz");
        assert_eq!(tar_type_for("pkg.tgz").unwrap(), "tar.gz");
        assert_eq!(tar_type_for("pkg.tar.bz2").unwrap(), "tar.bz2");
        assert_eq!(tar_type_for("pkg.tar.xz").unwrap(), "tar.xz");
    }

    #[test]
    fn tar_type_for_rejects_unknown_suffix() {
        assert!(tar_type_for("pkg.zip").is_err());
    }

    #[test]
    fn shell_assignment_quotes_and_escapes_single_quotes() {
        assert_eq!(shell_assignment("A", "it's"), "A='it'\\''s'");
    }

    #[test]
    fn sanitize_location_replaces_path_separators() {
        assert_eq!(sanitize_location("a/b\\c"), "a_b_c");
    }

    #[test]
    fn write_build_driver_scripts_compose_init_files_in_order() {
        let td = tempfile::tempdir().unwrap();
        write_build_driver_scripts(td.path(), "/build", &["a".to_string(), "b".to_string()]).unwrap();

        let driver = fs::read_to_string(td.path().join("build-driver")).unwrap();
        let a_pos = driver.find("source init/a").unwrap();
        let b_pos = driver.find("source init/b").unwrap();
        assert!(a_pos < b_pos);
        assert!(driver.contains("source script/build-script"));
        assert!(driver.contains("cd /build/build"));

        let buildrc = fs::read_to_string(td.path().join("buildrc")).unwrap();
        assert!(buildrc.trim_end().ends_with("set"));

        let noinit = fs::read_to_string(td.path().join("buildrc-noinit")).unwrap();
        assert!(!noinit.contains("source init/"));
    }

    #[test]
    fn copy_dir_recursive_copies_nested_structure() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        fs::write(src.join("nested/b.txt"), b"b").unwrap();

        let dest = td.path().join("dest");
        copy_dir_recursive(&src, &dest).unwrap();

        assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(dest.join("nested/b.txt")).unwrap(), b"b");
    }

    #[test]
    fn collect_file_list_is_relative_and_recursive() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir_all(td.path().join("bin")).unwrap();
        fs::write(td.path().join("bin/hello"), b"hi").unwrap();

        let mut files = collect_file_list(td.path()).unwrap();
        files.sort();
        assert_eq!(files, vec!["bin/hello".to_string()]);
    }

    #[test]
    fn read_checksums_file_parses_sha1sum_style_lines() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("checksums");
        fs::write(&path, "deadbeef  files/bin/hello\n").unwrap();

        let checksums = read_checksums_file(&path).unwrap();
        assert_eq!(checksums.len(), 1);
        assert_eq!(checksums[0].path, "bin/hello");
        assert_eq!(checksums[0].sha1, "deadbeef");
    }

    #[test]
    fn extract_local_tar_unpacks_via_system_tar() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("marker"), b"hi").unwrap();

        let archive = td.path().join("archive.tar");
        let status = std::process::Command::new("tar")
            .arg("-cf")
            .arg(&archive)
            .arg("-C")
            .arg(&src)
            .arg("marker")
            .status()
            .unwrap();
        assert!(status.success());

        let dest = td.path().join("dest");
        extract_local_tar(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("marker")).unwrap(), b"hi");
    }

    #[test]
    fn write_project_makefile_lists_every_result_in_order() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir_all(td.path().join("res/a")).unwrap();
        fs::create_dir_all(td.path().join("res/b")).unwrap();

        let order = vec!["a".to_string(), "b".to_string()];
        write_project_makefile(td.path(), &order).unwrap();

        let root = fs::read_to_string(td.path().join("Makefile")).unwrap();
        let a_pos = root.find("res/a").unwrap();
        let b_pos = root.find("res/b").unwrap();
        assert!(a_pos < b_pos);

        assert!(fs::read_to_string(td.path().join("res/a/Makefile")).unwrap().contains("build-driver"));
        assert!(fs::read_to_string(td.path().join("res/b/Makefile")).unwrap().contains("build-driver"));
    }
}
