//! The single-threaded, cooperative build driver: works
//! out which results need a BuildID at all, computes every one of them in
//! topological order (the ID algebra, section 4.7, requires a dependency's
//! BuildID before its dependent's can be computed), then runs the fifteen
//! pipeline steps for the results actually selected to build plus the
//! transitive closure of their `depends` edges.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};
use chrono::Utc;

use drydock_environment::Environment;
use drydock_events::{EventKind, EventLog, PipelineEvent, StepOutcome};
use drydock_policy::{BuildId, BuildIdInputs, build_id};

use crate::config::BuildConfig;
use crate::context::{PipelineContext, host_arch};
use crate::steps::{self, RunState};

/// The major version folded into `ProjID`: bumping it
/// invalidates every cached BuildID in the project at once, the escape
/// hatch for a backward-incompatible change to the ID algebra itself.
const TOOL_MAJOR_VERSION: u32 = 3;

/// Minimal sink for driver progress; the CLI supplies a terminal-backed
/// implementation, tests a recording one. Trimmed to the three severities
/// the pipeline actually emits.
pub trait Reporter {
    fn info(&mut self, message: &str);
    fn warn(&mut self, message: &str);
    fn error(&mut self, message: &str);
}

/// A `Reporter` that discards everything, for tests and non-interactive use.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _message: &str) {}
    fn warn(&mut self, _message: &str) {}
    fn error(&mut self, _message: &str) {}
}

/// Resolve the transitive closure of `selected` over the `depends` edges of
/// every known result, so `sources` (step 6) can always find an
/// already-built dependency in the store.
fn closure_with_depends(ctx: &PipelineContext, selected: &[String]) -> Result<BTreeSet<String>> {
    let mut closure: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = selected.to_vec();
    while let Some(name) = stack.pop() {
        if !closure.insert(name.clone()) {
            continue;
        }
        let result = ctx
            .loaded
            .results
            .get(&name)
            .with_context(|| format!("unknown result: {name}"))?;
        for dep in &result.depends {
            if !closure.contains(dep) {
                stack.push(dep.clone());
            }
        }
    }
    Ok(closure)
}

/// Compute the BuildID of one result, given every dependency's BuildID
/// already computed (the driver walks topological order, so this always
/// holds). Folds in the combined FileID/source/env/licence machinery the
/// ID algebra chains through ResultID.
fn compute_build_id(
    ctx: &PipelineContext,
    result_name: &str,
    build_ids: &BTreeMap<String, BuildId>,
) -> Result<BuildId> {
    let result = ctx
        .loaded
        .results
        .get(result_name)
        .with_context(|| format!("unknown result: {result_name}"))?;

    let source_set = ctx.mode.source_set();
    let mut source_ids = Vec::with_capacity(result.sources.len());
    for source_name in &result.sources {
        let source = ctx
            .loaded
            .sources
            .get(source_name)
            .with_context(|| format!("unknown source: {source_name}"))?;
        let dest = ctx.source_working_copy(source_name);
        ensure_source_ready(ctx, source, &source_set, &dest)?;
        let source_id = source
            .source_id(&source_set, &dest, ctx)
            .with_context(|| format!("failed to compute SourceID for {source_name}"))?;
        source_ids.push(source_id);
    }

    let groups = ctx.loaded.chroot_groups.resolve(&result.chroot_groups)?;
    let mut group_hasher = drydock_hash::Hasher::new();
    for group in &groups {
        let group_id = group
            .chroot_group_id(|name| ctx.loaded.licences.id_of(name))
            .with_context(|| format!("failed to compute ChrootGroupID for {}", group.name))?;
        group_hasher.hash_line(&group_id.to_hex());
    }
    let chroot_group_id = group_hasher.finish();

    let merged_env = ctx.loaded.env.resolve_for_result(&Environment::new(), &result.env);
    let env_id = merged_env.env_id();

    let proj_id = ctx
        .loaded
        .project
        .proj_id(&ctx.loaded.root.join("proj/init"), TOOL_MAJOR_VERSION)
        .context("failed to compute ProjID")?;

    let result_id = result.result_id();

    let mut depend_ids = Vec::with_capacity(result.depends.len());
    for dep in &result.depends {
        let dep_id = build_ids
            .get(dep)
            .with_context(|| format!("BuildID for dependency {dep} was not computed before {result_name}"))?;
        depend_ids.push(dep_id.clone());
    }

    let inputs = BuildIdInputs {
        proj_id,
        result_id,
        env_id: env_id.digest(),
        chroot_group_id,
        source_ids: &source_ids,
        depend_ids: &depend_ids,
    };

    Ok(build_id(&ctx.mode, &inputs, &ctx.scratch_ids))
}

/// Make sure a source's working copy exists and is up to date before its
/// SourceID or its `prepare` step is ever consulted.
fn ensure_source_ready(
    ctx: &PipelineContext,
    source: &dyn drydock_source::Source,
    source_set: &drydock_source::SourceSet,
    dest: &std::path::Path,
) -> Result<()> {
    source.validate().with_context(|| format!("source {} failed validation", source.name()))?;
    if source.working_copy_available(dest) {
        source
            .check_working_copy(dest)
            .with_context(|| format!("working copy for {} is inconsistent", source.name()))?;
        source
            .update(source_set, dest, ctx)
            .with_context(|| format!("failed to update working copy for {}", source.name()))?;
    } else {
        source
            .fetch(source_set, dest, ctx)
            .with_context(|| format!("failed to fetch source {}", source.name()))?;
    }
    Ok(())
}

/// Run every named step for one result in order, unconditionally tearing
/// the chroot lifetime back down on every path out (the always-cleanup
/// wrapper every step is run through) except the playground's deliberate
/// lock-retention exception.
fn run_one_result(
    ctx: &PipelineContext,
    state: &mut RunState,
    log: &mut EventLog,
    reporter: &mut dyn Reporter,
) -> Result<StepOutcome> {
    log.record(PipelineEvent {
        timestamp: Utc::now(),
        result: state.result.clone(),
        kind: EventKind::BuildStarted {
            build_id: state.build_id.to_string(),
        },
    });

    let outcome = run_steps(ctx, state, log, reporter);

    let final_outcome = match &outcome {
        Ok(o) => *o,
        Err(_) => StepOutcome::Error,
    };
    log.record(PipelineEvent {
        timestamp: Utc::now(),
        result: state.result.clone(),
        kind: EventKind::BuildFinished { outcome: final_outcome },
    });

    outcome
}

fn run_step(
    name: &str,
    state: &RunState,
    log: &mut EventLog,
    reporter: &mut dyn Reporter,
    outcome: Result<StepOutcome>,
) -> Result<StepOutcome> {
    log.record(PipelineEvent {
        timestamp: Utc::now(),
        result: state.result.clone(),
        kind: EventKind::StepStarted { step: name.to_string() },
    });
    let (recorded, message) = match &outcome {
        Ok(o) => (*o, None),
        Err(e) => (StepOutcome::Error, Some(e.to_string())),
    };
    if let Some(msg) = &message {
        reporter.error(&format!("{} / {name}: {msg}", state.result));
    }
    log.record(PipelineEvent {
        timestamp: Utc::now(),
        result: state.result.clone(),
        kind: EventKind::StepFinished {
            step: name.to_string(),
            outcome: recorded,
            message,
        },
    });
    outcome
}

fn run_steps(ctx: &PipelineContext, state: &mut RunState, log: &mut EventLog, reporter: &mut dyn Reporter) -> Result<StepOutcome> {
    if ctx.is_shutdown_requested() {
        bail!(drydock_error::DrydockError::user_abort("shutdown requested before build started"));
    }

    run_step("build_config", state, log, reporter, steps::build_config(state))?;

    if run_step("result_available", state, log, reporter, steps::result_available(ctx, state))? == StepOutcome::Skip {
        reporter.info(&format!("{}: already built as {}, skipping", state.result, state.build_id));
        return Ok(StepOutcome::Skip);
    }

    if ctx.options.dry_run {
        reporter.info(&format!("{}: dry run, build needed as {}", state.result, state.build_id));
        return Ok(StepOutcome::Ok);
    }

    run_step("chroot_lock", state, log, reporter, {
        let r = steps::chroot_lock(state);
        r
    })?;

    let result = run_locked_steps(ctx, state, log, reporter);

    let keep_lock = state.is_playground && matches!(result, Ok(StepOutcome::Skip));
    if keep_lock {
        reporter.info(&format!("{}: playground ready, chroot left locked and populated", state.result));
        if let Some(lock) = state.lock.take() {
            std::mem::forget(lock);
        }
    } else {
        run_step("chroot_cleanup", state, log, reporter, steps::chroot_cleanup(ctx, state)).ok();
        run_step("chroot_unlock", state, log, reporter, steps::chroot_unlock(state)).ok();
    }

    result
}

/// Steps 4 through 13: everything that runs while the chroot lock is held,
/// aside from the lock's own acquire/release at the boundary.
fn run_locked_steps(ctx: &PipelineContext, state: &mut RunState, log: &mut EventLog, reporter: &mut dyn Reporter) -> Result<StepOutcome> {
    run_step(
        "chroot_cleanup_if_exists",
        state,
        log,
        reporter,
        steps::chroot_cleanup_if_exists(ctx, state),
    )?;
    run_step("setup_chroot", state, log, reporter, steps::setup_chroot(ctx, state))?;
    run_step("sources", state, log, reporter, steps::sources(ctx, state))?;

    let collect_project_enabled = ctx
        .loaded
        .results
        .get(&state.result)
        .map(|r| r.collect_project)
        .unwrap_or(false);
    run_step(
        "collect_project",
        state,
        log,
        reporter,
        steps::collect_project(ctx, state, collect_project_enabled),
    )?;
    run_step("fix_permissions", state, log, reporter, steps::fix_permissions(ctx, state))?;

    if run_step("playground", state, log, reporter, steps::playground(state))? == StepOutcome::Skip {
        return Ok(StepOutcome::Skip);
    }

    run_step("runbuild", state, log, reporter, steps::runbuild(ctx, state))?;
    run_step("store_result", state, log, reporter, steps::store_result(ctx, state))?;

    let deploy_result = {
        let reporter_ref = &mut *reporter;
        steps::deploy(ctx, state, |m| reporter_ref.warn(m))
    };
    run_step("deploy", state, log, reporter, deploy_result)?;

    run_step("linklast", state, log, reporter, steps::linklast(ctx, state))?;

    Ok(StepOutcome::Ok)
}

/// Compute every result's BuildID in topological order without invoking the
/// privileged helper or the build script, for `--buildid`. Mirrors the ID-computation
/// prefix of [`run`] exactly, so a BuildID printed here is the same one
/// `run` would build under.
pub fn build_ids_only(ctx: &PipelineContext, selected: &[String]) -> Result<BTreeMap<String, BuildId>> {
    let order = ctx.loaded.results.topo_sort().context("project has a cyclic result graph")?;
    let _ = closure_with_depends(ctx, selected)?;

    let mut build_ids: BTreeMap<String, BuildId> = BTreeMap::new();
    for name in &order {
        let id = compute_build_id(ctx, name, &build_ids)
            .with_context(|| format!("failed to compute BuildID for result {name}"))?;
        build_ids.insert(name.clone(), id);
    }
    Ok(build_ids)
}

/// Run the full pipeline for `selected` (plus the transitive closure of
/// their dependencies), returning each attempted result's final outcome.
/// BuildIDs are computed for every result in the project (the ID algebra
/// chains through `depends` regardless of what is actually built), but only
/// the closure is driven through the fifteen steps.
pub fn run(ctx: &PipelineContext, selected: &[String], reporter: &mut dyn Reporter) -> Result<BTreeMap<String, StepOutcome>> {
    let order = ctx.loaded.results.topo_sort().context("project has a cyclic result graph")?;
    let to_build = closure_with_depends(ctx, selected)?;

    let mut build_ids: BTreeMap<String, BuildId> = BTreeMap::new();
    for name in &order {
        let id = compute_build_id(ctx, name, &build_ids)
            .with_context(|| format!("failed to compute BuildID for result {name}"))?;
        build_ids.insert(name.clone(), id);
    }

    let log_dir = ctx.tmp_root.join("log");
    crate::context::ensure_dir(&log_dir)?;
    let mut log = EventLog::new();

    let mut outcomes = BTreeMap::new();
    for name in &order {
        if !to_build.contains(name) {
            continue;
        }
        if ctx.is_shutdown_requested() {
            reporter.warn(&format!("shutdown requested, skipping remaining results starting at {name}"));
            break;
        }

        let result_def = ctx
            .loaded
            .results
            .get(name)
            .with_context(|| format!("unknown result: {name}"))?;
        let build_id = build_ids.get(name).expect("computed above").clone();
        let config = BuildConfig::new(
            &ctx.tmp_root,
            &ctx.loaded.project.name,
            &ctx.loaded.project.release_id,
            name,
            build_id.as_str(),
            ctx.loaded.project.chroot_arch,
            host_arch(),
        );
        let is_playground = ctx.options.playground_results.contains(name);

        reporter.info(&format!("{name}: building as {build_id}"));
        let mut state = RunState::new(name.clone(), build_id, config, is_playground);
        state.depend_build_ids = result_def
            .depends
            .iter()
            .map(|dep| (dep.clone(), build_ids.get(dep).expect("dependency built first").clone()))
            .collect();

        let outcome = run_one_result(ctx, &mut state, &mut log, reporter);
        match outcome {
            Ok(o) => {
                outcomes.insert(name.clone(), o);
            }
            Err(e) => {
                reporter.error(&format!("{name}: {e:#}"));
                outcomes.insert(name.clone(), StepOutcome::Error);
                log.write_to_file(&log_dir.join("debug.log")).ok();
                return Err(e).with_context(|| format!("build of {name} failed"));
            }
        }
    }

    log.write_to_file(&log_dir.join("debug.log"))
        .context("failed to write log/debug.log")?;

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    #[test]
    fn null_reporter_accepts_every_severity() {
        let mut reporter = NullReporter;
        reporter.info("a");
        reporter.warn("b");
        reporter.error("c");
    }

    #[test]
    fn tool_major_version_is_nonzero() {
        assert!(TOOL_MAJOR_VERSION > 0);
        let _: Map<String, BuildId> = Map::new();
    }
}
