use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;

use drydock::pipeline::{self, PipelineContext, PipelineOptions, Reporter, StepOutcome};
use drydock::policy::BuildMode;
use drydock::project;

/// Load a project and build one or more results through drydock's fifteen
/// step pipeline.
#[derive(Parser, Debug)]
#[command(name = "drydock", version, about = "Hermetic, reproducible build engine for embedded product pipelines")]
struct Cli {
    /// Project root directory (containing proj/, src/, res/).
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Build every result in the project's `default_results` list.
    #[arg(long)]
    all: bool,

    /// Build from a named tag.
    #[arg(long, value_name = "TAG", conflicts_with_all = ["branch", "working_copy", "release"])]
    tag: Option<String>,

    /// Build from a named branch.
    #[arg(long, value_name = "BRANCH", conflicts_with_all = ["tag", "working_copy", "release"])]
    branch: Option<String>,

    /// Build from each source's local working copy.
    #[arg(long, conflicts_with_all = ["tag", "branch", "release"])]
    working_copy: bool,

    /// Build and deploy a release (requires deploy_results to be set for
    /// the results being built). Mutually exclusive with `--playground`
    /// and `--all`.
    #[arg(long, conflicts_with_all = ["tag", "branch", "working_copy", "playground", "all"])]
    release: bool,

    /// How a branch source set resolves ambiguous refs. Accepted but not
    /// otherwise interpreted outside branch mode — see DESIGN.md.
    #[arg(long, value_name = "MODE")]
    branch_mode: Option<String>,

    /// How a working-copy source set treats local modifications. Accepted
    /// but not otherwise interpreted outside working-copy mode — see
    /// DESIGN.md.
    #[arg(long, value_name = "MODE")]
    wc_mode: Option<String>,

    /// Rebuild even if a matching BuildID is already available.
    #[arg(long)]
    force_rebuild: bool,

    /// Enter the chroot interactively after the build tree is populated,
    /// instead of running the build script. Requires exactly one result.
    #[arg(long)]
    playground: bool,

    /// Do not tear down the chroot after the build finishes.
    #[arg(long)]
    keep: bool,

    /// Report availability only; never invoke the privileged helper or the
    /// build script.
    #[arg(long, conflicts_with = "check_remote")]
    check: bool,

    /// Like `--check`, but also consult the configured results server.
    #[arg(long)]
    check_remote: bool,

    /// Directory for temporary build state (chroots, locks, hashcache).
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Directory the finished `out/<result>/last` links are written under.
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Directory the local content-addressed result store lives in.
    #[arg(long, default_value = ".drydock/store")]
    store_dir: PathBuf,

    /// Path to the privileged helper binary.
    #[arg(long)]
    helper: Option<PathBuf>,

    /// Print each selected result's BuildID and exit without building.
    /// Combined with `--check-remote`, still consults the results server
    /// rather than short-circuiting before the remote check.
    #[arg(long)]
    buildid: bool,

    /// Print each selected result's chroot lock state, last locally stored
    /// BuildID (from `out/<result>/last`) and the hashcache's current entry
    /// count, then exit without building or touching any of them.
    #[arg(long, conflicts_with_all = ["buildid", "playground"])]
    status: bool,

    /// Result names to build, in group.name notation (e.g. `toolchain.gcc`).
    /// Required unless `--all` is given.
    results: Vec<String>,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, message: &str) {
        eprintln!("[info] {message}");
    }

    fn warn(&mut self, message: &str) {
        eprintln!("[warn] {message}");
    }

    fn error(&mut self, message: &str) {
        eprintln!("[error] {message}");
    }
}

fn build_mode(cli: &Cli) -> Result<BuildMode> {
    if let Some(tag) = &cli.tag {
        Ok(BuildMode::Tag(tag.clone()))
    } else if let Some(branch) = &cli.branch {
        Ok(BuildMode::Branch(branch.clone()))
    } else if cli.release {
        Ok(BuildMode::Release)
    } else {
        Ok(BuildMode::WorkingCopy)
    }
}

fn selected_results(cli: &Cli, loaded: &project::LoadedProject) -> Result<Vec<String>> {
    if cli.playground {
        if cli.results.len() != 1 {
            bail!("--playground requires exactly one result name");
        }
        return Ok(cli.results.clone());
    }

    if cli.all {
        if !cli.results.is_empty() {
            bail!("--all cannot be combined with explicit result names");
        }
        return Ok(loaded.project.default_results.clone());
    }

    if cli.results.is_empty() {
        bail!("no results selected: pass result names, or --all");
    }
    Ok(cli.results.clone())
}

/// `--buildid`: print each selected result's BuildID and exit without
/// building. Per REDESIGN FLAG (d), when `--check-remote`
/// is also given, still probe the results server so the operator can tell
/// whether that BuildID is already available without starting a build.
fn print_build_ids(ctx: &PipelineContext, selected: &[String], check_remote: bool) -> Result<bool> {
    pipeline::ensure_dir(&ctx.tmp_root)?;
    let build_ids = pipeline::build_ids_only(ctx, selected)?;

    for name in selected {
        let build_id = build_ids.get(name).with_context(|| format!("unknown result: {name}"))?;
        let mut line = format!("{name}: {build_id}");

        if check_remote {
            let available = ctx.store.is_available(name, build_id.as_str())
                || ctx
                    .transport_for(pipeline::RESULTS_SERVER_NAME)
                    .ok()
                    .map(|transport| {
                        let location = format!(
                            "{}/{}/result.tar",
                            ctx.mode.storage_path(&ctx.loaded.project.release_id, name),
                            build_id
                        );
                        let probe = ctx.tmp_root.join(format!("buildid-probe-{name}"));
                        let fetched = transport.fetch_file(&location, &probe).is_ok();
                        let _ = std::fs::remove_file(&probe);
                        fetched
                    })
                    .unwrap_or(false);
            line.push_str(if available { " (available remotely)" } else { " (not available remotely)" });
        }

        println!("{line}");
    }

    Ok(true)
}

/// `--status`: a read-only report of each selected result's chroot lock
/// state and last locally stored BuildID, plus the hashcache's current
/// entry count. Never acquires the lock, never touches the chroot, never
/// invokes the privileged helper.
fn print_status(ctx: &PipelineContext, selected: &[String], out_dir: &std::path::Path) -> Result<bool> {
    for name in selected {
        let base = ctx.tmp_root.join(&ctx.loaded.project.name).join(name);
        let lock_state = if drydock::lock::LockFile::is_locked(&base)? { "locked" } else { "unlocked" };

        let last_link = out_dir.join(name).join("last");
        let last = match std::fs::read_link(&last_link) {
            Ok(target) => target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| target.display().to_string()),
            Err(_) => "none".to_string(),
        };

        println!("{name}: chroot {lock_state}, last built {last}");
    }
    println!("hashcache entries: {}", ctx.hash_cache().len());
    Ok(true)
}

fn run() -> Result<bool> {
    let cli = Cli::parse();

    if cli.playground && cli.results.len() != 1 {
        bail!("--playground requires exactly one result name");
    }
    if cli.release && (cli.playground || cli.all) {
        bail!("--release cannot be combined with --playground or --all");
    }

    let loaded = project::load_project(&cli.root).with_context(|| format!("failed to load project at {}", cli.root.display()))?;

    let selected = selected_results(&cli, &loaded)?;
    let mode = build_mode(&cli)?;

    let tmp_root = cli.tmp_dir.clone().unwrap_or_else(pipeline::default_tmp_root);
    let helper_binary = cli.helper.clone().unwrap_or_else(pipeline::default_helper_binary);

    let mut playground_results = BTreeSet::new();
    if cli.playground {
        playground_results.extend(cli.results.iter().cloned());
    }

    // A release build always performs the full availability check, whether
    // or not the operator passed `--check` / `--check-remote` explicitly.
    let check_remote = cli.check_remote || cli.release;
    let dry_run = cli.check || cli.check_remote;

    let options = PipelineOptions {
        force_rebuild: cli.force_rebuild,
        keep_chroot: cli.keep || cli.playground,
        playground_results,
        dry_run,
        check_remote,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)).context("failed to install Ctrl-C handler")?;
    }

    let ctx = PipelineContext::new(loaded, mode, tmp_root, cli.out_dir.clone(), cli.store_dir.clone(), helper_binary, options, shutdown)
        .context("failed to initialize pipeline context")?;

    if cli.status {
        return print_status(&ctx, &selected, &cli.out_dir);
    }

    if cli.buildid {
        return print_build_ids(&ctx, &selected, cli.check_remote);
    }

    let mut reporter = CliReporter;
    let outcomes = pipeline::run(&ctx, &selected, &mut reporter)?;

    let mut all_ok = true;
    for name in &selected {
        let outcome = outcomes.get(name).copied().unwrap_or(StepOutcome::Error);
        println!("{name}: {outcome:?}");
        if matches!(outcome, StepOutcome::Error | StepOutcome::Stop) {
            all_ok = false;
        }
    }

    Ok(all_ok)
}

fn main() -> Result<()> {
    match run() {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}
