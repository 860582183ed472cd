//! Shared services and run-wide options a pipeline run holds for every
//! result it builds: loaded project data, the build mode, transports to
//! every configured server, the privileged helper handle, the local result
//! store, and the cooperative shutdown flag.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use drydock_cache::{HashCache, Transport, transport};
use drydock_helper::PrivilegedHelper;
use drydock_policy::{BuildMode, WorkingCopyBuildIds};
use drydock_project::LoadedProject;
use drydock_store::ResultStore;

/// Set from a signal handler; inspected between pipeline steps. Plain `Arc<AtomicBool>` rather
/// than a channel: the driver only ever needs to poll it, never to wait on
/// it.
pub type ShutdownFlag = Arc<AtomicBool>;

/// Convention used to pick a shared results server and an optional
/// deployment server out of the project's server registry, since the
/// config surface has no distinct "storage server role" key. A project
/// that wants remote result caching or deployment names a server
/// `results` and/or `deploy`; a project with neither works entirely out of
/// the local result store.
pub const RESULTS_SERVER_NAME: &str = "results";
pub const DEPLOY_SERVER_NAME: &str = "deploy";

/// Per-invocation flags driven by the CLI.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub force_rebuild: bool,
    pub keep_chroot: bool,
    pub playground_results: BTreeSet<String>,
    /// Run every step through `result_available` only, never invoking the
    /// privileged helper or the build script.
    pub dry_run: bool,
    /// During a `dry_run`, also attempt the remote cache-server lookup
    /// `result_available` would otherwise skip (the CLI's `--check` vs.
    /// `--check-remote` distinction).
    pub check_remote: bool,
}

/// Everything a pipeline run needs that does not change per-result.
pub struct PipelineContext {
    pub loaded: LoadedProject,
    pub mode: BuildMode,
    pub tmp_root: PathBuf,
    pub sources_dir: PathBuf,
    pub out_dir: PathBuf,
    pub helper: PrivilegedHelper,
    pub scratch_ids: WorkingCopyBuildIds,
    pub store: ResultStore,
    pub options: PipelineOptions,
    pub shutdown: ShutdownFlag,
    hash_cache: RefCell<HashCache>,
    transports: RefCell<BTreeMap<String, Box<dyn Transport>>>,
}

impl PipelineContext {
    pub fn new(
        loaded: LoadedProject,
        mode: BuildMode,
        tmp_root: PathBuf,
        out_dir: PathBuf,
        store_root: PathBuf,
        helper_binary: PathBuf,
        options: PipelineOptions,
        shutdown: ShutdownFlag,
    ) -> Result<Self> {
        let hashcache_path = tmp_root.join("hashcache");
        let hash_cache = HashCache::load(&hashcache_path, mode != BuildMode::Release)
            .context("failed to load hashcache")?;
        Ok(Self {
            sources_dir: tmp_root.join("sources"),
            helper: PrivilegedHelper::new(helper_binary, tmp_root.clone()),
            store: ResultStore::new(store_root),
            loaded,
            mode,
            tmp_root,
            out_dir,
            scratch_ids: WorkingCopyBuildIds::new(),
            options,
            shutdown,
            hash_cache: RefCell::new(hash_cache),
            transports: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn hash_cache(&self) -> std::cell::RefMut<'_, HashCache> {
        self.hash_cache.borrow_mut()
    }

    /// Look up the transport for a registered server by name, constructing
    /// and caching it on first use.
    pub fn transport_for(&self, server_name: &str) -> Result<std::cell::Ref<'_, Box<dyn Transport>>> {
        if !self.transports.borrow().contains_key(server_name) {
            let server = self
                .loaded
                .servers
                .get(server_name)
                .with_context(|| format!("unknown server: {server_name}"))?
                .clone();
            let transport = transport::for_server(server)?;
            self.transports.borrow_mut().insert(server_name.to_string(), transport);
        }
        Ok(std::cell::Ref::map(self.transports.borrow(), |m| {
            m.get(server_name).expect("just inserted")
        }))
    }

    /// The persistent working-copy directory a source is fetched/updated
    /// into, shared across every result and build that references it. This
    /// is distinct from the per-build chroot directory `prepare` populates.
    pub fn source_working_copy(&self, source_name: &str) -> PathBuf {
        self.sources_dir.join(source_name)
    }
}

impl drydock_source::FileFetchContext for PipelineContext {
    fn fetch_and_verify(&self, file: &drydock_file::File, dest: &Path) -> Result<()> {
        let transport = self.transport_for(&file.server)?;
        let mut cache = self.hash_cache();
        file.checksum_verify(transport.as_ref(), &mut cache, dest, self.options.check_remote)
    }

    fn resolve_content_checksum(&self, file: &drydock_file::File, dest: &Path) -> Result<String> {
        let transport = self.transport_for(&file.server)?;
        let mut cache = self.hash_cache();
        file.resolve_content_checksum(transport.as_ref(), &mut cache, dest)
    }

    fn licence_id_of(&self, name: &str) -> Option<drydock_hash::Digest> {
        self.loaded.licences.id_of(name)
    }
}

pub fn default_helper_binary() -> PathBuf {
    std::env::var("DRYDOCK_HELPER_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("drydock-helper"))
}

pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

pub fn default_tmp_root() -> PathBuf {
    std::env::temp_dir().join("drydock")
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("failed to create directory {}", path.display()))
}
