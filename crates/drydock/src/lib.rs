//! # Drydock
//!
//! A hermetic, reproducible build engine for embedded product pipelines.
//!
//! Drydock loads a project description (results, sources, chroot groups,
//! licences, servers), computes a content-addressed `BuildID` for every
//! result from its full transitive input set, and runs each selected
//! result through a fixed fifteen-step build pipeline inside a
//! privileged-helper-managed chroot sandbox. Two builds with identical
//! inputs — the same sources, chroot groups, environment and
//! dependencies — always get the same `BuildID` and, outside
//! working-copy mode, byte-identical output.
//!
//! ## Pipeline
//!
//! The core flow is **load → identify → build**:
//!
//! 1. [`project::load_project`] reads a project's `proj/`, `src/<name>/`
//!    and `res/<name>/` directories into a [`project::LoadedProject`].
//! 2. [`pipeline::run`] computes every result's `BuildID` in topological
//!    order (the ID algebra chains a result's inputs through its
//!    `depends`), then drives the selected results (plus the transitive
//!    closure of their dependencies) through the fifteen named steps:
//!    `build_config`, `result_available`, `chroot_lock`,
//!    `chroot_cleanup_if_exists`, `setup_chroot`, `sources`,
//!    `collect_project`, `fix_permissions`, `playground`, `runbuild`,
//!    `store_result`, `deploy`, `linklast`, `chroot_cleanup`,
//!    `chroot_unlock`.
//! 3. [`store::ResultStore`] and [`cache::Transport`] persist and fetch
//!    completed builds; [`events::EventLog`] records every step's
//!    outcome to `log/debug.log`.
//!
//! ## Modules
//!
//! - [`project`] — project/source/result/server/licence loading and the
//!   `LoadedProject` object graph
//! - [`pipeline`] — the fifteen-step build pipeline and its driver
//! - [`policy`] — build modes (`tag`/`branch`/`release`/`working-copy`)
//!   and the `BuildID` derivation
//! - [`result`] — result definitions and the dependency graph
//! - [`source`] — pluggable sources (`files`, `git`) and the source
//!   registry
//! - [`chroot`] — chroot groups and their content-addressed identity
//! - [`licence`] — licences and licence-bearing files
//! - [`cache`] — transports (`file://`, `rsync://`, `ssh+scp://`,
//!   `http(s)://`) for fetching and pushing cached artifacts
//! - [`store`] — the local, content-addressed result store and its
//!   schema-versioned receipts
//! - [`helper`] — the privileged-helper protocol (`set_permissions`,
//!   `extract_tar`, `chroot`, `remove_chroot`)
//! - [`lock`] — the per-build filesystem lock
//! - [`events`] — the append-only JSONL event log
//! - [`error`] — the typed error taxonomy and message-stack rendering
//! - [`environment`] — deterministic, order-independent environment
//!   merging and `EnvID`
//! - [`file`] — content-addressed files (`FileID`, checksum
//!   verification)
//! - [`hash`] — the streaming SHA-256 hasher every ID in the algebra is
//!   built from

pub use drydock_cache as cache;
pub use drydock_chroot as chroot;
pub use drydock_environment as environment;
pub use drydock_error as error;
pub use drydock_events as events;
pub use drydock_file as file;
pub use drydock_hash as hash;
pub use drydock_helper as helper;
pub use drydock_licence as licence;
pub use drydock_lock as lock;
pub use drydock_pipeline as pipeline;
pub use drydock_policy as policy;
pub use drydock_project as project;
pub use drydock_result as result;
pub use drydock_source as source;
pub use drydock_store as store;
pub use drydock_url as url;
