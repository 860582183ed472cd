//! Build modes: tag, branch, release and working-copy builds each select a
//! source set, a BuildID derivation, and a storage layout.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use drydock_hash::{Digest, Hasher};
use drydock_source::SourceSet;
use rand::RngCore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildMode {
    Tag(String),
    Branch(String),
    Release,
    WorkingCopy,
}

impl BuildMode {
    pub fn source_set(&self) -> SourceSet {
        match self {
            BuildMode::Tag(name) => SourceSet::Tag(name.clone()),
            BuildMode::Branch(name) => SourceSet::Branch(name.clone()),
            BuildMode::Release => SourceSet::Release,
            BuildMode::WorkingCopy => SourceSet::WorkingCopy,
        }
    }

    /// Whether this mode's completed build is deployed (copied into the
    /// release storage layout and linked as `out/<result>/last`).
    pub fn deploys(&self) -> bool {
        matches!(self, BuildMode::Release)
    }

    /// Storage path fragment for a completed build of `result`, under
    /// `release_id` where relevant.
    pub fn storage_path(&self, release_id: &str, result: &str) -> String {
        match self {
            BuildMode::Release => format!("release/{release_id}/{result}"),
            _ => format!("shared/{result}"),
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Tag(name) => write!(f, "tag:{name}"),
            BuildMode::Branch(name) => write!(f, "branch:{name}"),
            BuildMode::Release => write!(f, "release"),
            BuildMode::WorkingCopy => write!(f, "working-copy"),
        }
    }
}

/// The inputs that feed a BuildID, for every build mode.
pub struct BuildIdInputs<'a> {
    pub proj_id: Digest,
    pub result_id: Digest,
    pub env_id: Digest,
    pub chroot_group_id: Digest,
    pub source_ids: &'a [Digest],
    /// BuildIDs of this result's own `depends`, in declared order
    /// = buildid_fn(hash(ProjID) +
    /// hash(ResultID(r)) + for each depend: BuildID(depend))`).
    pub depend_ids: &'a [BuildId],
}

/// A BuildID, either a plain content-addressed digest (tag/branch/release
/// builds) or a `scratch-`-prefixed working-copy id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildId(String);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BuildId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_scratch(&self) -> bool {
        self.0.starts_with("scratch-")
    }
}

fn base_digest(mode: &BuildMode, inputs: &BuildIdInputs<'_>) -> Digest {
    let mut hasher = Hasher::new();
    hasher.hash_line(&mode.to_string());
    hasher.hash_line(&inputs.proj_id.to_hex());
    hasher.hash_line(&inputs.result_id.to_hex());
    hasher.hash_line(&inputs.env_id.to_hex());
    hasher.hash_line(&inputs.chroot_group_id.to_hex());
    for id in inputs.source_ids {
        hasher.hash_line(&id.to_hex());
    }
    for id in inputs.depend_ids {
        hasher.hash_line(id.as_str());
    }
    hasher.finish()
}

/// Caches the scratch BuildID derived for a given base BuildID within this
/// process's lifetime: the first working-copy build of a given base input
/// set gets a fresh random id; every subsequent request for the *same*
/// inputs in the same process returns the same scratch id, but a new
/// process invocation generates a new one.
#[derive(Default)]
pub struct WorkingCopyBuildIds {
    cache: Mutex<BTreeMap<String, String>>,
}

impl WorkingCopyBuildIds {
    pub fn new() -> Self {
        Self::default()
    }

    fn scratch_id_for(&self, base: &Digest) -> String {
        let key = base.to_hex();
        let mut cache = self.cache.lock().expect("working-copy buildid cache poisoned");
        if let Some(existing) = cache.get(&key) {
            return existing.clone();
        }
        let mut entropy = [0u8; 16];
        rand::rng().fill_bytes(&mut entropy);
        let mut hasher = Hasher::new();
        hasher.hash_line(&key);
        hasher.hash_bytes(&entropy);
        let id = format!("scratch-{}", hasher.finish().to_hex());
        cache.insert(key, id.clone());
        id
    }
}

/// Compute a [`BuildId`] for `mode` from `inputs`. For working-copy builds,
/// `scratch_ids` supplies the per-process memoisation cache.
pub fn build_id(
    mode: &BuildMode,
    inputs: &BuildIdInputs<'_>,
    scratch_ids: &WorkingCopyBuildIds,
) -> BuildId {
    let base = base_digest(mode, inputs);
    match mode {
        BuildMode::WorkingCopy => BuildId(scratch_ids.scratch_id_for(&base)),
        _ => BuildId(base.to_hex()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(source_ids: &[Digest]) -> BuildIdInputs<'_> {
        BuildIdInputs {
            proj_id: drydock_hash::hash_bytes(b"proj"),
            result_id: drydock_hash::hash_bytes(b"result"),
            env_id: drydock_hash::hash_bytes(b"env"),
            chroot_group_id: drydock_hash::hash_bytes(b"chroot"),
            source_ids,
            depend_ids: &[],
        }
    }

    fn inputs_with_depends<'a>(source_ids: &'a [Digest], depend_ids: &'a [BuildId]) -> BuildIdInputs<'a> {
        BuildIdInputs {
            depend_ids,
            ..inputs(source_ids)
        }
    }

    #[test]
    fn non_scratch_build_id_is_stable_for_identical_inputs() {
        let cache = WorkingCopyBuildIds::new();
        let sources = [drydock_hash::hash_bytes(b"src")];
        let a = build_id(&BuildMode::Release, &inputs(&sources), &cache);
        let b = build_id(&BuildMode::Release, &inputs(&sources), &cache);
        assert_eq!(a, b);
        assert!(!a.is_scratch());
    }

    #[test]
    fn build_id_changes_when_any_input_changes() {
        let cache = WorkingCopyBuildIds::new();
        let sources_a = [drydock_hash::hash_bytes(b"src-a")];
        let sources_b = [drydock_hash::hash_bytes(b"src-b")];
        let a = build_id(&BuildMode::Release, &inputs(&sources_a), &cache);
        let b = build_id(&BuildMode::Release, &inputs(&sources_b), &cache);
        assert_ne!(a, b);
    }

    #[test]
    fn working_copy_build_id_is_scratch_prefixed() {
        let cache = WorkingCopyBuildIds::new();
        let sources = [drydock_hash::hash_bytes(b"src")];
        let id = build_id(&BuildMode::WorkingCopy, &inputs(&sources), &cache);
        assert!(id.is_scratch());
        assert!(id.as_str().starts_with("scratch-"));
    }

    #[test]
    fn working_copy_build_id_is_stable_within_one_cache_for_same_base() {
        let cache = WorkingCopyBuildIds::new();
        let sources = [drydock_hash::hash_bytes(b"src")];
        let a = build_id(&BuildMode::WorkingCopy, &inputs(&sources), &cache);
        let b = build_id(&BuildMode::WorkingCopy, &inputs(&sources), &cache);
        assert_eq!(a, b, "same process, same base inputs must reuse the cached scratch id");
    }

    #[test]
    fn working_copy_build_id_differs_across_fresh_caches() {
        let sources = [drydock_hash::hash_bytes(b"src")];
        let a = build_id(&BuildMode::WorkingCopy, &inputs(&sources), &WorkingCopyBuildIds::new());
        let b = build_id(&BuildMode::WorkingCopy, &inputs(&sources), &WorkingCopyBuildIds::new());
        assert_ne!(a, b, "a fresh invocation must not reuse another process's scratch id");
    }

    #[test]
    fn build_id_changes_when_a_dependency_build_id_changes() {
        let cache = WorkingCopyBuildIds::new();
        let sources = [drydock_hash::hash_bytes(b"src")];
        let dep_a = [BuildId("dep-a".to_string())];
        let dep_b = [BuildId("dep-b".to_string())];
        let a = build_id(&BuildMode::Release, &inputs_with_depends(&sources, &dep_a), &cache);
        let b = build_id(&BuildMode::Release, &inputs_with_depends(&sources, &dep_b), &cache);
        assert_ne!(a, b, "a dependency's own BuildID must feed its dependents' BuildID");
    }

    #[test]
    fn release_mode_deploys_other_modes_do_not() {
        assert!(BuildMode::Release.deploys());
        assert!(!BuildMode::Branch("main".into()).deploys());
        assert!(!BuildMode::Tag("v1".into()).deploys());
        assert!(!BuildMode::WorkingCopy.deploys());
    }

    #[test]
    fn storage_path_uses_release_layout_only_for_release_mode() {
        assert_eq!(
            BuildMode::Release.storage_path("r1", "foo"),
            "release/r1/foo"
        );
        assert_eq!(BuildMode::Branch("main".into()).storage_path("r1", "foo"), "shared/foo");
    }
}
