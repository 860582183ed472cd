//! Sources: the polymorphic abstraction over where a result's inputs come
//! from. Built-in implementations cover plain file lists (`files`) and git
//! checkouts (`git`); new SCM-backed sources plug in through
//! [`SourceFactory`] without the pipeline needing to know their concrete
//! type.

mod files;
mod git;
mod registry;

pub use files::FilesSource;
pub use git::GitSource;
pub use registry::{SourceFactory, SourceRegistry};

use anyhow::Result;
use std::path::Path;

pub use drydock_hash::Digest;

pub type SourceId = Digest;

/// Which variant of a source's content a build is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSet {
    Branch(String),
    Tag(String),
    Release,
    WorkingCopy,
}

/// Whatever a source needs to fetch an individual file and check it against
/// its configured or computed checksum. Implemented by the pipeline's run
/// context; factored out here so `drydock-source` does not need to depend
/// on `drydock-pipeline` to reach a server's transport or the shared
/// checksum cache.
pub trait FileFetchContext {
    /// Fetch `file` into `dest` and verify every checksum it declares.
    fn fetch_and_verify(&self, file: &drydock_file::File, dest: &Path) -> Result<()>;

    /// Resolve the digest `file`'s FileID should fold in: its declared
    /// checksum, or one computed by fetching and hashing into `dest`.
    fn resolve_content_checksum(&self, file: &drydock_file::File, dest: &Path) -> Result<String>;

    /// Resolve a licence name to its LicenceID.
    fn licence_id_of(&self, name: &str) -> Option<Digest>;
}

/// A pluggable source of build input.
///
/// `toresult` turns this source into the minimal information a
/// [`drydock_result`](../drydock_result)-style object needs to depend on it
/// (a name plus its resolved `SourceId`), without `drydock-source` having to
/// depend on the result crate.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Check the source's own configuration for internal consistency
    /// (e.g. a git source naming both a branch and a tag).
    fn validate(&self) -> Result<()>;

    /// Fetch fresh content for `source_set` into a new working copy at
    /// `dest`.
    fn fetch(&self, source_set: &SourceSet, dest: &Path, fetch_ctx: &dyn FileFetchContext) -> Result<()>;

    /// Update an existing working copy at `dest` in place.
    fn update(&self, source_set: &SourceSet, dest: &Path, fetch_ctx: &dyn FileFetchContext) -> Result<()>;

    /// Materialize `source_set`'s content into `dest`, fetching or updating
    /// as needed.
    fn prepare(&self, source_set: &SourceSet, dest: &Path, fetch_ctx: &dyn FileFetchContext) -> Result<()>;

    /// Human-readable one-line description, for logs and error messages.
    fn display(&self) -> String;

    /// Compute this source's content-addressed `SourceId` for a given
    /// `source_set`. `dest` is the prepared working copy, for sources (like
    /// git) whose ID depends on resolved content rather than configuration
    /// alone.
    fn source_id(&self, source_set: &SourceSet, dest: &Path, fetch_ctx: &dyn FileFetchContext) -> Result<SourceId>;

    fn to_result(
        &self,
        source_set: &SourceSet,
        dest: &Path,
        fetch_ctx: &dyn FileFetchContext,
    ) -> Result<(String, SourceId)> {
        Ok((self.name().to_string(), self.source_id(source_set, dest, fetch_ctx)?))
    }

    /// Whether a working copy is present and usable for this source.
    fn working_copy_available(&self, dest: &Path) -> bool;

    /// Validate an existing working copy's branch/remote/URL match what
    /// this source expects.
    fn check_working_copy(&self, dest: &Path) -> Result<()>;
}
