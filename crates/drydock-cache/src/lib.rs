//! The cache/transport layer: fetching and pushing files
//! to/from servers over `file://`, `rsync(+ssh)://`, `ssh+scp://` and
//! `http(s)://`, backed by a persistent per-file checksum cache.

pub mod hashcache;
pub mod transport;

pub use hashcache::{FileIdentity, HashCache};
pub use transport::{ChecksumAlgorithm, Transport, TransportKind, for_server};
