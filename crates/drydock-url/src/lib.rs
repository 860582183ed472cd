//! Servers: named upstreams a [`crate::File`](../drydock_file) (or the
//! cache/transport layer) fetches from or pushes to.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Per-server capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFlags {
    pub cache: bool,
    pub writeback: bool,
    pub push_permissions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub url: String,
    pub flags: ServerFlags,
}

impl Server {
    pub fn new(name: impl Into<String>, url: impl Into<String>, flags: ServerFlags) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            flags,
        }
    }

    /// A server is local when its URL uses the `file://` scheme. File
    /// objects served from a local server are exempt from the
    /// checksum-required invariant (spec: non-local servers must carry a
    /// checksum).
    pub fn is_local(&self) -> bool {
        self.url.starts_with("file://") || !self.url.contains("://")
    }
}

/// A frozen, name-sorted registry of servers, built once at load time.
///
/// Duplicate server names are rejected at load time rather than silently
/// overwriting an earlier definition.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    by_name: BTreeMap<String, Server>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, server: Server) -> Result<()> {
        if self.by_name.contains_key(&server.name) {
            bail!("duplicate server name: {}", server.name);
        }
        self.by_name.insert(server.name.clone(), server);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Server> {
        self.by_name.get(name)
    }

    /// Sorted, frozen view of all registered server names.
    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
