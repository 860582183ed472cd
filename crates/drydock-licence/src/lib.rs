//! Licences: a name plus the set of files that carry that licence's text,
//! and the registry that resolves licence names to [`LicenceId`]s for other
//! object's ID computations.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use drydock_file::File;
use serde::{Deserialize, Serialize};

pub use drydock_hash::Digest;

pub type LicenceId = Digest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Licence {
    pub name: String,
    pub files: Vec<File>,
}

impl Licence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
        }
    }

    /// Compute this licence's ID: the licence name followed by each licence
    /// text file's FileID, in order. Licence text files do not themselves
    /// reference further licences.
    pub fn licence_id(&self) -> Result<LicenceId> {
        let mut hasher = drydock_hash::Hasher::new();
        hasher.hash_line(&self.name);
        for file in &self.files {
            if !file.licences.is_empty() {
                bail!(
                    "licence-text file {}/{} must not itself reference a licence",
                    file.server,
                    file.location
                );
            }
            let id = file.file_id(|_| None, None)?;
            hasher.hash_line(&id.to_hex());
        }
        Ok(hasher.finish())
    }
}

/// A frozen, name-sorted registry of licences, built once at load time.
#[derive(Debug, Clone, Default)]
pub struct LicenceRegistry {
    by_name: BTreeMap<String, Licence>,
}

impl LicenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, licence: Licence) -> Result<()> {
        if self.by_name.contains_key(&licence.name) {
            bail!("duplicate licence name: {}", licence.name);
        }
        self.by_name.insert(licence.name.clone(), licence);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Licence> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }

    /// Resolver suitable for [`drydock_file::File::file_id`] and other
    /// consumers that need a licence's ID by name.
    pub fn id_of(&self, name: &str) -> Option<LicenceId> {
        self.by_name.get(name).and_then(|l| l.licence_id().ok())
    }

    /// Resolve every name in `names`, failing on the first unknown one.
    pub fn require_all(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.by_name
                .get(name)
                .with_context(|| format!("unknown licence: {name}"))?;
        }
        Ok(())
    }
}
