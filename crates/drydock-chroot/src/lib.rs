//! Chroot groups: named bundles of files unpacked to build up a build
//! sandbox's root filesystem, plus the default groups that are always
//! appended to every requested set.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use drydock_file::{Digest, File};
use drydock_sl::StringList;
use serde::{Deserialize, Serialize};

pub type ChrootGroupId = Digest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChrootGroup {
    pub name: String,
    pub files: Vec<File>,
}

impl ChrootGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
        }
    }

    pub fn chroot_group_id(
        &self,
        licence_id_of: impl Fn(&str) -> Option<Digest>,
    ) -> Result<ChrootGroupId> {
        let mut hasher = drydock_hash::Hasher::new();
        hasher.hash_line(&self.name);
        for file in &self.files {
            let id = file.file_id(&licence_id_of, None)?;
            hasher.hash_line(&id.to_hex());
        }
        Ok(hasher.finish())
    }
}

/// A frozen, name-sorted registry of chroot groups, built once at load time,
/// with a fixed set of group names that are always included regardless of
/// what a project or result explicitly requests.
#[derive(Debug, Clone, Default)]
pub struct ChrootGroupRegistry {
    by_name: BTreeMap<String, ChrootGroup>,
    default_groups: StringList,
}

impl ChrootGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: ChrootGroup) -> Result<()> {
        if self.by_name.contains_key(&group.name) {
            bail!("duplicate chroot group name: {}", group.name);
        }
        self.by_name.insert(group.name.clone(), group);
        Ok(())
    }

    /// Register a name as one that is always appended to every requested
    /// group set, regardless of whether the caller asked for it.
    pub fn set_default_groups(&mut self, names: impl IntoIterator<Item = String>) {
        self.default_groups = StringList::from_iter_dedup_sorted(names);
    }

    pub fn get(&self, name: &str) -> Option<&ChrootGroup> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }

    /// Resolve a requested set of group names, always appending and
    /// deduplicating/sorting in the configured default groups.
    pub fn resolve(&self, requested: &[String]) -> Result<Vec<&ChrootGroup>> {
        let mut names = StringList::from_iter_dedup_sorted(requested.iter().cloned());
        names.extend_sorted(&self.default_groups);

        names
            .iter()
            .map(|name| {
                self.get(name)
                    .with_context(|| format!("unknown chroot group: {name}"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_file::FileAction;

    fn group_with_file(name: &str, location: &str) -> ChrootGroup {
        let mut g = ChrootGroup::new(name);
        let mut file = File::new("local", location, FileAction::Unpack);
        file.sha256 = Some(format!("{location}-digest"));
        g.files.push(file);
        g
    }

    #[test]
    fn chroot_group_id_depends_on_name_and_files() {
        let a = group_with_file("base", "a.tar");
        let b = group_with_file("base", "b.tar");
        assert_ne!(
            a.chroot_group_id(|_| None).unwrap(),
            b.chroot_group_id(|_| None).unwrap()
        );
    }

    #[test]
    fn registry_rejects_duplicate_group_names() {
        let mut reg = ChrootGroupRegistry::new();
        reg.insert(group_with_file("base", "a.tar")).unwrap();
        assert!(reg.insert(group_with_file("base", "b.tar")).is_err());
    }

    #[test]
    fn resolve_always_appends_default_groups_deduplicated_and_sorted() {
        let mut reg = ChrootGroupRegistry::new();
        reg.insert(group_with_file("base", "a.tar")).unwrap();
        reg.insert(group_with_file("dev", "b.tar")).unwrap();
        reg.insert(group_with_file("extra", "c.tar")).unwrap();
        reg.set_default_groups(["base".to_string(), "dev".to_string()]);

        let resolved = reg.resolve(&["extra".to_string(), "base".to_string()]).unwrap();
        let names: Vec<&str> = resolved.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["base", "dev", "extra"]);
    }

    #[test]
    fn resolve_fails_on_unknown_group() {
        let reg = ChrootGroupRegistry::new();
        assert!(reg.resolve(&["missing".to_string()]).is_err());
    }
}
