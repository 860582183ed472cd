//! Build-environment maps.
//!
//! An [`Environment`] is a key/value map whose `EnvID` depends only on its
//! contents, never on the order keys were inserted in — two environments
//! built up through different `set` call orders that end up with the same
//! final key/value pairs are indistinguishable.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use drydock_hash::{Digest, Hasher};

/// Content-addressed identifier for an [`Environment`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(Digest);

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({})", self.0)
    }
}

impl EnvId {
    /// The underlying digest, for callers (e.g. `drydock-policy`'s BuildID
    /// computation) that need to feed it into a further hash rather than
    /// just display it.
    pub fn digest(&self) -> Digest {
        self.0
    }
}

/// An environment variable map, keyed and ordered independently of
/// insertion order.
#[derive(Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
    id_cache: OnceLock<EnvId>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment").field("vars", &self.vars).finish()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or overwrite) a single variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
        self.invalidate();
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` into `self`. When `override_existing` is `true`,
    /// `other`'s values win on key collisions (used when a result's
    /// per-build environment is layered on top of its project's defaults);
    /// when `false`, keys already present in `self` are left untouched.
    pub fn merge(&mut self, other: &Environment, override_existing: bool) {
        for (k, v) in &other.vars {
            if override_existing || !self.vars.contains_key(k) {
                self.vars.insert(k.clone(), v.clone());
            }
        }
        self.invalidate();
    }

    /// Merged copy, leaving both inputs untouched.
    pub fn merged(&self, other: &Environment, override_existing: bool) -> Environment {
        let mut out = self.clone();
        out.merge(other, override_existing);
        out
    }

    fn invalidate(&mut self) {
        self.id_cache = OnceLock::new();
    }

    /// Compute (and memoise) this environment's `EnvID`.
    pub fn env_id(&self) -> EnvId {
        *self.id_cache.get_or_init(|| {
            let mut hasher = Hasher::new();
            for (k, v) in &self.vars {
                hasher.hash_line(k);
                hasher.hash_line(v);
            }
            EnvId(hasher.finish())
        })
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut env = Environment::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_does_not_affect_env_id() {
        let mut a = Environment::new();
        a.set("A", "1");
        a.set("B", "2");

        let mut b = Environment::new();
        b.set("B", "2");
        b.set("A", "1");

        assert_eq!(a.env_id(), b.env_id());
    }

    #[test]
    fn overwriting_a_key_changes_the_id() {
        let mut a = Environment::new();
        a.set("A", "1");
        let id_before = a.env_id();
        a.set("A", "2");
        assert_ne!(id_before, a.env_id());
    }

    #[test]
    fn merge_overrides_existing_keys_when_requested() {
        let mut base = Environment::new();
        base.set("A", "1");
        base.set("B", "2");

        let mut overrides = Environment::new();
        overrides.set("B", "20");
        overrides.set("C", "3");

        base.merge(&overrides, true);
        assert_eq!(base.get("A"), Some("1"));
        assert_eq!(base.get("B"), Some("20"));
        assert_eq!(base.get("C"), Some("3"));
    }

    #[test]
    fn merge_preserves_existing_keys_without_override() {
        let mut base = Environment::new();
        base.set("A", "1");
        base.set("B", "2");

        let mut overrides = Environment::new();
        overrides.set("B", "20");
        overrides.set("C", "3");

        base.merge(&overrides, false);
        assert_eq!(base.get("A"), Some("1"));
        assert_eq!(base.get("B"), Some("2"));
        assert_eq!(base.get("C"), Some("3"));
    }

    #[test]
    fn empty_environment_is_stable() {
        assert_eq!(Environment::new().env_id(), Environment::new().env_id());
    }

    #[test]
    fn merged_leaves_inputs_untouched() {
        let mut base = Environment::new();
        base.set("A", "1");
        let mut overrides = Environment::new();
        overrides.set("A", "2");

        let merged = base.merged(&overrides, true);
        assert_eq!(base.get("A"), Some("1"));
        assert_eq!(merged.get("A"), Some("2"));
    }

    proptest::proptest! {
        #[test]
        fn env_id_depends_only_on_final_contents(
            pairs in proptest::collection::vec(("[a-z]{1,4}", "[a-z]{1,4}"), 0..8)
        ) {
            let mut forward = Environment::new();
            for (k, v) in &pairs {
                forward.set(k.clone(), v.clone());
            }
            let mut backward = Environment::new();
            for (k, v) in pairs.iter().rev() {
                backward.set(k.clone(), v.clone());
            }
            proptest::prop_assert_eq!(forward.env_id(), backward.env_id());
        }
    }
}
