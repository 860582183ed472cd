use std::collections::BTreeMap;

use anyhow::{Result, bail};

use crate::Source;

/// Constructs a [`Source`] of one particular type from its config table.
/// Config parsing itself lives in `drydock-project`; this factory takes
/// already-resolved name/url-style arguments so that `drydock-source` does
/// not need to depend on the config crate.
pub trait SourceFactory: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn build(&self, name: &str, args: &BTreeMap<String, String>) -> Result<Box<dyn Source>>;
}

/// Type name → factory map, plus the constructed, frozen set of sources for
/// a project, built once at load time.
#[derive(Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, Box<dyn SourceFactory>>,
    sources: BTreeMap<String, Box<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the two built-in source types already registered.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_factory(Box::new(FilesFactory));
        reg.register_factory(Box::new(GitFactory));
        reg
    }

    pub fn register_factory(&mut self, factory: Box<dyn SourceFactory>) {
        self.factories.insert(factory.type_name().to_string(), factory);
    }

    /// Register an already-constructed source directly, bypassing the
    /// string-args `SourceFactory` path. Config callers (`drydock-project`)
    /// use this for source types whose config carries richer data than a
    /// flat string map can express, such as `files`' resolved `File` list.
    pub fn insert(&mut self, name: impl Into<String>, source: Box<dyn Source>) -> Result<()> {
        let name = name.into();
        if self.sources.contains_key(&name) {
            bail!("duplicate source name: {name}");
        }
        source.validate()?;
        self.sources.insert(name, source);
        Ok(())
    }

    pub fn load(
        &mut self,
        type_name: &str,
        name: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.sources.contains_key(name) {
            bail!("duplicate source name: {name}");
        }
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| anyhow::anyhow!("unknown source type: {type_name}"))?;
        let source = factory.build(name, args)?;
        source.validate()?;
        self.sources.insert(name.to_string(), source);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Source> {
        self.sources.get(name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }
}

struct FilesFactory;

impl SourceFactory for FilesFactory {
    fn type_name(&self) -> &'static str {
        "files"
    }

    fn build(&self, name: &str, _args: &BTreeMap<String, String>) -> Result<Box<dyn Source>> {
        Ok(Box::new(crate::FilesSource::new(name, Vec::new())))
    }
}

struct GitFactory;

impl SourceFactory for GitFactory {
    fn type_name(&self) -> &'static str {
        "git"
    }

    fn build(&self, name: &str, args: &BTreeMap<String, String>) -> Result<Box<dyn Source>> {
        let url = args
            .get("url")
            .ok_or_else(|| anyhow::anyhow!("git source {name} is missing required key 'url'"))?;
        Ok(Box::new(crate::GitSource::new(name, url.clone())))
    }
}
