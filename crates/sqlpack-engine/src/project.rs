//! Configured entry point
//!
//! A `Project` owns the workspace, module sources and optional resolution
//! cache described by a `Config`, and turns a module directory into a
//! merged plan ready for the deployment engine.

use crate::cache::{fingerprint, CachedPlan, ResolutionCache};
use crate::compiler::{compile, CompileError, CompileOptions};
use crate::deploy::DeployOptions;
use crate::install::Installer;
use crate::resolver::{ResolutionError, Resolver};
use sqlpack_core::Config;
use sqlpack_plan::{LayoutError, Module};
use sqlpack_source::{SourceSet, Workspace};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

pub struct Project {
    config: Config,
    workspace: Workspace,
    sources: SourceSet,
    cache: Option<ResolutionCache>,
}

impl Project {
    pub fn new(config: Config) -> Self {
        let workspace = Workspace::new(config.modules_dir());
        let sources = SourceSet::from_config(&config.sources, &config.project_root);
        let cache = config.deploy.cache.then(ResolutionCache::default);
        Self {
            config,
            workspace,
            sources,
            cache,
        }
    }

    /// Replace the configured sources
    pub fn with_sources(mut self, sources: SourceSet) -> Self {
        self.sources = sources;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn sources(&self) -> &SourceSet {
        &self.sources
    }

    pub fn cache(&self) -> Option<&ResolutionCache> {
        self.cache.as_ref()
    }

    /// Compile options implied by `[deploy] use_plan`
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            include_dependency_changes: self.config.deploy.use_plan,
            include_tags_only: false,
        }
    }

    pub fn deploy_options(&self) -> DeployOptions {
        DeployOptions::from(&self.config.deploy)
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.workspace, &self.sources)
    }

    pub fn installer(&self) -> Installer<'_> {
        Installer::new(&self.workspace, &self.sources)
    }

    /// Load, resolve and compile the module in `module_dir`
    ///
    /// The module's `[resolved]` versions are preferred during resolution.
    pub fn plan(&self, module_dir: &Path, options: CompileOptions) -> Result<Arc<CachedPlan>, ProjectError> {
        let key = match &self.cache {
            Some(_) => fingerprint(module_dir)
                .ok()
                .map(|fp| ResolutionCache::cache_key(module_dir, &fp, options)),
            None => None,
        };

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key) {
                tracing::debug!(dir = %module_dir.display(), "using cached plan");
                return Ok(hit);
            }
        }

        let module = Module::load(module_dir)?;
        let resolution = self
            .resolver()
            .with_pins(module.manifest.resolved.clone())
            .resolve_module(&module)?;
        let plan = compile(resolution.modules(), options)?;
        let value = CachedPlan { resolution, plan };

        Ok(match (&self.cache, key) {
            (Some(cache), Some(key)) => cache.insert(key, value),
            _ => Arc::new(value),
        })
    }
}
