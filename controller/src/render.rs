//! Renders proxy configuration and shell commands from minijinja templates.

use crate::{reconcile::Service, routing::Frontend, Result};
use minijinja::{context, Environment, UndefinedBehavior, Value};
use serde::Serialize;
use std::{collections::BTreeMap, num::NonZeroUsize, path::Path};

/// Upper bound on the process count exposed to templates.
pub const MAX_NBPROC: usize = 64;

/// The data a configuration template is executed against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Model {
    /// Frontends ordered by bind port.
    pub frontends: Vec<Frontend>,
    /// Server name to weight.
    pub weights: BTreeMap<String, u32>,
    /// Canonical services keyed by path.
    pub services: BTreeMap<String, Service>,
    pub nbproc: usize,
}

impl Model {
    pub fn new(
        frontends: Vec<Frontend>,
        weights: BTreeMap<String, u32>,
        services: Vec<Service>,
    ) -> Self {
        Self {
            frontends,
            weights,
            services: services.into_iter().map(|s| (s.path.clone(), s)).collect(),
            nbproc: nbproc(),
        }
    }
}

/// The number of available CPUs, clamped to [`MAX_NBPROC`].
pub fn nbproc() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .min(MAX_NBPROC)
}

pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_function("has_weight", has_weight);
        env.add_function("contains", contains);
        env.add_filter("split", split);
        Self { env }
    }

    /// Renders `template`. Syntax errors and references to undefined values are returned as
    /// errors.
    pub fn render<S: Serialize>(&self, name: &str, template: &str, model: S) -> Result<String> {
        Ok(self.env.render_named_str(name, template, model)?)
    }

    /// Renders a validation, reload or cleanup command with `path` bound to the candidate
    /// configuration file.
    pub fn render_command(&self, command: &str, path: &Path) -> Result<String> {
        self.render(
            "command",
            command,
            context! { path => path.display().to_string() },
        )
    }
}

fn has_weight(weights: &Value, server: &str) -> bool {
    weights
        .get_attr(server)
        .map(|v| !v.is_undefined() && !v.is_none())
        .unwrap_or(false)
}

fn contains(haystack: &str, needle: &str) -> bool {
    haystack.contains(needle)
}

fn split(value: &str, sep: &str) -> Vec<String> {
    value.split(sep).map(str::to_string).collect()
}
