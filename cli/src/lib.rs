//! Operator tooling for the HAProxy canary controller: installation checks, routing status and
//! offline rendering, all computed from Marathon's live state.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod check;
pub mod status;
mod table;

use anyhow::{Context, Result};
use haproxy_canary_controller::{
    marathon, pipeline,
    render::{Model, Renderer},
    routing::RoutingState,
    MemoryStore, Weight, WeightStore,
};
use std::path::Path;

/// Reads weight records from `path`, or returns no records.
pub async fn load_weights(path: Option<&Path>) -> Result<Vec<Weight>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let store = MemoryStore::load(path)
        .await
        .with_context(|| format!("failed to load weights from {}", path.display()))?;
    Ok(store.all().await?)
}

/// Builds the template model the controller would use right now.
pub async fn model(marathon: &marathon::Client, weights: &[Weight]) -> Result<Model> {
    let snapshot = marathon
        .fetch()
        .await
        .context("failed to fetch marathon state")?;
    let model = pipeline::build_model(&snapshot, weights, &mut RoutingState::default())?;
    Ok(model)
}

pub async fn render(template_path: &Path, model: &Model) -> Result<String> {
    let template = tokio::fs::read_to_string(template_path)
        .await
        .with_context(|| format!("failed to read template {}", template_path.display()))?;
    let name = template_path.display().to_string();
    Ok(Renderer::new().render(&name, &template, model)?)
}
