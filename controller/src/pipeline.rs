//! The reconciliation cycle: fetch, merge, build, render, diff, then write and reload.

use crate::{
    marathon::{self, Snapshot},
    reconcile::{apply_canary_defaults, reconcile},
    reload::{self, Reload},
    render::{Model, Renderer},
    routing::{build_frontends, RoutingState},
    scheduler::{Cycle, Kind, Outcome, Update},
    weights::{calc_weights, weight_map, ServerWeight, Weight, WeightStore},
    Result,
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::io::AsyncWriteExt;

#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub template_path: PathBuf,
    pub output_path: PathBuf,
    /// Run against a temporary copy of each candidate configuration before it is written;
    /// `{{ path }}` expands to the copy's location.
    pub validate_command: Option<String>,
    /// Run after every write attempt.
    pub cleanup_command: Option<String>,
}

/// Tracks whether the last render succeeded.
#[derive(Clone, Debug, Default)]
pub struct Health {
    invalid: Arc<AtomicBool>,
    readiness: Option<kubert::admin::Readiness>,
}

impl Health {
    /// Mirrors the flag onto the admin server's readiness.
    pub fn with_readiness(readiness: kubert::admin::Readiness) -> Self {
        Self {
            invalid: Arc::default(),
            readiness: Some(readiness),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid.load(Ordering::Acquire)
    }

    fn set_valid(&self, valid: bool) {
        self.invalid.store(!valid, Ordering::Release);
        if let Some(readiness) = &self.readiness {
            readiness.set(valid);
        }
    }
}

/// Builds the template model for `snapshot` and `weights`, replacing `routing` with the
/// frontends built along the way.
pub fn build_model(snapshot: &Snapshot, weights: &[Weight], routing: &mut RoutingState) -> Result<Model> {
    let mut services = reconcile(snapshot)?;
    apply_canary_defaults(&mut services);
    let frontends = build_frontends(&services, routing);
    let weights = weight_map(&frontends, routing, weights);
    tracing::debug!(
        services = services.len(),
        frontends = frontends.len(),
        "built routing model"
    );
    Ok(Model::new(frontends, weights, services))
}

/// Runs reconciliation cycles on behalf of the scheduler. It owns the routing state, so only
/// the scheduler's worker ever reads or writes it.
pub struct Pipeline {
    config: PipelineConfig,
    marathon: marathon::Client,
    weights: Arc<dyn WeightStore>,
    reloader: Arc<dyn Reload>,
    renderer: Renderer,
    routing: RoutingState,
    health: Health,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        marathon: marathon::Client,
        weights: Arc<dyn WeightStore>,
        reloader: Arc<dyn Reload>,
        health: Health,
    ) -> Self {
        Self {
            config,
            marathon,
            weights,
            reloader,
            renderer: Renderer::new(),
            routing: RoutingState::default(),
            health,
        }
    }

    pub fn routing(&self) -> &RoutingState {
        &self.routing
    }

    /// Renders the configuration for the current orchestrator and weight state.
    pub async fn generate(&mut self) -> Result<String> {
        let template = tokio::fs::read_to_string(&self.config.template_path).await?;
        let snapshot = self.marathon.fetch().await?;
        let weights = self.weights.all().await?;
        let model = build_model(&snapshot, &weights, &mut self.routing)?;

        let name = self.config.template_path.display().to_string();
        match self.renderer.render(&name, &template, &model) {
            Ok(config) => {
                self.health.set_valid(true);
                Ok(config)
            }
            Err(error) => {
                tracing::error!(template = %name, %error, "failed to render configuration");
                self.health.set_valid(false);
                Err(error)
            }
        }
    }

    async fn full(&mut self) -> Result<Outcome> {
        let config = self.generate().await?;
        if !reload_required(&self.config.output_path, &config).await? {
            return Ok(Outcome::Skipped);
        }

        let res = self.write_and_reload(&config).await;
        self.cleanup().await;
        res.map(|()| Outcome::Reloaded)
    }

    async fn write_and_reload(&self, config: &str) -> Result<()> {
        if let Some(command) = &self.config.validate_command {
            self.validate(command, config).await?;
        }

        tracing::debug!(path = %self.config.output_path.display(), "writing configuration");
        write_config(&self.config.output_path, config).await?;

        // The file is not rolled back if the proxy cannot be told about it; the next successful
        // reload catches up.
        self.reloader.reload().await
    }

    async fn reweight(&mut self) -> Result<Outcome> {
        if self.routing.is_empty() {
            tracing::debug!("no routing state yet; running a full update");
            return self.full().await;
        }

        let weights = self.weights.all().await?;
        let assigned = weights
            .iter()
            .filter_map(|w| self.routing.get(&w.id).map(|fe| calc_weights(fe, w)))
            .flatten()
            .collect::<Vec<ServerWeight>>();

        match self.reloader.set_weights(&assigned).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("weights cannot be applied live; running a full update");
                return self.full().await;
            }
            // The file below still records the weights for the next proxy restart.
            Err(error) => tracing::warn!(%error, "failed to apply weights to the running proxy"),
        }

        // Persist the weights so that a restarted proxy comes up with them.
        let config = self.generate().await?;
        if reload_required(&self.config.output_path, &config).await? {
            write_config(&self.config.output_path, &config).await?;
        }
        Ok(Outcome::Reweighted)
    }

    async fn validate(&self, command: &str, config: &str) -> Result<()> {
        let candidate = tempfile::Builder::new()
            .prefix("haproxy-canary-")
            .suffix(".cfg")
            .tempfile()?;
        write_file(candidate.as_file(), config).await?;

        let command = self.renderer.render_command(command, candidate.path())?;
        tracing::debug!(%command, "validating configuration");
        reload::exec(&command).await
    }

    async fn cleanup(&self) {
        let Some(command) = &self.config.cleanup_command else {
            return;
        };
        let res = match self
            .renderer
            .render_command(command, &self.config.output_path)
        {
            Ok(command) => reload::exec(&command).await,
            Err(error) => Err(error),
        };
        if let Err(error) = res {
            tracing::warn!(%error, "cleanup failed");
        }
    }
}

#[async_trait::async_trait]
impl Cycle for Pipeline {
    async fn run(&mut self, update: Update) -> Outcome {
        let res = match update.kind {
            Kind::Full => self.full().await,
            Kind::Weights => self.reweight().await,
        };
        res.unwrap_or_else(|error| {
            tracing::warn!(%error, trigger = %update.trigger, "update failed");
            Outcome::Failed
        })
    }
}

/// Compares `config` with the file at `path`. A missing file always requires a reload.
pub async fn reload_required(path: &Path, config: &str) -> Result<bool> {
    match tokio::fs::read(path).await {
        Ok(current) => Ok(current != config.as_bytes()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(error) => Err(error.into()),
    }
}

/// Replaces the file at `path` with `config`. The content is staged in a new file beside the
/// target and renamed over it, so readers never observe a partial file.
pub async fn write_config(path: &Path, config: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let staging = tempfile::Builder::new()
        .prefix(".haproxy-canary-")
        .tempfile_in(dir)?;
    write_file(staging.as_file(), config).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staging
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    // A staging file that cannot be renamed is removed when the error drops it.
    staging.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn write_file(file: &std::fs::File, content: &str) -> Result<()> {
    let mut file = tokio::fs::File::from_std(file.try_clone()?);
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
