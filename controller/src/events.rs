//! Change notification producers: Marathon's event callbacks and the weight store.

use crate::{
    marathon,
    scheduler::{Scheduler, Trigger, Update},
    weights::{self, WeightStore},
};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::watch, time};

/// The path Marathon posts events to.
pub const CALLBACK_PATH: &str = "/api/marathon/event_callback";

#[derive(Clone, Debug)]
pub struct Intake {
    scheduler: Scheduler,
    marathon: marathon::Client,
    callback_url: Option<String>,
}

/// The envelope common to all Marathon events. Other fields are ignored.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarathonEvent {
    pub event_type: String,
    pub timestamp: String,
}

impl Intake {
    /// When `callback_url` is set, the health endpoint (re)registers it with Marathon.
    pub fn new(scheduler: Scheduler, marathon: marathon::Client, callback_url: Option<String>) -> Self {
        Self {
            scheduler,
            marathon,
            callback_url,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route(CALLBACK_PATH, post(marathon_event))
            .route("/api/health", get(health))
            .with_state(self)
    }
}

async fn marathon_event(State(intake): State<Intake>, Json(event): Json<MarathonEvent>) -> StatusCode {
    tracing::debug!(
        event_type = %event.event_type,
        timestamp = %event.timestamp,
        "received marathon event"
    );
    intake.scheduler.schedule(Update::full(Trigger::Marathon {
        event_type: event.event_type,
    }));
    StatusCode::OK
}

async fn health(State(intake): State<Intake>) -> (StatusCode, &'static str) {
    if let Some(url) = &intake.callback_url {
        if let Err(error) = intake.marathon.ensure_subscribed(url).await {
            tracing::warn!(%error, "failed to ensure marathon event subscription");
            return (StatusCode::INTERNAL_SERVER_ERROR, "healthcheck failed");
        }
    }
    (StatusCode::OK, "healthcheck success")
}

/// Schedules a weight update whenever the store reports a change.
pub async fn watch_weights(mut changes: watch::Receiver<u64>, scheduler: Scheduler) {
    while changes.changed().await.is_ok() {
        let generation = *changes.borrow_and_update();
        tracing::debug!(%generation, "weights changed");
        scheduler.schedule(Update::weights());
    }
    tracing::debug!("weight store closed");
}

/// Polls the weights file and mirrors its records into `store` whenever its content changes.
/// The store's own notifications then schedule the weight updates.
pub async fn watch_weights_file(path: PathBuf, store: Arc<dyn WeightStore>, period: Duration) {
    let mut last = None;
    let mut ticks = time::interval(period);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::debug!(path = %path.display(), %error, "failed to read weights file");
                continue;
            }
        };
        if last.as_ref() == Some(&bytes) {
            continue;
        }

        let res = match weights::parse_records(&bytes) {
            Ok(records) => weights::replace_all(&*store, records).await,
            Err(error) => Err(error),
        };
        match res {
            Ok(0) => {}
            Ok(changed) => tracing::info!(path = %path.display(), %changed, "applied weights file"),
            Err(error) => tracing::warn!(path = %path.display(), %error, "failed to apply weights file"),
        }
        last = Some(bytes);
    }
}
