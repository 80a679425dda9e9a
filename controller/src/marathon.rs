//! Client for the Marathon orchestrator's HTTP API.
//!
//! The controller reads two listings from Marathon, `/v2/apps` and `/v2/tasks`, and merges them
//! into a [`Snapshot`]. Several Marathon endpoints may be configured; they are tried in order and
//! the first one that answers both listings wins.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

const SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(15);

/// An application definition as returned by `GET /v2/apps`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct App {
    #[serde(deserialize_with = "null_default")]
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub health_checks: Vec<HealthCheck>,
    #[serde(deserialize_with = "null_default")]
    pub ports: Vec<u16>,
    #[serde(deserialize_with = "string_values")]
    pub env: BTreeMap<String, String>,
    #[serde(deserialize_with = "string_values")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(deserialize_with = "null_default")]
    pub path: String,
    #[serde(deserialize_with = "null_default")]
    pub protocol: String,
    #[serde(deserialize_with = "null_default")]
    pub port_index: usize,
}

/// A running task as returned by `GET /v2/tasks`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Task {
    #[serde(deserialize_with = "null_default")]
    pub app_id: String,
    #[serde(deserialize_with = "null_default")]
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub host: String,
    #[serde(deserialize_with = "null_default")]
    pub ports: Vec<u16>,
    #[serde(deserialize_with = "null_default")]
    pub service_ports: Vec<u16>,
    pub started_at: Option<String>,
    pub staged_at: Option<String>,
    #[serde(deserialize_with = "null_default")]
    pub version: String,
}

/// The raw orchestrator state fetched from a single endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Applications keyed by their Marathon id.
    pub apps: BTreeMap<String, App>,
    /// Tasks grouped by owning application id, each group ordered by task id.
    pub tasks: HashMap<String, Vec<Task>>,
}

impl Snapshot {
    pub fn new(apps: Vec<App>, mut tasks: Vec<Task>) -> Self {
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        let mut by_app = HashMap::<String, Vec<Task>>::new();
        for task in tasks {
            by_app.entry(task.app_id.clone()).or_default().push(task);
        }

        Self {
            apps: apps.into_iter().map(|app| (app.id.clone(), app)).collect(),
            tasks: by_app,
        }
    }

    pub fn tasks_for(&self, app_id: &str) -> &[Task] {
        self.tasks.get(app_id).map(Vec::as_slice).unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct AppList {
    #[serde(default, deserialize_with = "null_default")]
    apps: Vec<App>,
}

#[derive(Deserialize)]
struct TaskList {
    #[serde(default, deserialize_with = "null_default")]
    tasks: Vec<Task>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subscriptions {
    #[serde(default, deserialize_with = "null_default")]
    callback_urls: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    endpoints: Vec<String>,
    credentials: Option<(String, String)>,
}

impl Client {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            http: reqwest::Client::new(),
            endpoints: endpoints
                .into_iter()
                .map(|e| e.into().trim_end_matches('/').to_string())
                .collect(),
            credentials: None,
        }
    }

    /// Sends basic auth with every request. Ignored unless both values are non-empty.
    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.credentials = match (user, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        };
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Fetches the current state from the first endpoint that answers. If every endpoint fails,
    /// the last error is returned.
    pub async fn fetch(&self) -> Result<Snapshot> {
        let mut last = Error::NoEndpoints;
        for endpoint in &self.endpoints {
            match self.fetch_from(endpoint).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(error) => {
                    tracing::warn!(%endpoint, %error, "failed to fetch state from marathon");
                    last = error;
                }
            }
        }
        Err(last)
    }

    /// Fetches tasks and applications from a single endpoint.
    pub async fn fetch_from(&self, endpoint: &str) -> Result<Snapshot> {
        let TaskList { tasks } = self.get_json(endpoint, "/v2/tasks").await?;
        let AppList { apps } = self.get_json(endpoint, "/v2/apps").await?;
        tracing::debug!(%endpoint, apps = apps.len(), tasks = tasks.len(), "fetched marathon state");
        Ok(Snapshot::new(apps, tasks))
    }

    /// Registers `callback_url` for event delivery on every configured endpoint that does not
    /// already list it. Stops at the first failure.
    pub async fn ensure_subscribed(&self, callback_url: &str) -> Result<()> {
        for endpoint in &self.endpoints {
            if self.is_subscribed(endpoint, callback_url).await {
                tracing::trace!(%endpoint, "event subscription present");
                continue;
            }
            self.subscribe(endpoint, callback_url).await?;
            tracing::info!(%endpoint, %callback_url, "registered event subscription");
        }
        Ok(())
    }

    async fn is_subscribed(&self, endpoint: &str, callback_url: &str) -> bool {
        let req = self
            .request(reqwest::Method::GET, endpoint, "/v2/eventSubscriptions")
            .timeout(SUBSCRIPTION_TIMEOUT);
        let rsp = match req.send().await {
            Ok(rsp) if rsp.status().is_success() => rsp,
            Ok(rsp) => {
                tracing::debug!(%endpoint, status = %rsp.status(), "failed to list event subscriptions");
                return false;
            }
            Err(error) => {
                tracing::debug!(%endpoint, %error, "failed to list event subscriptions");
                return false;
            }
        };
        match rsp.json::<Subscriptions>().await {
            Ok(subs) => subs.callback_urls.iter().any(|u| u == callback_url),
            Err(error) => {
                tracing::debug!(%endpoint, %error, "invalid event subscription listing");
                false
            }
        }
    }

    async fn subscribe(&self, endpoint: &str, callback_url: &str) -> Result<()> {
        let body = self
            .request(reqwest::Method::POST, endpoint, "/v2/eventSubscriptions")
            .query(&[("callbackUrl", callback_url)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?
            .text()
            .await?;
        // Marathon answers refusals with an error object rather than a status code.
        if body.starts_with("{\"message") {
            return Err(Error::Subscription(body));
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, endpoint: &str, path: &str) -> Result<T> {
        let rsp = self
            .request(reqwest::Method::GET, endpoint, path)
            .send()
            .await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: format!("{endpoint}{path}"),
                status: status.as_u16(),
            });
        }
        let bytes = rsp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn request(&self, method: reqwest::Method, endpoint: &str, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .http
            .request(method, format!("{endpoint}{path}"))
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.credentials {
            Some((user, password)) => req.basic_auth(user, Some(password)),
            None => req,
        }
    }
}

/// Decodes an explicit `null` like a missing field.
fn null_default<'de, D, T>(de: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

/// Marathon allows non-string environment values (e.g. secret references); only plain strings
/// are meaningful here.
fn string_values<'de, D>(de: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(de)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            _ => None,
        })
        .collect())
}
