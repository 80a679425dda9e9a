//! Folds raw Marathon records into canonical [`Service`]s.
//!
//! Several Marathon apps may describe the same logical service, one per deployed version. They
//! are grouped by logical path; the lexicographically smallest version tag among them becomes
//! the service's current version and its endpoint declaration wins.

use crate::{
    marathon::{self, HealthCheck, Snapshot},
    Error, Result,
};
use serde::Serialize;
use std::collections::{btree_map, BTreeMap};

/// Overrides the Marathon id as the logical service path.
pub const APP_ID_ENV: &str = "SRY_APP_ID";

/// Version tag of a deployed app.
pub const VERSION_ENV: &str = "SRY_APP_VSN";

/// Endpoint declaration, `type:protocol:uri:bind[,...]`.
pub const ENDPOINTS_ENV: &str = "BB_DM_ENDPOINTS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub protocol: String,
    pub bind_port: u16,
}

/// A logical service merged from every Marathon app that maps to the same path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Service {
    pub path: String,
    pub frontend_name: String,
    pub endpoints: Vec<Endpoint>,
    pub health_checks: Vec<HealthCheck>,
    pub health_check_path: String,
    pub current_version: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub tasks: Vec<Task>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Task {
    pub host: String,
    pub port: u16,
    pub ports: Vec<u16>,
    pub version: String,
    pub weight: u32,
}

/// Builds the canonical service list, ordered by path.
pub fn reconcile(snapshot: &Snapshot) -> Result<Vec<Service>> {
    let mut services = BTreeMap::<String, Service>::new();

    for app in snapshot.apps.values() {
        let path = logical_path(app);
        tracing::trace!(app = %app.id, service = %path, "merging app");

        let service = match services.entry(path) {
            btree_map::Entry::Vacant(entry) => {
                let service = Service::from_app(entry.key(), app)?;
                entry.insert(service)
            }
            btree_map::Entry::Occupied(entry) => {
                let service = entry.into_mut();
                service.merge(app)?;
                service
            }
        };

        let version = version_tag(app);
        service.tasks.extend(
            snapshot
                .tasks_for(&app.id)
                .iter()
                .filter(|t| !t.ports.is_empty())
                .map(|t| Task {
                    host: t.host.clone(),
                    port: t.ports[0],
                    ports: t.ports.clone(),
                    version: version.to_string(),
                    weight: 1,
                }),
        );
    }

    Ok(services.into_values().collect())
}

/// Routes all traffic to each service's current version: weight 1 for its tasks, 0 otherwise.
pub fn apply_canary_defaults(services: &mut [Service]) {
    for service in services {
        for task in &mut service.tasks {
            task.weight = u32::from(task.version == service.current_version);
        }
    }
}

/// Parses an endpoint declaration such as `pub:http:nil:9800,pub:tcp:nil:9801`.
///
/// Entries with fewer than four fields are skipped. A bind port that is not a number fails the
/// whole declaration.
pub fn parse_endpoints(declaration: &str) -> Result<Vec<Endpoint>> {
    let mut endpoints = Vec::new();
    for entry in declaration.split(',') {
        let fields = entry.split(':').collect::<Vec<_>>();
        if fields.len() < 4 {
            tracing::debug!(%entry, "skipping malformed endpoint declaration");
            continue;
        }
        let bind_port = fields[3].parse().map_err(|_| Error::InvalidBindPort {
            entry: entry.to_string(),
            port: fields[3].to_string(),
        })?;
        endpoints.push(Endpoint {
            protocol: fields[1].to_string(),
            bind_port,
        });
    }
    Ok(endpoints)
}

impl Service {
    fn from_app(path: &str, app: &marathon::App) -> Result<Self> {
        let endpoints = match app.env.get(ENDPOINTS_ENV) {
            Some(decl) => parse_endpoints(decl)?,
            None => Vec::new(),
        };

        Ok(Self {
            path: path.to_string(),
            frontend_name: path.replace('/', "::"),
            endpoints,
            health_checks: app.health_checks.clone(),
            health_check_path: app
                .health_checks
                .iter()
                .find(|hc| hc.protocol == "HTTP")
                .map(|hc| hc.path.clone())
                .unwrap_or_default(),
            current_version: version_tag(app).to_string(),
            env: app.env.clone(),
            labels: app.labels.clone(),
            tasks: Vec::new(),
        })
    }

    fn merge(&mut self, app: &marathon::App) -> Result<()> {
        let declaration = app.env.get(ENDPOINTS_ENV);

        // Version tags compare as strings, so "10" sorts before "2".
        match app.env.get(VERSION_ENV) {
            Some(version) if *version < self.current_version => {
                tracing::debug!(
                    service = %self.path,
                    from = %self.current_version,
                    to = %version,
                    "lowering current version"
                );
                self.current_version = version.clone();
                if let Some(decl) = declaration {
                    self.endpoints = parse_endpoints(decl)?;
                }
            }
            _ if self.endpoints.is_empty() => {
                if let Some(decl) = declaration {
                    self.endpoints = parse_endpoints(decl)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn logical_path(app: &marathon::App) -> String {
    let path = app.env.get(APP_ID_ENV).unwrap_or(&app.id);
    path.strip_prefix('/').unwrap_or(path).to_string()
}

fn version_tag(app: &marathon::App) -> &str {
    app.env.get(VERSION_ENV).map(String::as_str).unwrap_or_default()
}
