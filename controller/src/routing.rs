//! The routing model: proxy frontends and their weighted server pools, built from reconciled
//! services.

use crate::reconcile::Service;
use serde::Serialize;
use std::collections::BTreeMap;

/// A proxy bind point serving one endpoint of a service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Frontend {
    pub name: String,
    pub protocol: String,
    pub bind_port: u16,
    pub servers: Vec<Server>,
}

/// A backend instance within a frontend's pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Server {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

/// The most recently built frontend for each service path.
///
/// When a service declares several endpoints only the last one built is retained, so weight
/// updates driven from this state address that endpoint's servers alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingState {
    frontends: BTreeMap<String, Frontend>,
}

impl RoutingState {
    pub fn get(&self, service: &str) -> Option<&Frontend> {
        self.frontends.get(service)
    }

    pub fn is_empty(&self) -> bool {
        self.frontends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frontends.len()
    }
}

/// Builds one frontend per service endpoint, ordered by bind port, and replaces `state` with
/// the frontends built for each service.
///
/// Only tasks that have bound a port for every declared endpoint are used as servers.
pub fn build_frontends(services: &[Service], state: &mut RoutingState) -> Vec<Frontend> {
    let mut frontends = Vec::new();
    let mut latest = BTreeMap::new();

    for service in services {
        let endpoint_count = service.endpoints.len();
        for (idx, endpoint) in service.endpoints.iter().enumerate() {
            let mut servers = service
                .tasks
                .iter()
                .filter(|task| task.ports.len() == endpoint_count)
                .map(|task| Server {
                    name: format!(
                        "{}-{}-{}-{}",
                        service.frontend_name, task.host, task.version, task.ports[idx]
                    ),
                    version: task.version.clone(),
                    host: task.host.clone(),
                    port: task.ports[idx],
                    weight: task.weight,
                })
                .collect::<Vec<_>>();
            servers.sort_by(|a, b| a.version.cmp(&b.version));

            let frontend = Frontend {
                name: format!(
                    "{}-{}-{}",
                    service.frontend_name, endpoint.protocol, endpoint.bind_port
                ),
                protocol: endpoint.protocol.clone(),
                bind_port: endpoint.bind_port,
                servers,
            };
            tracing::trace!(
                service = %service.path,
                frontend = %frontend.name,
                servers = frontend.servers.len(),
                "built frontend"
            );

            latest.insert(service.path.clone(), frontend.clone());
            frontends.push(frontend);
        }
    }

    frontends.sort_by_key(|fe| fe.bind_port);
    state.frontends = latest;
    frontends
}
