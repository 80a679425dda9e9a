//! Operator-supplied canary weights and their distribution across servers.

use crate::{routing::Frontend, routing::RoutingState, Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};
use tokio::sync::watch;

/// Requested traffic per version of a service. Versions that are not listed get no traffic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Weight {
    pub id: String,
    #[serde(default)]
    pub versions: BTreeMap<String, u32>,
}

/// A weight assignment for a single server, in the shape the reload sidecar accepts.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerWeight {
    pub backend: String,
    pub server: String,
    pub weight: u32,
}

/// Spreads each version's requested total evenly over that version's servers.
///
/// The remainder of the integer division goes entirely to the first server of each version, so
/// the weights of a version always add up to its requested total.
pub fn calc_weights(frontend: &Frontend, weight: &Weight) -> Vec<ServerWeight> {
    let mut counts = HashMap::<&str, u32>::new();
    for server in &frontend.servers {
        *counts.entry(server.version.as_str()).or_default() += 1;
    }

    let mut remainder_taken = HashMap::<&str, bool>::new();
    let mut assigned = Vec::with_capacity(frontend.servers.len());
    for server in &frontend.servers {
        let version = server.version.as_str();
        let total = weight.versions.get(version).copied().unwrap_or_default();
        let count = counts[version];
        let (quotient, remainder) = (total / count, total % count);

        let taken = remainder_taken.entry(version).or_default();
        let weight = if *taken {
            quotient
        } else {
            *taken = true;
            quotient + remainder
        };

        assigned.push(ServerWeight {
            backend: frontend.name.clone(),
            server: server.name.clone(),
            weight,
        });
    }

    tracing::trace!(frontend = %frontend.name, ?assigned, "calculated server weights");
    assigned
}

/// Maps every server of `frontends` to its weight. Servers start at their canary default; a
/// [`Weight`] record replaces the defaults of the frontend `routing` holds for its service.
pub fn weight_map(
    frontends: &[Frontend],
    routing: &RoutingState,
    weights: &[Weight],
) -> BTreeMap<String, u32> {
    let mut map = frontends
        .iter()
        .flat_map(|fe| &fe.servers)
        .map(|server| (server.name.clone(), server.weight))
        .collect::<BTreeMap<_, _>>();

    for weight in weights {
        match routing.get(&weight.id) {
            Some(frontend) => map.extend(
                calc_weights(frontend, weight)
                    .into_iter()
                    .map(|sw| (sw.server, sw.weight)),
            ),
            None => tracing::trace!(id = %weight.id, "no frontend for weight record"),
        }
    }

    map
}

/// Decodes a JSON array of weight records, skipping records that do not decode.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<Weight>> {
    let records = serde_json::from_slice::<Vec<serde_json::Value>>(bytes)?;
    let weights = records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<Weight>(record) {
            Ok(weight) => Some(weight),
            Err(error) => {
                tracing::warn!(%error, "skipping invalid weight record");
                None
            }
        })
        .collect();
    Ok(weights)
}

/// Makes `store` hold exactly `desired`, touching only the records that differ. Returns the
/// number of records written or deleted.
pub async fn replace_all(store: &dyn WeightStore, desired: Vec<Weight>) -> Result<usize> {
    let mut stale = store
        .all()
        .await?
        .into_iter()
        .map(|w| (w.id.clone(), w))
        .collect::<BTreeMap<_, _>>();

    let mut changed = 0;
    for weight in desired {
        if stale.remove(&weight.id).as_ref() == Some(&weight) {
            continue;
        }
        store.upsert(weight).await?;
        changed += 1;
    }
    for id in stale.into_keys() {
        store.delete(&id).await?;
        changed += 1;
    }
    Ok(changed)
}

/// Persistent storage for [`Weight`] records.
#[async_trait::async_trait]
pub trait WeightStore: Send + Sync {
    async fn all(&self) -> Result<Vec<Weight>>;

    /// Creates or replaces the record with the same id.
    async fn upsert(&self, weight: Weight) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Returns a receiver that observes a change after every successful mutation.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// A [`WeightStore`] held in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    weights: RwLock<BTreeMap<String, Weight>>,
    changes: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MemoryStore {
    pub fn new(weights: impl IntoIterator<Item = Weight>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            weights: RwLock::new(weights.into_iter().map(|w| (w.id.clone(), w)).collect()),
            changes,
        }
    }

    /// Seeds a store from a JSON array of weight records. Records that do not decode are skipped.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(parse_records(bytes)?))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_json(&bytes)
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}

#[async_trait::async_trait]
impl WeightStore for MemoryStore {
    async fn all(&self) -> Result<Vec<Weight>> {
        Ok(self.weights.read().values().cloned().collect())
    }

    async fn upsert(&self, weight: Weight) -> Result<()> {
        tracing::debug!(id = %weight.id, versions = ?weight.versions, "storing weight");
        self.weights.write().insert(weight.id.clone(), weight);
        self.notify();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if self.weights.write().remove(id).is_none() {
            return Err(Error::NotFound(id.to_string()));
        }
        self.notify();
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
