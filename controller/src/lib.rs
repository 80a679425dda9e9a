//! Keeps an HAProxy configuration in sync with the applications running on Marathon, splitting
//! traffic between application versions according to operator-supplied canary weights.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
pub mod events;
pub mod marathon;
pub mod pipeline;
pub mod reconcile;
pub mod reload;
pub mod render;
pub mod routing;
pub mod scheduler;
pub mod weights;

pub use self::{
    error::{Error, Result},
    pipeline::{Health, Pipeline, PipelineConfig},
    scheduler::{Scheduler, Trigger, Update},
    weights::{MemoryStore, Weight, WeightStore},
};
