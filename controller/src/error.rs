/// Errors produced while reconciling, rendering and reloading the proxy configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The orchestrator, store or reload sidecar could not be reached
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// A remote API answered with a non-success status
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// A response or stored record was not valid JSON for its type
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    /// The configuration template failed to compile or execute
    #[error("template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// An endpoint declaration carried a bind port that is not a number
    #[error("invalid bind port {port:?} in endpoint declaration {entry:?}")]
    InvalidBindPort { entry: String, port: String },

    /// No orchestrator endpoint was configured
    #[error("no orchestrator endpoints configured")]
    NoEndpoints,

    #[error("weight {0:?} not found")]
    NotFound(String),

    /// Event subscription was refused by the orchestrator
    #[error("event subscription rejected: {0}")]
    Subscription(String),

    /// A validation or reload command exited unsuccessfully
    #[error("command `{command}` exited with {status}")]
    Command { command: String, status: i32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
