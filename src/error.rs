use thiserror::Error;

/// Crate-wide result type.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    // =========
    // Config / startup
    // =========
    #[error("Configuration file IO error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse JSON config: {0}")]
    ConfigJson(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // =========
    // Upstream ClickHouse
    // =========
    #[error("HTTP transport error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Every configured server is marked bad, or none are configured.
    #[error("No working clickhouse servers")]
    NoServers,

    /// Upstream rejected the query (4xx below 502). Not retryable.
    #[error("Server rejected query: status={status}, body={body}")]
    ServerReject { status: u16, body: String },

    // =========
    // Ingress
    // =========
    #[error("Empty insert")]
    EmptyInsert,

    // =========
    // Dump store
    // =========
    #[error("No dumps")]
    NoDumps,

    #[error("Dump write error: {0}")]
    DumpWrite(#[source] std::io::Error),

    #[error("Dump read error: {0}")]
    DumpRead(#[source] std::io::Error),

    #[error("Dump delete error: {0}")]
    DumpDelete(#[source] std::io::Error),

    // =========
    // Metrics / Prometheus
    // =========
    #[error("Prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    // =========
    // Runtime
    // =========
    #[error("Failed to spawn task: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status a terminal send failure maps to when no upstream
    /// response is available.
    pub fn send_status(&self) -> u16 {
        match self {
            AppError::ServerReject { status, .. } => *status,
            AppError::NoServers => 503,
            _ => 502,
        }
    }
}
