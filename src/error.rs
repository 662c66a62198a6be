use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error;

pub type ChampionResult<T> = Result<T, ChampionError>;

#[derive(Debug, Error)]
pub enum ChampionError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lake(#[from] LakeError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Coarse classification used by the task runtime to decide retry and exit
/// behavior. Every concrete error maps onto exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Integrity,
    Schema,
    Validation,
    Io,
    Warehouse,
    Config,
    Timeout,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Io | Self::Timeout)
    }

    /// Process exit code for a run that terminated on this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config => 2,
            Self::Network | Self::Timeout => 3,
            Self::Validation => 4,
            Self::Warehouse => 5,
            Self::Cancelled => 130,
            Self::Integrity | Self::Schema | Self::Io | Self::Unknown => 1,
        }
    }
}

impl ChampionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Parse(e) => e.kind(),
            Self::Validation(e) => e.kind(),
            Self::Lake(e) => e.kind(),
            Self::Warehouse(e) => e.kind(),
            Self::Runtime(e) => e.kind(),
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Machine-readable recovery hint attached to every surfaced failure.
    pub fn recovery_hint(&self) -> RecoveryHint {
        let quarantine_file = match self {
            Self::Validation(ValidationError::CriticalRulesFailed { quarantine_file, .. }) => {
                quarantine_file.clone()
            }
            _ => None,
        };

        RecoveryHint {
            retryable: self.is_retryable(),
            quarantine_file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryHint {
    pub retryable: bool,
    pub quarantine_file: Option<String>,
}

/// Errors raised while downloading exchange bulletins.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error fetching '{url}': {msg}")]
    Network { url: String, msg: String },

    #[error("Upstream returned HTTP {status} for '{url}'")]
    Status { url: String, status: u16 },

    #[error("Corrupt or ambiguous payload from '{source_id}': {msg}")]
    Integrity { source_id: String, msg: String },

    #[error("No data published by '{source_id}' for {date}")]
    NotFound { source_id: String, date: String },

    #[error("Circuit open for host '{host}', retry after cooldown")]
    CircuitOpen { host: String },

    #[error("Fetch of '{url}' exceeded deadline")]
    DeadlineExceeded { url: String },

    #[error("Fetch of '{url}' cancelled")]
    Cancelled { url: String },

    #[error("IO error staging download: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::Status { .. } => ErrorKind::Network,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::NotFound { .. } => ErrorKind::Network,
            Self::CircuitOpen { .. } => ErrorKind::Network,
            Self::DeadlineExceeded { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Errors raised while turning raw bulletins into canonical batches.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(
        "Schema drift in '{dataset}': expected {expected:?}, found {found:?}, missing {missing:?}"
    )]
    Schema {
        dataset: String,
        expected: Vec<String>,
        found: Vec<String>,
        missing: Vec<String>,
    },

    #[error("Malformed value in '{dataset}' column '{column}': {msg}")]
    Malformed {
        dataset: String,
        column: String,
        msg: String,
    },

    #[error("Invalid timestamp in '{dataset}': {msg}")]
    Timestamp { dataset: String, msg: String },

    #[error("Data frame error: {0}")]
    DataFrame(#[from] polars::error::PolarsError),

    #[error("IO error reading source file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("Failed to parse float: {0}")]
    ParseFloat(#[from] ParseFloatError),

    #[error("Failed to parse enum: {0}")]
    ParseEnum(#[from] strum::ParseError),
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Malformed { .. } | Self::Timestamp { .. } => ErrorKind::Integrity,
            Self::DataFrame(_) => ErrorKind::Schema,
            Self::Io(_) => ErrorKind::Io,
            Self::ParseInt(_) | Self::ParseFloat(_) | Self::ParseEnum(_) => ErrorKind::Integrity,
        }
    }
}

/// Errors raised by the validation engine.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{critical} critical violations in '{schema}' ({failed_rows}/{total_rows} rows failed)")]
    CriticalRulesFailed {
        schema: String,
        critical: usize,
        failed_rows: usize,
        total_rows: usize,
        quarantine_file: Option<String>,
    },

    #[error("Unknown validation schema '{0}'")]
    UnknownSchema(String),

    #[error("Invalid rule specification '{rule}': {msg}")]
    InvalidRule { rule: String, msg: String },

    #[error("Data frame error: {0}")]
    DataFrame(#[from] polars::error::PolarsError),

    #[error("Failed to write quarantine artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize audit record: {0}")]
    Json(#[from] serde_json::Error),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CriticalRulesFailed { .. } => ErrorKind::Validation,
            Self::UnknownSchema(_) | Self::InvalidRule { .. } => ErrorKind::Config,
            Self::DataFrame(_) => ErrorKind::Unknown,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Io,
        }
    }
}

/// Errors raised by the partitioned lake writer.
#[derive(Debug, Error)]
pub enum LakeError {
    #[error("IO error under lake base: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data frame error: {0}")]
    DataFrame(#[from] polars::error::PolarsError),

    #[error("Partition column '{column}' missing from batch for dataset '{dataset}'")]
    MissingPartitionColumn { dataset: String, column: String },

    #[error("Dataset '{dataset}' is locked by pid {pid} since {since}")]
    Locked {
        dataset: String,
        pid: u32,
        since: String,
    },

    #[error("Unparseable partition directory '{0}'")]
    BadPartition(String),
}

impl LakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::DataFrame(_) => ErrorKind::Unknown,
            Self::MissingPartitionColumn { .. } => ErrorKind::Schema,
            Self::Locked { .. } => ErrorKind::Io,
            Self::BadPartition(_) => ErrorKind::Integrity,
        }
    }
}

/// Errors raised by the warehouse loader.
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("Warehouse connection failed: {0}")]
    Connection(String),

    #[error("Schema mismatch loading '{table}': {msg}")]
    SchemaMismatch { table: String, msg: String },

    #[error(
        "Load mismatch for '{table}' partition '{partition}': source has {expected} rows, warehouse has {actual}"
    )]
    LoadMismatch {
        table: String,
        partition: String,
        expected: u64,
        actual: u64,
    },

    #[error("Insert into '{table}' failed: {msg}")]
    Insert { table: String, msg: String },

    #[error("IO error in marker store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data frame error: {0}")]
    DataFrame(#[from] polars::error::PolarsError),
}

impl WarehouseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Network,
            Self::SchemaMismatch { .. } => ErrorKind::Schema,
            // Fatal by contract: a count divergence must never be retried away.
            Self::LoadMismatch { .. } => ErrorKind::Warehouse,
            Self::Insert { .. } => ErrorKind::Warehouse,
            Self::Io(_) => ErrorKind::Io,
            Self::DataFrame(_) => ErrorKind::Unknown,
        }
    }
}

/// Errors raised by the task runtime and flow orchestrator.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Task '{task}' exceeded its deadline of {timeout}")]
    DeadlineExceeded { task: String, timeout: String },

    #[error("Task '{task}' cancelled")]
    Cancelled { task: String },

    #[error("Task '{task}' exhausted {attempts} attempts: {last_error}")]
    RetriesExhausted {
        task: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Flow '{flow}' has no task named '{task}'")]
    UnknownTask { flow: String, task: String },

    #[error("Dependency cycle in flow '{flow}' involving '{task}'")]
    Cycle { flow: String, task: String },

    #[error("Checkpoint IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unclassified task failure: {0}")]
    Unknown(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeadlineExceeded { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::RetriesExhausted { .. } => ErrorKind::Unknown,
            Self::UnknownTask { .. } | Self::Cycle { .. } => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Io,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

/// Errors raised while assembling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({msg})")]
    InvalidValue {
        key: String,
        value: String,
        msg: String,
    },

    #[error("Missing required option {0}")]
    Missing(String),

    #[error("Failed to read config file '{path}': {msg}")]
    File { path: String, msg: String },

    #[error("Invalid cron expression '{expr}': {msg}")]
    Cron { expr: String, msg: String },
}
