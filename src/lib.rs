// === Public Modules (The Canonical Paths) ===
pub mod config;
pub mod datasets;
pub mod envelope;
pub mod error;
pub mod fetch;
pub mod flow;
pub mod lake;
pub mod normalize;
pub mod parse;
pub mod pipeline;
pub mod report;
pub mod runtime;
pub mod validate;
pub mod warehouse;

// === Facades (Re-exporting the common surface) ===
pub use crate::config::ChampionConfig;
pub use crate::datasets::{Dataset, Exchange, Layer};
pub use crate::envelope::{SchemaVersion, Stamper};
pub use crate::error::{ChampionError, ChampionResult, ErrorKind};
pub use crate::fetch::{Fetcher, SourceDescriptor};
pub use crate::flow::{Flow, executor::FlowRunner};
pub use crate::lake::{Compression, Lake};
pub use crate::pipeline::{Pipeline, eod_flow};
pub use crate::runtime::{TaskContext, TaskOutcome, TaskSpec};
pub use crate::validate::Validator;
pub use crate::warehouse::{WarehouseClient, loader::Loader};
