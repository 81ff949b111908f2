//! Rule model, validation and cached chain state for cocotap.

pub mod config;
pub mod error;
pub mod journal;
pub mod model;
pub mod preset;
pub mod status;
pub mod store;
pub mod validate;

pub use config::{BackendConfig, Config, ConfigError, Elevation, LoggingConfig, MetricsConfig};
pub use error::{
    Error, ExecutionError, ExecutionFailure, ParseError, Result, StalePositionError, StaleReason,
    ValidationError,
};
pub use journal::{AppliedMutation, Compensation, Mutation, MutationJournal, UndoError};
pub use model::{
    AddressFamily, Chain, ChainKey, NatAddress, Protocol, Rule, RuleForm, RuleSpec, Table,
    Target,
};
pub use preset::{PresetError, PresetLoader, RulePreset};
pub use status::{ChainFailure, ChainStatus, FirewallStatus};
pub use store::{
    Counters, Freshness, ListedRule, Position, PositionRef, RuleEntry, RuleStore,
};
