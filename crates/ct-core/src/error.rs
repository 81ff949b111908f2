use crate::model::{AddressFamily, Chain, ChainKey, Table};
use crate::store::Position;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Malformed or contradictory rule input. Never reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown table '{0}' (expected filter or nat)")]
    UnknownTable(String),

    #[error("table '{0}' is reserved and not supported")]
    UnsupportedTable(String),

    #[error("unknown chain '{0}'")]
    UnknownChain(String),

    #[error("chain {chain} does not exist in table {table}")]
    ChainNotInTable { table: Table, chain: Chain },

    #[error("unknown protocol '{0}' (expected tcp, udp, icmp or all)")]
    UnknownProtocol(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("invalid {field} address '{value}': {reason}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid {field} '{value}': ports must be between 1 and 65535")]
    InvalidPort { field: &'static str, value: String },

    #[error("{field} requires protocol tcp or udp")]
    PortWithoutTransport { field: &'static str },

    #[error("invalid {field} interface '{value}': {reason}")]
    InvalidInterface {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("invalid comment: {0}")]
    InvalidComment(&'static str),

    #[error("{target} is only valid in the nat table, not {table}")]
    NatTargetOutsideNat { target: &'static str, table: Table },

    #[error("{target} cannot be used in chain {chain}")]
    TargetNotInChain { target: &'static str, chain: Chain },

    #[error("{0} requires a NAT address")]
    MissingNatAddress(&'static str),

    #[error("invalid NAT address '{value}': {reason}")]
    InvalidNatAddress { value: String, reason: String },

    #[error("rule carries match options that cannot be re-issued: {0}")]
    Unreproducible(String),

    #[error("{field} is {found} but the rule's other addresses are {expected}")]
    MixedFamily {
        field: &'static str,
        found: AddressFamily,
        expected: AddressFamily,
    },

    #[error("rule addresses are {rule} but {program} manages {program_family}")]
    FamilyMismatch {
        rule: AddressFamily,
        program: String,
        program_family: AddressFamily,
    },

    #[error("rule belongs to {rule_key}, not {key}")]
    ForeignChain { key: ChainKey, rule_key: ChainKey },
}

/// Unexpected listing or argument format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("listing header missing or malformed: {0}")]
    BadHeader(String),

    #[error("listing is for chain {found}, expected {expected}")]
    WrongChain { expected: Chain, found: String },

    #[error("row has {found} columns, expected at least {expected}")]
    Truncated { expected: usize, found: usize },

    #[error("row position '{found}' does not match its ordinal {expected}")]
    PositionMismatch { expected: Position, found: String },

    #[error("unrecognized target '{0}'")]
    UnknownTarget(String),

    #[error("malformed {what}: '{value}'")]
    Malformed { what: &'static str, value: String },

    #[error("unsupported {what}: '{value}'")]
    Unsupported { what: &'static str, value: String },

    #[error("unexpected flag '{0}'")]
    UnexpectedFlag(String),

    #[error("flag '{0}' is missing its value")]
    MissingValue(String),

    #[error("parsed rule is invalid: {0}")]
    Invalid(#[from] ValidationError),
}

/// Why a position could not be confirmed against the cached listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The chain has never been listed.
    NotLoaded,
    /// A mutation happened since the last listing.
    Invalidated,
    /// The reference was taken from an older listing.
    Superseded { seen: u64, current: u64 },
    /// The position lies past the end of the listing.
    OutOfRange { len: usize },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NotLoaded => write!(f, "chain has not been listed yet"),
            StaleReason::Invalidated => write!(f, "chain changed since it was last listed"),
            StaleReason::Superseded { seen, current } => {
                write!(f, "listing generation {} is older than {}", seen, current)
            }
            StaleReason::OutOfRange { len } => write!(f, "listing has only {} rules", len),
        }
    }
}

/// A position-addressed request against a listing that is no longer current.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stale position {position} in {key}: {reason}")]
pub struct StalePositionError {
    pub key: ChainKey,
    pub position: Position,
    pub reason: StaleReason,
}

/// Category of a failed backend invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// The tool ran and exited non-zero; kernel state is unchanged.
    ToolFailed,
    /// The tool did not finish in time; kernel state is unknown.
    Timeout(Duration),
    /// The tool could not be started.
    Spawn,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::ToolFailed => write!(f, "tool failed"),
            ExecutionFailure::Timeout(after) => write!(f, "timed out after {:?}", after),
            ExecutionFailure::Spawn => write!(f, "could not start tool"),
        }
    }
}

/// A failed rule-table invocation, carrying the tool's diagnostics verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{failure} (exit code {}): {stderr}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
pub struct ExecutionError {
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub failure: ExecutionFailure,
}

impl ExecutionError {
    pub fn tool_failed(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            failure: ExecutionFailure::ToolFailed,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            exit_code: None,
            stderr: String::new(),
            failure: ExecutionFailure::Timeout(after),
        }
    }

    pub fn spawn(reason: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stderr: reason.into(),
            failure: ExecutionFailure::Spawn,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, ExecutionFailure::Timeout(_))
    }

    /// Whether the kernel rule table is known to be untouched by the failed call.
    pub fn state_unchanged(&self) -> bool {
        matches!(self.failure, ExecutionFailure::ToolFailed | ExecutionFailure::Spawn)
    }
}

/// Every failure the rule engine reports to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    StalePosition(#[from] StalePositionError),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

pub type Result<T> = std::result::Result<T, Error>;
