use std::fmt;

use crate::api::bybit::api::ApiResponseError;
use crate::config::ConfigError;
use crate::model::Severity;
use crate::position::PositionError;
use crate::store::StoreError;

/// Failure of a single queued command. Recorded on the command, never
/// propagated past it.
#[derive(Debug)]
pub enum CommandError {
    /// Age of the command in seconds when it was picked up.
    Expired(i64),
    /// Requested action conflicts with the open position.
    Guard(String),
    ThresholdNotMet(String),
    InvalidCommand(String),
    MissingPercent,
    OrderTimeout,
    /// Sum of the take-profit position fractions.
    InvalidLadder(f64),
    Config(String),
    Unconfirmed(String),
    Exchange(ApiResponseError),
    Position(PositionError),
}

impl CommandError {
    pub fn severity(&self) -> Severity {
        match self {
            CommandError::Expired(_)
            | CommandError::Guard(_)
            | CommandError::ThresholdNotMet(_)
            | CommandError::InvalidCommand(_)
            | CommandError::MissingPercent
            | CommandError::OrderTimeout => Severity::Warn,
            CommandError::InvalidLadder(_)
            | CommandError::Config(_)
            | CommandError::Unconfirmed(_)
            | CommandError::Exchange(_)
            | CommandError::Position(_) => Severity::High,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Expired(age) => {
                write!(f, "max message age expired for command ({}s)", age)
            }
            CommandError::Guard(msg) => write!(f, "{}", msg),
            CommandError::ThresholdNotMet(msg) => write!(f, "{}", msg),
            CommandError::InvalidCommand(command) => write!(f, "invalid command {}", command),
            CommandError::MissingPercent => write!(f, "missing or malformed percent parameter"),
            CommandError::OrderTimeout => write!(f, "max_order_time expired."),
            CommandError::InvalidLadder(sum) => write!(
                f,
                "sum of take profit percents should be 100. (got {})",
                sum
            ),
            CommandError::Config(msg) => write!(f, "configuration error: {}", msg),
            CommandError::Unconfirmed(what) => {
                write!(f, "{} was not confirmed by the exchange", what)
            }
            CommandError::Exchange(e) => write!(f, "{}", e),
            CommandError::Position(e) => write!(f, "{}", e),
        }
    }
}

impl From<ApiResponseError> for CommandError {
    fn from(e: ApiResponseError) -> Self {
        CommandError::Exchange(e)
    }
}

impl From<PositionError> for CommandError {
    fn from(e: PositionError) -> Self {
        match e {
            PositionError::Exchange(e) => CommandError::Exchange(e),
            other => CommandError::Position(other),
        }
    }
}

/// Fatal condition that ends a worker invocation before any command is
/// touched.
#[derive(Debug)]
pub enum WorkerError {
    NoCredentials(String),
    NoPendingCommands(String),
    Config(ConfigError),
    Store(StoreError),
    Client(ApiResponseError),
}

impl WorkerError {
    /// Process exit code of the worker binary.
    pub fn exit_code(&self) -> u8 {
        255
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::NoCredentials(bot_id) => {
                write!(f, "no credentials found for bot {}", bot_id)
            }
            WorkerError::NoPendingCommands(bot_id) => {
                write!(f, "no pending commands for bot {}", bot_id)
            }
            WorkerError::Config(e) => write!(f, "{}", e),
            WorkerError::Store(e) => write!(f, "{}", e),
            WorkerError::Client(e) => write!(f, "failed to build exchange client: {}", e),
        }
    }
}

impl From<ConfigError> for WorkerError {
    fn from(e: ConfigError) -> Self {
        WorkerError::Config(e)
    }
}

impl From<StoreError> for WorkerError {
    fn from(e: StoreError) -> Self {
        WorkerError::Store(e)
    }
}

impl From<ApiResponseError> for WorkerError {
    fn from(e: ApiResponseError) -> Self {
        WorkerError::Client(e)
    }
}
