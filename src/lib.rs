//! Signal driven derivatives trading.
//!
//! External signals are queued as commands, a scheduler hands each bot's
//! commands to a single worker at a time, and an independent controller
//! trails the stop-loss of open positions.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod model;
pub mod position;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod trailing_stop;
pub mod util;
pub mod worker;
