use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OrderSide::Buy => write!(f, "Buy"),
            OrderSide::Sell => write!(f, "Sell"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Buy" => Ok(OrderSide::Buy),
            "Sell" => Ok(OrderSide::Sell),
            _ => Err(()),
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens (or adds to) a position in this direction.
    pub fn entry_order(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction.
    pub fn closing_order(&self) -> OrderSide {
        self.entry_order().opposite()
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Normalized view of a bot's exposure on one symbol. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionSnapshot {
    pub side: Option<Side>,
    pub quantity: f64,
    /// 0.0 when no stop is set.
    pub stop_loss: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
}

impl PositionSnapshot {
    pub fn flat(current_price: f64) -> Self {
        Self {
            current_price,
            ..Self::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.side.is_some()
    }

    /// Price move from entry in percent, sign-adjusted so that profit is positive.
    pub fn pnl_percent(&self) -> f64 {
        let Some(side) = self.side else {
            return 0.0;
        };
        if self.entry_price == 0.0 {
            return 0.0;
        }
        let pnl = (self.current_price - self.entry_price) / self.entry_price * 100.0;
        match side {
            Side::Long => pnl,
            Side::Short => -pnl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Success,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Success => "success",
            CommandStatus::Failed => "failed",
        }
    }
}

impl FromStr for CommandStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "success" => Ok(CommandStatus::Success),
            "failed" => Ok(CommandStatus::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warn => "warn",
            Severity::High => "high",
        }
    }
}

impl FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warn" => Ok(Severity::Warn),
            "high" => Ok(Severity::High),
            _ => Err(()),
        }
    }
}

/// A queued instruction as stored in the command queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: i64,
    pub bot_id: String,
    pub pair: String,
    pub command: String,
    pub percent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: CommandStatus,
    pub error_msg: Option<String>,
    pub error_severity: Option<Severity>,
}

/// A command about to be appended to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommand {
    pub bot_id: String,
    pub pair: String,
    pub command: String,
    pub percent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeProfitVariant {
    /// Close if in profit at all.
    Positive,
    /// Close if PnL% reaches the command's target.
    Target,
    /// Like `Target`, with a configurable action when the target is missed.
    TargetOrMiss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Enter(Side),
    Exit(Side),
    TakeProfit(Side, TakeProfitVariant),
}

impl FromStr for CommandKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_lowercase().as_str() {
            "enter-long" => CommandKind::Enter(Side::Long),
            "enter-short" => CommandKind::Enter(Side::Short),
            "exit-long" => CommandKind::Exit(Side::Long),
            "exit-short" => CommandKind::Exit(Side::Short),
            "take-profit-long-1" => CommandKind::TakeProfit(Side::Long, TakeProfitVariant::Positive),
            "take-profit-short-1" => CommandKind::TakeProfit(Side::Short, TakeProfitVariant::Positive),
            "take-profit-long-2" => CommandKind::TakeProfit(Side::Long, TakeProfitVariant::Target),
            "take-profit-short-2" => CommandKind::TakeProfit(Side::Short, TakeProfitVariant::Target),
            "take-profit-long-3" => CommandKind::TakeProfit(Side::Long, TakeProfitVariant::TargetOrMiss),
            "take-profit-short-3" => CommandKind::TakeProfit(Side::Short, TakeProfitVariant::TargetOrMiss),
            _ => return Err(()),
        };
        Ok(kind)
    }
}

/// Parses a `N%` percent parameter. The trailing `%` is optional.
pub fn parse_percent(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed);
    number.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// One trailing-stop rule: once PnL% exceeds `threshold`, trail the stop
/// `offset` percent from entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tier {
    pub threshold: f64,
    pub offset: f64,
}

impl Tier {
    pub fn new(threshold: f64, offset: f64) -> Self {
        Self { threshold, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl TierTable {
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Returns the last tier whose threshold is strictly below `pnl_percent`.
    pub fn select(&self, pnl_percent: f64) -> Option<Tier> {
        let mut best = None;
        for tier in &self.tiers {
            if pnl_percent > tier.threshold {
                best = Some(*tier);
            }
        }
        best
    }
}

/// Identifies one monitored (bot, pair) entry of the trailing stop controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub bot_id: String,
    pub pair: String,
}

impl EntryKey {
    pub fn new(bot_id: impl Into<String>, pair: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            pair: pair.into(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.bot_id, self.pair)
    }
}
