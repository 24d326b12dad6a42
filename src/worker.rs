//! Trade worker: drains the pending commands of one bot and turns each into
//! exchange actions.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::api::bybit::client::BybitClient;
use crate::config::{BotConfig, MasterConfig, PairConfig, TakeProfitLevel, TakeProfitMiss};
use crate::credentials::CredentialBook;
use crate::error::{CommandError, WorkerError};
use crate::exchange::{
    ConditionalOrder, Exchange, MarginMode, MarketInfo, MarketOrder, Retrying, SettingOutcome,
};
use crate::logging::audit_logger::{AuditEvent, AuditLogger};
use crate::model::{
    parse_percent, Command, CommandKind, CommandStatus, PositionSnapshot, Side, TakeProfitVariant,
};
use crate::position;
use crate::store::{LockGuard, Outcome, Store, StoreError};
use crate::util::round_size;

const LADDER_TOTAL: f64 = 100.0;
const LADDER_TOLERANCE: f64 = 1e-9;

/// Order size for `percent` of the free balance at `leverage`, two decimals.
pub fn order_quantity(free_balance: f64, leverage: f64, percent: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    round_size(free_balance * leverage * (percent / 100.0) / price)
}

/// Stop-loss price `percent` away from `price` on the losing side.
pub fn stop_loss_price(side: Side, price: f64, percent: f64) -> f64 {
    match side {
        Side::Long => round_size((100.0 - percent) / 100.0 * price),
        Side::Short => round_size((100.0 + percent) / 100.0 * price),
    }
}

/// Take-profit trigger `percent` away from `price` on the winning side.
pub fn take_profit_price(side: Side, price: f64, percent: f64) -> f64 {
    match side {
        Side::Long => round_size((100.0 + percent) / 100.0 * price),
        Side::Short => round_size((100.0 - percent) / 100.0 * price),
    }
}

/// An empty ladder is valid; otherwise the position fractions must add up
/// to exactly 100.
pub fn validate_ladder(levels: &[TakeProfitLevel]) -> Result<(), CommandError> {
    if levels.is_empty() {
        return Ok(());
    }
    let total: f64 = levels.iter().map(|l| l.position_percent).sum();
    if (total - LADDER_TOTAL).abs() > LADDER_TOLERANCE {
        return Err(CommandError::InvalidLadder(total));
    }
    Ok(())
}

/// Checks that `position` is open in direction `side`.
pub fn require_side(side: Side, position: &PositionSnapshot) -> Result<(), CommandError> {
    match position.side {
        Some(open) if open == side => Ok(()),
        Some(open) => Err(CommandError::Guard(format!(
            "this bot has a {} position open.",
            open
        ))),
        None => Err(CommandError::Guard(format!(
            "there is no active {} position to close.",
            side
        ))),
    }
}

/// Per-invocation summary.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerReport {
    pub outcomes: Vec<(i64, Outcome)>,
    /// Commands found already terminal and left alone.
    pub skipped: usize,
}

impl WorkerReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.status() == CommandStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

pub struct TradeWorker<E> {
    exchange: E,
    store: Store,
    config: BotConfig,
    audit: AuditLogger,
}

impl<E: Exchange> TradeWorker<E> {
    pub fn new(exchange: E, store: Store, config: BotConfig, audit: AuditLogger) -> Self {
        Self {
            exchange,
            store,
            config,
            audit,
        }
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Runs every command in order. A failing command is recorded and the
    /// batch goes on.
    pub async fn process(&self, commands: Vec<Command>, lock: &LockGuard) -> WorkerReport {
        let mut report = WorkerReport::default();

        for command in commands {
            if !self.is_still_pending(command.id).await {
                debug!("[WORKER] Command {} is no longer pending, skipping", command.id);
                report.skipped += 1;
                continue;
            }

            info!(
                "[WORKER] bot={} id={} command={} pair={} percent={:?}",
                command.bot_id, command.id, command.command, command.pair, command.percent
            );

            let outcome = match self.execute(&command).await {
                Ok(message) => {
                    info!("[WORKER] Command {} succeeded: {}", command.id, message);
                    Outcome::Success(message)
                }
                Err(e) => {
                    let severity = e.severity();
                    warn!(
                        "[WORKER] Command {} failed ({}): {}",
                        command.id,
                        severity.as_str(),
                        e
                    );
                    Outcome::Failed {
                        message: e.to_string(),
                        severity,
                    }
                }
            };

            let now = Utc::now();
            let finalized = {
                let outcome = outcome.clone();
                let id = command.id;
                self.store
                    .blocking(move |store| store.finalize(id, &outcome, now))
                    .await
            };
            match finalized {
                Ok(()) => self.audit.log(audit_event(&command, &outcome, now)),
                Err(StoreError::AlreadyFinalized(id)) => {
                    warn!("[WORKER] Command {} was finalized elsewhere", id)
                }
                Err(e) => error!("[WORKER] Failed to record command {}: {}", command.id, e),
            }
            report.outcomes.push((command.id, outcome));

            lock.renew(Utc::now()).await;
        }

        report
    }

    async fn is_still_pending(&self, id: i64) -> bool {
        match self.store.blocking(move |store| store.get_command(id)).await {
            Ok(Some(command)) => command.status == CommandStatus::Pending,
            Ok(None) => false,
            Err(e) => {
                error!("[WORKER] Failed to read command {}: {}", id, e);
                false
            }
        }
    }

    /// Executes one command and returns the success message.
    pub async fn execute(&self, command: &Command) -> Result<String, CommandError> {
        let started = Utc::now();
        let age = started - command.created_at;
        if age >= self.config.max_message_age() {
            return Err(CommandError::Expired(age.num_seconds()));
        }

        let kind = command
            .command
            .parse::<CommandKind>()
            .map_err(|_| CommandError::InvalidCommand(command.command.clone()))?;

        let (market, position) = position::resolve(&self.exchange, &command.pair).await?;
        debug!("[WORKER] {} position: {:?}", market.symbol, position);

        match kind {
            CommandKind::Enter(side) => self.enter(side, command, &market, &position, started).await,
            CommandKind::Exit(side) => self.exit(side, command, &market, &position).await,
            CommandKind::TakeProfit(side, variant) => {
                self.take_profit(side, variant, command, &market, &position, started)
                    .await
            }
        }
    }

    fn pair_config(&self, pair: &str) -> Result<&PairConfig, CommandError> {
        self.config
            .pair(pair)
            .ok_or_else(|| CommandError::Config(format!("no settings for pair {}", pair)))
    }

    fn check_order_time(&self, started: DateTime<Utc>) -> Result<(), CommandError> {
        if Utc::now() - started >= self.config.max_order_time() {
            return Err(CommandError::OrderTimeout);
        }
        Ok(())
    }

    async fn sized_quantity(
        &self,
        market: &MarketInfo,
        pair_config: &PairConfig,
    ) -> Result<(f64, f64), CommandError> {
        let free = self.exchange.free_balance(&market.quote).await?;
        let price = self.exchange.last_price(&market.symbol).await?;
        let qty = order_quantity(free, pair_config.leverage, pair_config.portfolio_percent, price);
        info!(
            "[WORKER] {} free={} leverage={} percent={} price={} qty={}",
            market.symbol, free, pair_config.leverage, pair_config.portfolio_percent, price, qty
        );
        Ok((qty, price))
    }

    async fn enter(
        &self,
        side: Side,
        command: &Command,
        market: &MarketInfo,
        position: &PositionSnapshot,
        started: DateTime<Utc>,
    ) -> Result<String, CommandError> {
        if position.is_open() {
            return Err(CommandError::Guard(
                "this bot already has a position open.".to_string(),
            ));
        }

        let pair_config = self.pair_config(&command.pair)?;
        validate_ladder(&pair_config.take_profits)?;

        let mode = if pair_config.is_isolated {
            MarginMode::Isolated
        } else {
            MarginMode::Cross
        };
        if self
            .exchange
            .set_margin_mode(&market.symbol, mode, pair_config.leverage)
            .await?
            == SettingOutcome::Unchanged
        {
            debug!("[WORKER] {} margin mode already {:?}", market.symbol, mode);
        }
        if self
            .exchange
            .set_leverage(&market.symbol, pair_config.leverage)
            .await?
            == SettingOutcome::Unchanged
        {
            debug!("[WORKER] {} leverage already {}", market.symbol, pair_config.leverage);
        }

        let (qty, price) = self.sized_quantity(market, pair_config).await?;
        self.check_order_time(started)?;

        let stop_loss = pair_config
            .stop_loss
            .map(|percent| stop_loss_price(side, price, percent));
        let order = MarketOrder::open(&market.symbol, side.entry_order(), qty, stop_loss)
            .with_link_id(order_link_id(command.id, "open"));
        let ack = self.exchange.place_market_order(&order).await?;
        if !ack.is_confirmed() {
            return Err(CommandError::Unconfirmed("market order".to_string()));
        }

        for (n, level) in pair_config.take_profits.iter().enumerate() {
            let order = ConditionalOrder {
                symbol: market.symbol.clone(),
                side: side.closing_order(),
                qty: round_size(level.position_percent / 100.0 * qty),
                base_price: price,
                trigger_price: take_profit_price(side, price, level.percent),
                link_id: Some(order_link_id(command.id, &format!("tp{}", n + 1))),
            };
            debug!("[WORKER] Take profit: {:?}", order);
            let ack = self.exchange.place_conditional_order(&order).await?;
            if !ack.is_confirmed() {
                return Err(CommandError::Unconfirmed("take-profit order".to_string()));
            }
        }

        Ok("Position opened successfully.".to_string())
    }

    async fn close(
        &self,
        command: &Command,
        market: &MarketInfo,
        position: &PositionSnapshot,
        side: Side,
    ) -> Result<String, CommandError> {
        let order = MarketOrder::close(&market.symbol, side.closing_order(), position.quantity)
            .with_link_id(order_link_id(command.id, "close"));
        let ack = self.exchange.place_market_order(&order).await?;
        if !ack.is_confirmed() {
            return Err(CommandError::Unconfirmed("close order".to_string()));
        }
        Ok("Position closed successfully.".to_string())
    }

    async fn exit(
        &self,
        side: Side,
        command: &Command,
        market: &MarketInfo,
        position: &PositionSnapshot,
    ) -> Result<String, CommandError> {
        require_side(side, position)?;
        self.exchange.cancel_conditional_orders(&market.symbol).await?;
        self.close(command, market, position, side).await
    }

    async fn take_profit(
        &self,
        side: Side,
        variant: TakeProfitVariant,
        command: &Command,
        market: &MarketInfo,
        position: &PositionSnapshot,
        started: DateTime<Utc>,
    ) -> Result<String, CommandError> {
        require_side(side, position)?;
        let pnl = position.pnl_percent();

        if variant == TakeProfitVariant::Positive {
            debug!("[WORKER] {} pnl={:.4}%", market.symbol, pnl);
            if pnl > 0.0 {
                return self.close(command, market, position, side).await;
            }
            return Err(CommandError::ThresholdNotMet(
                "profit is not positive".to_string(),
            ));
        }

        let target = command
            .percent
            .as_deref()
            .and_then(parse_percent)
            .ok_or(CommandError::MissingPercent)?;
        debug!("[WORKER] {} pnl={:.4}% target={}%", market.symbol, pnl, target);
        if pnl >= target {
            return self.close(command, market, position, side).await;
        }

        let missed = CommandError::ThresholdNotMet("P/L is less than specified percent.".to_string());
        if variant == TakeProfitVariant::Target {
            return Err(missed);
        }

        let pair_config = self.pair_config(&command.pair)?;
        match pair_config.take_profit_miss {
            TakeProfitMiss::Reject => Err(missed),
            TakeProfitMiss::Reenter => {
                let (qty, _) = self.sized_quantity(market, pair_config).await?;
                self.check_order_time(started)?;
                let order = MarketOrder::open(&market.symbol, side.entry_order(), qty, None)
                    .with_link_id(order_link_id(command.id, "reenter"));
                let ack = self.exchange.place_market_order(&order).await?;
                if !ack.is_confirmed() {
                    return Err(CommandError::Unconfirmed("market order".to_string()));
                }
                Ok("take-profit order created".to_string())
            }
        }
    }
}

/// Client order id tying an order to the command that placed it, so a
/// retried request cannot open a second order.
pub fn order_link_id(command_id: i64, leg: &str) -> String {
    format!("cmd-{}-{}", command_id, leg)
}

fn audit_event(command: &Command, outcome: &Outcome, timestamp: DateTime<Utc>) -> AuditEvent {
    match outcome {
        Outcome::Success(message) => AuditEvent::CommandSucceeded {
            timestamp,
            command_id: command.id,
            bot_id: command.bot_id.clone(),
            pair: command.pair.clone(),
            command: command.command.clone(),
            message: message.clone(),
        },
        Outcome::Failed { message, severity } => AuditEvent::CommandFailed {
            timestamp,
            command_id: command.id,
            bot_id: command.bot_id.clone(),
            pair: command.pair.clone(),
            command: command.command.clone(),
            severity: *severity,
            message: message.clone(),
        },
    }
}

/// Shared state every worker invocation starts from.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub master: MasterConfig,
    pub store: Store,
    pub audit: AuditLogger,
}

/// One worker invocation for the bot of `lock`: startup checks, then the
/// batch.
///
/// The lease is released on every return path when `lock` drops.
pub async fn run_worker(ctx: &WorkerContext, lock: LockGuard) -> Result<WorkerReport, WorkerError> {
    let bot_id = lock.bot_id();

    let credentials = CredentialBook::load(
        Path::new(&ctx.master.keys_path),
        Path::new(&ctx.master.proxies_path),
    )?;
    let Some(credential) = credentials.credential(bot_id) else {
        error!("[WORKER] No credentials found for bot {}", bot_id);
        return Err(WorkerError::NoCredentials(bot_id.to_string()));
    };

    let config = BotConfig::load(&ctx.master.bot_config_path(bot_id))?;

    let commands = {
        let bot_id = bot_id.to_string();
        ctx.store
            .blocking(move |store| store.pending_for(&bot_id))
            .await?
    };
    if commands.is_empty() {
        info!("[WORKER] No pending commands for bot {}", bot_id);
        return Err(WorkerError::NoPendingCommands(bot_id.to_string()));
    }

    let client = BybitClient::new(
        credential.clone(),
        credentials.proxy(bot_id),
        ctx.master.testnet,
        ctx.master.position_mode(),
    )?;
    let exchange = Retrying::new(client, ctx.master.retry_policy());
    let worker = TradeWorker::new(exchange, ctx.store.clone(), config, ctx.audit.clone());

    info!("[WORKER] bot={} processing {} command(s)", bot_id, commands.len());
    let report = worker.process(commands, &lock).await;
    info!(
        "[WORKER] bot={} done: {} succeeded, {} failed, {} skipped",
        bot_id,
        report.succeeded(),
        report.failed(),
        report.skipped
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(percent: f64, position_percent: f64) -> TakeProfitLevel {
        TakeProfitLevel {
            percent,
            position_percent,
        }
    }

    #[test]
    fn test_order_quantity() {
        assert_eq!(order_quantity(1000.0, 5.0, 20.0, 50.0), 20.0);
        assert_eq!(order_quantity(333.0, 3.0, 10.0, 7.0), 14.27);
        assert_eq!(order_quantity(1000.0, 5.0, 20.0, 0.0), 0.0);
    }

    #[test]
    fn test_stop_and_target_prices() {
        assert_eq!(stop_loss_price(Side::Long, 50.0, 2.0), 49.0);
        assert_eq!(stop_loss_price(Side::Short, 50.0, 2.0), 51.0);
        assert_eq!(take_profit_price(Side::Long, 50.0, 10.0), 55.0);
        assert_eq!(take_profit_price(Side::Short, 50.0, 10.0), 45.0);
    }

    #[test]
    fn test_validate_ladder() {
        assert!(validate_ladder(&[]).is_ok());
        assert!(validate_ladder(&[level(10.0, 50.0), level(20.0, 50.0)]).is_ok());
        assert!(validate_ladder(&[level(1.0, 33.3), level(2.0, 33.3), level(3.0, 33.4)]).is_ok());

        let err = validate_ladder(&[level(10.0, 50.0), level(20.0, 40.0)]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidLadder(sum) if sum == 90.0));
    }

    #[test]
    fn test_require_side_messages() {
        let mut position = PositionSnapshot::flat(100.0);
        let err = require_side(Side::Long, &position).unwrap_err();
        assert_eq!(err.to_string(), "there is no active long position to close.");

        position.side = Some(Side::Short);
        let err = require_side(Side::Long, &position).unwrap_err();
        assert_eq!(err.to_string(), "this bot has a short position open.");
        assert!(require_side(Side::Short, &position).is_ok());
    }

    #[test]
    fn test_report_counts() {
        let report = WorkerReport {
            outcomes: vec![
                (1, Outcome::Success("ok".to_string())),
                (
                    2,
                    Outcome::Failed {
                        message: "no".to_string(),
                        severity: crate::model::Severity::Warn,
                    },
                ),
            ],
            skipped: 1,
        };
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
    }
}
