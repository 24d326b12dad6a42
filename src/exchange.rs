//! Exchange abstraction used by the trade worker and the trailing stop
//! controller, plus the retry layer that wraps every outbound call.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::api::bybit::api::ApiResponseError;
use crate::model::{OrderSide, Side};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketInfo {
    pub symbol: String,
    pub base: String,
    pub quote: String,
}

/// One raw position row as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PositionInfo {
    /// `None` for an empty row.
    pub side: Option<OrderSide>,
    pub size: f64,
    pub stop_loss: f64,
    pub unrealized_pnl: f64,
    pub entry_price: f64,
    pub leverage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Isolated,
    Cross,
}

/// Result of an idempotent account setting call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingOutcome {
    Applied,
    /// The exchange reported the value was already in place.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub reduce_only: bool,
    pub close_on_trigger: bool,
    pub stop_loss: Option<f64>,
    /// Client order id; a retried request with the same id is not placed twice.
    pub link_id: Option<String>,
}

impl MarketOrder {
    pub fn open(symbol: &str, side: OrderSide, qty: f64, stop_loss: Option<f64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            qty,
            reduce_only: false,
            close_on_trigger: false,
            stop_loss,
            link_id: None,
        }
    }

    pub fn close(symbol: &str, side: OrderSide, qty: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            qty,
            reduce_only: true,
            close_on_trigger: true,
            stop_loss: None,
            link_id: None,
        }
    }

    pub fn with_link_id(mut self, link_id: impl Into<String>) -> Self {
        self.link_id = Some(link_id.into());
        self
    }

    /// Direction of the position this order opens or reduces.
    pub fn position_side(&self) -> Side {
        match (self.side, self.reduce_only) {
            (OrderSide::Buy, false) | (OrderSide::Sell, true) => Side::Long,
            (OrderSide::Sell, false) | (OrderSide::Buy, true) => Side::Short,
        }
    }
}

/// Reduce-only market order fired when the last price crosses `trigger_price`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub base_price: f64,
    pub trigger_price: f64,
    pub link_id: Option<String>,
}

impl ConditionalOrder {
    /// Direction of the position this order reduces.
    pub fn position_side(&self) -> Side {
        match self.side {
            OrderSide::Sell => Side::Long,
            OrderSide::Buy => Side::Short,
        }
    }
}

/// How the account books positions: one net position per symbol, or a long
/// and a short slot side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    OneWay,
    Hedge,
}

impl PositionMode {
    /// `positionIdx` of the slot holding a `side` position.
    pub fn position_idx(self, side: Side) -> i32 {
        match (self, side) {
            (PositionMode::OneWay, _) => 0,
            (PositionMode::Hedge, Side::Long) => 1,
            (PositionMode::Hedge, Side::Short) => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
}

impl OrderAck {
    pub fn is_confirmed(&self) -> bool {
        !self.order_id.is_empty()
    }
}

pub trait Exchange: Send + Sync {
    fn resolve_symbol(
        &self,
        pair: &str,
    ) -> impl Future<Output = Result<MarketInfo, ApiResponseError>> + Send;

    fn last_price(&self, symbol: &str) -> impl Future<Output = Result<f64, ApiResponseError>> + Send;

    fn positions(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<Vec<PositionInfo>, ApiResponseError>> + Send;

    fn free_balance(&self, coin: &str) -> impl Future<Output = Result<f64, ApiResponseError>> + Send;

    fn set_margin_mode(
        &self,
        symbol: &str,
        mode: MarginMode,
        leverage: f64,
    ) -> impl Future<Output = Result<SettingOutcome, ApiResponseError>> + Send;

    fn set_leverage(
        &self,
        symbol: &str,
        leverage: f64,
    ) -> impl Future<Output = Result<SettingOutcome, ApiResponseError>> + Send;

    fn place_market_order(
        &self,
        order: &MarketOrder,
    ) -> impl Future<Output = Result<OrderAck, ApiResponseError>> + Send;

    fn place_conditional_order(
        &self,
        order: &ConditionalOrder,
    ) -> impl Future<Output = Result<OrderAck, ApiResponseError>> + Send;

    fn cancel_conditional_orders(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<(), ApiResponseError>> + Send;

    fn set_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        stop_loss: f64,
    ) -> impl Future<Output = Result<(), ApiResponseError>> + Send;
}

/// Fixed-delay retry: `attempts` tries, `delay` between them, no backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up; the last
    /// error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ApiResponseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiResponseError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "[RETRY] {} failed (attempt {}/{}): {}. Trying again in {:?}",
                        label, attempt, attempts, e, self.delay
                    );
                    attempt += 1;
                    sleep(self.delay).await;
                }
            }
        }
    }
}

/// Applies a `RetryPolicy` to every call of the wrapped exchange.
#[derive(Debug, Clone)]
pub struct Retrying<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: Exchange> Retrying<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: Exchange> Exchange for Retrying<E> {
    async fn resolve_symbol(&self, pair: &str) -> Result<MarketInfo, ApiResponseError> {
        self.policy
            .run("resolve_symbol", move || self.inner.resolve_symbol(pair))
            .await
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ApiResponseError> {
        self.policy
            .run("last_price", move || self.inner.last_price(symbol))
            .await
    }

    async fn positions(&self, symbol: &str) -> Result<Vec<PositionInfo>, ApiResponseError> {
        self.policy
            .run("positions", move || self.inner.positions(symbol))
            .await
    }

    async fn free_balance(&self, coin: &str) -> Result<f64, ApiResponseError> {
        self.policy
            .run("free_balance", move || self.inner.free_balance(coin))
            .await
    }

    async fn set_margin_mode(
        &self,
        symbol: &str,
        mode: MarginMode,
        leverage: f64,
    ) -> Result<SettingOutcome, ApiResponseError> {
        self.policy
            .run("set_margin_mode", move || {
                self.inner.set_margin_mode(symbol, mode, leverage)
            })
            .await
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: f64,
    ) -> Result<SettingOutcome, ApiResponseError> {
        self.policy
            .run("set_leverage", move || self.inner.set_leverage(symbol, leverage))
            .await
    }

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck, ApiResponseError> {
        self.policy
            .run("place_market_order", move || self.inner.place_market_order(order))
            .await
    }

    async fn place_conditional_order(
        &self,
        order: &ConditionalOrder,
    ) -> Result<OrderAck, ApiResponseError> {
        self.policy
            .run("place_conditional_order", move || {
                self.inner.place_conditional_order(order)
            })
            .await
    }

    async fn cancel_conditional_orders(&self, symbol: &str) -> Result<(), ApiResponseError> {
        self.policy
            .run("cancel_conditional_orders", move || {
                self.inner.cancel_conditional_orders(symbol)
            })
            .await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        stop_loss: f64,
    ) -> Result<(), ApiResponseError> {
        self.policy
            .run("set_stop_loss", move || {
                self.inner.set_stop_loss(symbol, side, stop_loss)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(code: i64) -> ApiResponseError {
        ApiResponseError::Api {
            code,
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result = policy
            .run("op", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 1 {
                    Err(api_error(1))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result: Result<(), _> = policy
            .run("op", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(api_error(n as i64))
            })
            .await;
        assert_eq!(result.unwrap_err().api_code(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_at_least_one_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            attempts: 0,
            delay: Duration::ZERO,
        };
        let _: Result<(), _> = policy
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(api_error(1))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_order_ack_confirmation() {
        assert!(OrderAck { order_id: "abc".to_string() }.is_confirmed());
        assert!(!OrderAck { order_id: String::new() }.is_confirmed());
    }

    #[test]
    fn test_market_order_constructors() {
        let open = MarketOrder::open("BTCUSDT", OrderSide::Buy, 1.0, Some(95.0));
        assert!(!open.reduce_only && !open.close_on_trigger);
        let close = MarketOrder::close("BTCUSDT", OrderSide::Sell, 1.0);
        assert!(close.reduce_only && close.close_on_trigger);
        assert_eq!(close.stop_loss, None);
        assert_eq!(close.link_id, None);
        assert_eq!(
            close.with_link_id("cmd-7-close").link_id.as_deref(),
            Some("cmd-7-close")
        );
    }

    #[test]
    fn test_position_side_of_orders() {
        assert_eq!(MarketOrder::open("X", OrderSide::Buy, 1.0, None).position_side(), Side::Long);
        assert_eq!(MarketOrder::open("X", OrderSide::Sell, 1.0, None).position_side(), Side::Short);
        assert_eq!(MarketOrder::close("X", OrderSide::Sell, 1.0).position_side(), Side::Long);
        assert_eq!(MarketOrder::close("X", OrderSide::Buy, 1.0).position_side(), Side::Short);

        assert_eq!(PositionMode::Hedge.position_idx(Side::Long), 1);
        assert_eq!(PositionMode::Hedge.position_idx(Side::Short), 2);
        assert_eq!(PositionMode::OneWay.position_idx(Side::Short), 0);
    }
}
