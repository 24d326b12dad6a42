use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::api::bybit::api::{self, ApiResponseError, Session};
use crate::api::bybit::auth::ApiCredential;
use crate::api::bybit::cancel_all_orders::{self, CancelAllParameter};
use crate::api::bybit::get_balance;
use crate::api::bybit::get_instruments::{self, normalize_pair};
use crate::api::bybit::get_position;
use crate::api::bybit::get_tickers;
use crate::api::bybit::send_order::{
    self, OrderParameter, OrderResponse, TriggerDirection, ERR_DUPLICATE_ORDER_LINK_ID,
};
use crate::api::bybit::set_leverage::{self, SetLeverageParameter, ERR_LEVERAGE_NOT_MODIFIED};
use crate::api::bybit::switch_isolated::{
    self, SwitchIsolatedParameter, ERR_MARGIN_MODE_NOT_MODIFIED,
};
use crate::api::bybit::trading_stop::{self, TradingStopParameter};
use crate::exchange::{
    ConditionalOrder, Exchange, MarginMode, MarketInfo, MarketOrder, OrderAck, PositionInfo,
    PositionMode, SettingOutcome,
};
use crate::model::{OrderSide, Side};
use crate::util::round_size;

/// `Exchange` implementation backed by the REST API of one bot account.
#[derive(Debug)]
pub struct BybitClient {
    session: Session,
    position_mode: PositionMode,
    markets: Mutex<HashMap<String, MarketInfo>>,
}

impl BybitClient {
    pub fn new(
        credential: ApiCredential,
        proxy: Option<&str>,
        testnet: bool,
        position_mode: PositionMode,
    ) -> Result<Self, ApiResponseError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5));

        if let Some(url) = proxy {
            info!("Using proxy: {}", url);
            builder = builder.proxy(reqwest::Proxy::https(url)?);
        }
        if testnet {
            info!("Operating in sandbox mode.");
        }

        let client = builder.build()?;
        Ok(Self {
            session: Session::new(client, testnet, credential),
            position_mode,
            markets: Mutex::new(HashMap::new()),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn settings_outcome(
        result: Result<serde_json::Value, ApiResponseError>,
        not_modified: i64,
    ) -> Result<SettingOutcome, ApiResponseError> {
        match result {
            Ok(_) => Ok(SettingOutcome::Applied),
            Err(e) if e.api_code() == Some(not_modified) => Ok(SettingOutcome::Unchanged),
            Err(e) => Err(e),
        }
    }

    /// A duplicate `orderLinkId` means an earlier attempt of the same order
    /// already went through.
    fn order_ack(
        result: Result<OrderResponse, ApiResponseError>,
        link_id: Option<&str>,
    ) -> Result<OrderAck, ApiResponseError> {
        match (result, link_id) {
            (Ok(response), _) => Ok(OrderAck {
                order_id: response.order_id,
            }),
            (Err(e), Some(link_id)) if e.api_code() == Some(ERR_DUPLICATE_ORDER_LINK_ID) => {
                info!("Order {} was already placed", link_id);
                Ok(OrderAck {
                    order_id: link_id.to_string(),
                })
            }
            (Err(e), _) => Err(e),
        }
    }

    fn market_parameter(&self, order: &MarketOrder) -> OrderParameter {
        let mut parameter = OrderParameter::market(&order.symbol, order.side, order.qty);
        parameter.reduce_only = order.reduce_only;
        parameter.close_on_trigger = order.close_on_trigger;
        parameter.stop_loss = order.stop_loss.map(|sl| round_size(sl).to_string());
        parameter.position_idx = self.position_mode.position_idx(order.position_side());
        parameter.order_link_id = order.link_id.clone();
        parameter
    }

    fn conditional_parameter(&self, order: &ConditionalOrder) -> OrderParameter {
        // a sell take-profit fires on the way up, a buy take-profit on the way down
        let direction = if order.trigger_price >= order.base_price {
            TriggerDirection::Rise
        } else {
            TriggerDirection::Fall
        };

        let mut parameter = OrderParameter::market(&order.symbol, order.side, order.qty);
        parameter.reduce_only = true;
        parameter.close_on_trigger = true;
        parameter.trigger_price = Some(round_size(order.trigger_price).to_string());
        parameter.trigger_direction = Some(direction.code());
        parameter.trigger_by = Some("LastPrice".to_string());
        parameter.position_idx = self.position_mode.position_idx(order.position_side());
        parameter.order_link_id = order.link_id.clone();
        parameter
    }

    fn trading_stop_parameter(&self, symbol: &str, side: Side, stop_loss: f64) -> TradingStopParameter {
        TradingStopParameter {
            category: api::CATEGORY.to_string(),
            symbol: symbol.to_string(),
            stop_loss: round_size(stop_loss).to_string(),
            tpsl_mode: "Full".to_string(),
            position_idx: self.position_mode.position_idx(side),
        }
    }
}

fn format_leverage(leverage: f64) -> String {
    leverage.to_string()
}

impl Exchange for BybitClient {
    async fn resolve_symbol(&self, pair: &str) -> Result<MarketInfo, ApiResponseError> {
        let symbol = normalize_pair(pair);
        let cached = self.markets.lock().get(&symbol).cloned();
        if let Some(market) = cached {
            return Ok(market);
        }

        let result = get_instruments::get_instruments(&self.session, &symbol).await?;
        let instrument = result
            .list
            .into_iter()
            .find(|i| i.symbol == symbol)
            .ok_or_else(|| ApiResponseError::UnknownSymbol(pair.to_string()))?;

        let market = MarketInfo {
            symbol: instrument.symbol,
            base: instrument.base_coin,
            quote: instrument.quote_coin,
        };
        debug!("Market resolved: {} -> {:?}", pair, market);
        self.markets.lock().insert(symbol, market.clone());
        Ok(market)
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ApiResponseError> {
        get_tickers::get_last_price(&self.session, symbol).await
    }

    async fn positions(&self, symbol: &str) -> Result<Vec<PositionInfo>, ApiResponseError> {
        let result = get_position::get_position(&self.session, symbol).await?;
        Ok(result
            .list
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| PositionInfo {
                side: p.side.parse::<OrderSide>().ok(),
                size: p.size,
                stop_loss: p.stop_loss,
                unrealized_pnl: p.unrealised_pnl,
                entry_price: p.avg_price,
                leverage: p.leverage,
            })
            .collect())
    }

    async fn free_balance(&self, coin: &str) -> Result<f64, ApiResponseError> {
        let result = get_balance::get_balance(&self.session, coin).await?;
        Ok(get_balance::free_balance(&result, coin))
    }

    async fn set_margin_mode(
        &self,
        symbol: &str,
        mode: MarginMode,
        leverage: f64,
    ) -> Result<SettingOutcome, ApiResponseError> {
        let parameter = SwitchIsolatedParameter {
            category: api::CATEGORY.to_string(),
            symbol: symbol.to_string(),
            trade_mode: match mode {
                MarginMode::Cross => 0,
                MarginMode::Isolated => 1,
            },
            buy_leverage: format_leverage(leverage),
            sell_leverage: format_leverage(leverage),
        };
        let result = switch_isolated::switch_isolated(&self.session, &parameter).await;
        Self::settings_outcome(result, ERR_MARGIN_MODE_NOT_MODIFIED)
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: f64,
    ) -> Result<SettingOutcome, ApiResponseError> {
        let parameter = SetLeverageParameter {
            category: api::CATEGORY.to_string(),
            symbol: symbol.to_string(),
            buy_leverage: format_leverage(leverage),
            sell_leverage: format_leverage(leverage),
        };
        let result = set_leverage::set_leverage(&self.session, &parameter).await;
        Self::settings_outcome(result, ERR_LEVERAGE_NOT_MODIFIED)
    }

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck, ApiResponseError> {
        let parameter = self.market_parameter(order);
        let result = send_order::post_order(&self.session, &parameter).await;
        let ack = Self::order_ack(result, order.link_id.as_deref())?;
        info!(
            "MARKET order sent: order_id={} side={} qty={} reduce_only={}",
            ack.order_id, order.side, order.qty, order.reduce_only
        );
        Ok(ack)
    }

    async fn place_conditional_order(
        &self,
        order: &ConditionalOrder,
    ) -> Result<OrderAck, ApiResponseError> {
        let parameter = self.conditional_parameter(order);
        let result = send_order::post_order(&self.session, &parameter).await;
        let ack = Self::order_ack(result, order.link_id.as_deref())?;
        info!(
            "Conditional order sent: order_id={} side={} qty={} trigger={}",
            ack.order_id, order.side, order.qty, order.trigger_price
        );
        Ok(ack)
    }

    async fn cancel_conditional_orders(&self, symbol: &str) -> Result<(), ApiResponseError> {
        let parameter = CancelAllParameter {
            category: api::CATEGORY.to_string(),
            symbol: symbol.to_string(),
            order_filter: "StopOrder".to_string(),
        };
        cancel_all_orders::cancel_all_orders(&self.session, &parameter).await?;
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        stop_loss: f64,
    ) -> Result<(), ApiResponseError> {
        let parameter = self.trading_stop_parameter(symbol, side, stop_loss);
        trading_stop::set_trading_stop(&self.session, &parameter).await?;
        debug!("Trading stop set: symbol={} side={} stop_loss={}", symbol, side, stop_loss);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_outcome_classification() {
        let applied = BybitClient::settings_outcome(Ok(serde_json::json!({})), 110043);
        assert_eq!(applied.unwrap(), SettingOutcome::Applied);

        let unchanged = BybitClient::settings_outcome(
            Err(ApiResponseError::Api {
                code: 110043,
                message: "leverage not modified".to_string(),
            }),
            110043,
        );
        assert_eq!(unchanged.unwrap(), SettingOutcome::Unchanged);

        let failed = BybitClient::settings_outcome(
            Err(ApiResponseError::Api {
                code: 10001,
                message: "params error".to_string(),
            }),
            110043,
        );
        assert_eq!(failed.unwrap_err().api_code(), Some(10001));
    }

    #[test]
    fn test_client_builds_with_proxy() {
        let client = BybitClient::new(
            ApiCredential::new("k", "s"),
            Some("http://127.0.0.1:8080"),
            true,
            PositionMode::Hedge,
        )
        .unwrap();
        assert_eq!(client.session().endpoint, api::TESTNET_ENDPOINT);
    }

    fn client(position_mode: PositionMode) -> BybitClient {
        BybitClient::new(ApiCredential::new("k", "s"), None, true, position_mode).unwrap()
    }

    #[test]
    fn test_hedge_mode_position_idx() {
        let client = client(PositionMode::Hedge);

        let open_short = MarketOrder::open("BTCUSDT", OrderSide::Sell, 2.0, Some(51.0))
            .with_link_id("cmd-3-open");
        let json = serde_json::to_value(client.market_parameter(&open_short)).unwrap();
        assert_eq!(json["positionIdx"], 2);
        assert_eq!(json["orderLinkId"], "cmd-3-open");
        assert_eq!(json["stopLoss"], "51");

        let close_long = MarketOrder::close("BTCUSDT", OrderSide::Sell, 2.0);
        let json = serde_json::to_value(client.market_parameter(&close_long)).unwrap();
        assert_eq!(json["positionIdx"], 1);
        assert_eq!(json["reduceOnly"], true);

        let take_profit = ConditionalOrder {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            qty: 1.0,
            base_price: 50.0,
            trigger_price: 45.0,
            link_id: Some("cmd-3-tp1".to_string()),
        };
        let json = serde_json::to_value(client.conditional_parameter(&take_profit)).unwrap();
        assert_eq!(json["positionIdx"], 2);
        assert_eq!(json["triggerDirection"], 2);
        assert_eq!(json["orderLinkId"], "cmd-3-tp1");

        let stop = client.trading_stop_parameter("BTCUSDT", Side::Long, 49.004);
        let json = serde_json::to_value(&stop).unwrap();
        assert_eq!(json["positionIdx"], 1);
        assert_eq!(json["stopLoss"], "49");
        let stop = client.trading_stop_parameter("BTCUSDT", Side::Short, 51.0);
        assert_eq!(stop.position_idx, 2);
    }

    #[test]
    fn test_one_way_mode_position_idx() {
        let client = client(PositionMode::OneWay);
        let order = MarketOrder::open("BTCUSDT", OrderSide::Sell, 2.0, None);
        let json = serde_json::to_value(client.market_parameter(&order)).unwrap();
        assert_eq!(json["positionIdx"], 0);
        assert!(json.get("orderLinkId").is_none());
        assert_eq!(
            client.trading_stop_parameter("BTCUSDT", Side::Short, 51.0).position_idx,
            0
        );
    }

    #[test]
    fn test_duplicate_link_id_is_an_ack() {
        let duplicate = || {
            Err(ApiResponseError::Api {
                code: ERR_DUPLICATE_ORDER_LINK_ID,
                message: "OrderLinkedID is duplicate".to_string(),
            })
        };

        let ack = BybitClient::order_ack(duplicate(), Some("cmd-9-open")).unwrap();
        assert_eq!(ack.order_id, "cmd-9-open");
        assert!(BybitClient::order_ack(duplicate(), None).is_err());

        let placed = BybitClient::order_ack(
            Ok(OrderResponse {
                order_id: "1234".to_string(),
                order_link_id: "cmd-9-open".to_string(),
            }),
            Some("cmd-9-open"),
        )
        .unwrap();
        assert_eq!(placed.order_id, "1234");
    }
}
