use crate::api::bybit::api;
use crate::api::bybit::api::ApiResponseError;
use crate::model::OrderSide;
use serde::{Deserialize, Serialize};

const PATH: &str = "/v5/order/create";

/// An order with the same `orderLinkId` already exists.
pub const ERR_DUPLICATE_ORDER_LINK_ID: i64 = 110072;

#[derive(Deserialize, Debug)]
pub struct OrderResponse {
    #[serde(rename = "orderId", default)]
    pub order_id: String,
    #[serde(rename = "orderLinkId", default)]
    pub order_link_id: String,
}

/// Which way the last price must cross `triggerPrice` to fire a conditional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDirection {
    Rise,
    Fall,
}

impl TriggerDirection {
    pub fn code(self) -> u8 {
        match self {
            TriggerDirection::Rise => 1,
            TriggerDirection::Fall => 2,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct OrderParameter {
    pub category: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "orderType")]
    pub order_type: String,
    pub qty: String,
    #[serde(rename = "timeInForce")]
    pub time_in_force: String,
    #[serde(rename = "reduceOnly")]
    pub reduce_only: bool,
    #[serde(rename = "closeOnTrigger")]
    pub close_on_trigger: bool,
    #[serde(rename = "stopLoss", skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<String>,
    #[serde(rename = "triggerPrice", skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<String>,
    #[serde(rename = "triggerDirection", skip_serializing_if = "Option::is_none")]
    pub trigger_direction: Option<u8>,
    #[serde(rename = "triggerBy", skip_serializing_if = "Option::is_none")]
    pub trigger_by: Option<String>,
    /// 0 one-way mode, 1 hedge-mode buy side, 2 hedge-mode sell side
    #[serde(rename = "positionIdx")]
    pub position_idx: i32,
    #[serde(rename = "orderLinkId", skip_serializing_if = "Option::is_none")]
    pub order_link_id: Option<String>,
}

impl OrderParameter {
    pub fn market(symbol: &str, side: OrderSide, qty: f64) -> Self {
        Self {
            category: api::CATEGORY.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: "Market".to_string(),
            qty: qty.to_string(),
            time_in_force: "GTC".to_string(),
            reduce_only: false,
            close_on_trigger: false,
            stop_loss: None,
            trigger_price: None,
            trigger_direction: None,
            trigger_by: None,
            position_idx: 0,
            order_link_id: None,
        }
    }
}

pub async fn post_order(
    session: &api::Session,
    parameter: &OrderParameter,
) -> Result<OrderResponse, ApiResponseError> {
    api::post::<OrderParameter, OrderResponse>(session, PATH, parameter).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_order_serialization_skips_unset() {
        let p = OrderParameter::market("BTCUSDT", OrderSide::Buy, 20.0);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["side"], "Buy");
        assert_eq!(json["orderType"], "Market");
        assert_eq!(json["qty"], "20");
        assert_eq!(json["category"], "linear");
        assert!(json.get("stopLoss").is_none());
        assert!(json.get("triggerPrice").is_none());
        assert!(json.get("orderLinkId").is_none());
        assert_eq!(json["positionIdx"], 0);
    }
}
