use crate::api::bybit::api;
use crate::api::bybit::api::{deserialize_f64_or_zero, ApiResponseError};
use serde::Deserialize;
use std::collections::HashMap;

const PATH: &str = "/v5/position/list";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Position {
    pub symbol: String,
    /// "Buy", "Sell", or "" when flat.
    pub side: String,

    #[serde(deserialize_with = "deserialize_f64_or_zero")]
    pub size: f64,

    #[serde(rename = "avgPrice", deserialize_with = "deserialize_f64_or_zero")]
    pub avg_price: f64,

    #[serde(rename = "stopLoss", default, deserialize_with = "deserialize_f64_or_zero")]
    pub stop_loss: f64,

    #[serde(rename = "unrealisedPnl", default, deserialize_with = "deserialize_f64_or_zero")]
    pub unrealised_pnl: f64,

    #[serde(default, deserialize_with = "deserialize_f64_or_zero")]
    pub leverage: f64,

    #[serde(rename = "positionIdx", default)]
    pub position_idx: i32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PositionResult {
    pub list: Vec<Position>,
}

pub async fn get_position(
    session: &api::Session,
    symbol: &str,
) -> Result<PositionResult, ApiResponseError> {
    let mut params = HashMap::new();
    params.insert("category".to_string(), api::CATEGORY.to_string());
    params.insert("symbol".to_string(), symbol.to_string());
    api::get::<PositionResult>(session, PATH, &params).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_list_deserialize() {
        let json = r#"{"list":[
            {"symbol":"BTCUSDT","side":"Buy","size":"0.5","avgPrice":"100.5","stopLoss":"","unrealisedPnl":"3.2","leverage":"5","positionIdx":1},
            {"symbol":"BTCUSDT","side":"","size":"0","avgPrice":"0","stopLoss":"","unrealisedPnl":"","leverage":"5","positionIdx":2}
        ]}"#;
        let result: PositionResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.list.len(), 2);
        assert_eq!(result.list[0].side, "Buy");
        assert_eq!(result.list[0].size, 0.5);
        assert_eq!(result.list[0].avg_price, 100.5);
        assert_eq!(result.list[0].stop_loss, 0.0);
        assert_eq!(result.list[1].size, 0.0);
        assert_eq!(result.list[1].unrealised_pnl, 0.0);
    }
}
