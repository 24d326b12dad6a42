use crate::api::bybit::api;
use crate::api::bybit::api::ApiResponseError;
use serde::Serialize;

const PATH: &str = "/v5/position/trading-stop";

#[derive(Serialize, Debug)]
pub struct TradingStopParameter {
    pub category: String,
    pub symbol: String,
    #[serde(rename = "stopLoss")]
    pub stop_loss: String,
    #[serde(rename = "tpslMode")]
    pub tpsl_mode: String,
    /// 0 one-way mode, 1 hedge-mode buy side, 2 hedge-mode sell side
    #[serde(rename = "positionIdx")]
    pub position_idx: i32,
}

pub async fn set_trading_stop(
    session: &api::Session,
    parameter: &TradingStopParameter,
) -> Result<serde_json::Value, ApiResponseError> {
    api::post::<TradingStopParameter, serde_json::Value>(session, PATH, parameter).await
}
