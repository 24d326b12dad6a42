use crate::api::bybit::api;
use crate::api::bybit::api::ApiResponseError;
use serde::Serialize;

const PATH: &str = "/v5/position/set-leverage";

/// "leverage not modified"
pub const ERR_LEVERAGE_NOT_MODIFIED: i64 = 110043;

#[derive(Serialize, Debug)]
pub struct SetLeverageParameter {
    pub category: String,
    pub symbol: String,
    #[serde(rename = "buyLeverage")]
    pub buy_leverage: String,
    #[serde(rename = "sellLeverage")]
    pub sell_leverage: String,
}

pub async fn set_leverage(
    session: &api::Session,
    parameter: &SetLeverageParameter,
) -> Result<serde_json::Value, ApiResponseError> {
    api::post::<SetLeverageParameter, serde_json::Value>(session, PATH, parameter).await
}
