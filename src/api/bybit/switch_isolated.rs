use crate::api::bybit::api;
use crate::api::bybit::api::ApiResponseError;
use serde::Serialize;

const PATH: &str = "/v5/position/switch-isolated";

/// "Cross/isolated margin mode is not modified"
pub const ERR_MARGIN_MODE_NOT_MODIFIED: i64 = 110026;

#[derive(Serialize, Debug)]
pub struct SwitchIsolatedParameter {
    pub category: String,
    pub symbol: String,
    /// 0: cross margin, 1: isolated margin
    #[serde(rename = "tradeMode")]
    pub trade_mode: u8,
    #[serde(rename = "buyLeverage")]
    pub buy_leverage: String,
    #[serde(rename = "sellLeverage")]
    pub sell_leverage: String,
}

pub async fn switch_isolated(
    session: &api::Session,
    parameter: &SwitchIsolatedParameter,
) -> Result<serde_json::Value, ApiResponseError> {
    api::post::<SwitchIsolatedParameter, serde_json::Value>(session, PATH, parameter).await
}
