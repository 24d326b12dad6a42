use crate::api::bybit::api;
use crate::api::bybit::api::ApiResponseError;
use serde::Serialize;

const PATH: &str = "/v5/order/cancel-all";

#[derive(Serialize, Debug)]
pub struct CancelAllParameter {
    pub category: String,
    pub symbol: String,
    /// "StopOrder" restricts the cancel to conditional orders.
    #[serde(rename = "orderFilter")]
    pub order_filter: String,
}

pub async fn cancel_all_orders(
    session: &api::Session,
    parameter: &CancelAllParameter,
) -> Result<serde_json::Value, ApiResponseError> {
    api::post::<CancelAllParameter, serde_json::Value>(session, PATH, parameter).await
}
