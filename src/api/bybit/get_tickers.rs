use crate::api::bybit::api;
use crate::api::bybit::api::{deserialize_number_from_string, ApiResponseError};
use serde::Deserialize;
use std::collections::HashMap;

const PATH: &str = "/v5/market/tickers";

#[derive(Debug, Deserialize, Clone)]
pub struct Ticker {
    pub symbol: String,

    #[serde(rename = "lastPrice", deserialize_with = "deserialize_number_from_string")]
    pub last_price: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TickerResult {
    pub list: Vec<Ticker>,
}

pub async fn get_tickers(
    session: &api::Session,
    symbol: &str,
) -> Result<TickerResult, ApiResponseError> {
    let mut params = HashMap::new();
    params.insert("category".to_string(), api::CATEGORY.to_string());
    params.insert("symbol".to_string(), symbol.to_string());
    api::get_public::<TickerResult>(session, PATH, &params).await
}

/// Price of the most recent trade.
pub async fn get_last_price(session: &api::Session, symbol: &str) -> Result<f64, ApiResponseError> {
    let result = get_tickers(session, symbol).await?;
    result
        .list
        .into_iter()
        .find(|t| t.symbol == symbol)
        .map(|t| t.last_price)
        .ok_or_else(|| ApiResponseError::EmptyResult(PATH.to_string()))
}
