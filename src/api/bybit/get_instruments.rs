use crate::api::bybit::api;
use crate::api::bybit::api::ApiResponseError;
use serde::Deserialize;
use std::collections::HashMap;

const PATH: &str = "/v5/market/instruments-info";

#[derive(Debug, Deserialize, Clone)]
pub struct Instrument {
    pub symbol: String,
    #[serde(rename = "baseCoin")]
    pub base_coin: String,
    #[serde(rename = "quoteCoin")]
    pub quote_coin: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstrumentResult {
    pub list: Vec<Instrument>,
}

pub async fn get_instruments(
    session: &api::Session,
    symbol: &str,
) -> Result<InstrumentResult, ApiResponseError> {
    let mut params = HashMap::new();
    params.insert("category".to_string(), api::CATEGORY.to_string());
    params.insert("symbol".to_string(), symbol.to_string());
    api::get_public::<InstrumentResult>(session, PATH, &params).await
}

/// Maps a signal pair (`BTC/USDT`, `BTC/USDT:USDT`, `btcusdt`) to the
/// exchange's symbol id.
pub fn normalize_pair(pair: &str) -> String {
    let upper = pair.trim().to_uppercase();
    let unified = upper.split(':').next().unwrap_or_default();
    unified.chars().filter(|c| *c != '/' && *c != '-').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pair() {
        assert_eq!(normalize_pair("BTC/USDT"), "BTCUSDT");
        assert_eq!(normalize_pair("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(normalize_pair("ethusdt"), "ETHUSDT");
        assert_eq!(normalize_pair(" SOL-USDT "), "SOLUSDT");
    }
}
