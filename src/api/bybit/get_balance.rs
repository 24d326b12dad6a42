use crate::api::bybit::api;
use crate::api::bybit::api::{deserialize_f64_or_zero, ApiResponseError};
use serde::Deserialize;
use std::collections::HashMap;

const PATH: &str = "/v5/account/wallet-balance";

const ACCOUNT_TYPE: &str = "CONTRACT";

#[derive(Deserialize, Debug, Clone)]
pub struct CoinBalance {
    pub coin: String,

    #[serde(rename = "walletBalance", deserialize_with = "deserialize_f64_or_zero")]
    pub wallet_balance: f64,

    #[serde(rename = "availableToWithdraw", deserialize_with = "deserialize_f64_or_zero")]
    pub available_to_withdraw: f64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AccountBalance {
    #[serde(rename = "accountType", default)]
    pub account_type: String,
    pub coin: Vec<CoinBalance>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BalanceResult {
    pub list: Vec<AccountBalance>,
}

pub async fn get_balance(
    session: &api::Session,
    coin: &str,
) -> Result<BalanceResult, ApiResponseError> {
    let mut params = HashMap::new();
    params.insert("accountType".to_string(), ACCOUNT_TYPE.to_string());
    params.insert("coin".to_string(), coin.to_string());
    api::get::<BalanceResult>(session, PATH, &params).await
}

/// Free (withdrawable) balance of `coin`; 0 when the account holds none.
pub fn free_balance(result: &BalanceResult, coin: &str) -> f64 {
    result
        .list
        .iter()
        .flat_map(|account| account.coin.iter())
        .find(|c| c.coin == coin)
        .map(|c| c.available_to_withdraw)
        .unwrap_or(0.0)
}
