use crate::api::bybit::auth::{get_credential, ApiCredential, CredentialError};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error};

pub const MAINNET_ENDPOINT: &str = "https://api.bybit.com";
pub const TESTNET_ENDPOINT: &str = "https://api-testnet.bybit.com";

/// USDT perpetual contracts.
pub const CATEGORY: &str = "linear";

pub fn deserialize_number_from_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let s = String::deserialize(deserializer)?;
    T::from_str(&s).map_err(serde::de::Error::custom)
}

/// Like `deserialize_number_from_string`, but an empty string reads as 0.
/// The exchange sends "" for unset stop-loss and for flat positions.
pub fn deserialize_f64_or_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s.trim().is_empty() {
        return Ok(0.0);
    }
    s.trim().parse::<f64>().map_err(serde::de::Error::custom)
}

#[derive(Debug)]
pub enum ApiResponseError {
    Credential(CredentialError),
    Reqwest(reqwest::Error),
    StatusCode(StatusCode),
    UrlParse(url::ParseError),
    Json(serde_json::Error),
    /// Non-zero `retCode` in the response envelope.
    Api { code: i64, message: String },
    EmptyResult(String),
    UnknownSymbol(String),
}

impl ApiResponseError {
    pub fn api_code(&self) -> Option<i64> {
        match self {
            ApiResponseError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ApiResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiResponseError::Credential(e) => write!(f, "credential error: {}", e),
            ApiResponseError::Reqwest(e) => write!(f, "http error: {}", e),
            ApiResponseError::StatusCode(s) => write!(f, "unexpected http status {}", s),
            ApiResponseError::UrlParse(e) => write!(f, "invalid url: {}", e),
            ApiResponseError::Json(e) => write!(f, "invalid json: {}", e),
            ApiResponseError::Api { code, message } => {
                write!(f, "exchange error {}: {}", code, message)
            }
            ApiResponseError::EmptyResult(path) => write!(f, "empty result from {}", path),
            ApiResponseError::UnknownSymbol(pair) => write!(f, "unknown market {}", pair),
        }
    }
}

impl From<CredentialError> for ApiResponseError {
    fn from(error: CredentialError) -> Self {
        ApiResponseError::Credential(error)
    }
}

impl From<serde_json::Error> for ApiResponseError {
    fn from(error: serde_json::Error) -> Self {
        ApiResponseError::Json(error)
    }
}

impl From<StatusCode> for ApiResponseError {
    fn from(e: StatusCode) -> ApiResponseError {
        ApiResponseError::StatusCode(e)
    }
}

impl From<reqwest::Error> for ApiResponseError {
    fn from(e: reqwest::Error) -> ApiResponseError {
        ApiResponseError::Reqwest(e)
    }
}

impl From<url::ParseError> for ApiResponseError {
    fn from(e: url::ParseError) -> ApiResponseError {
        ApiResponseError::UrlParse(e)
    }
}

#[derive(Deserialize, Debug)]
struct Envelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

/// Connection state shared by every endpoint call of one bot.
#[derive(Debug, Clone)]
pub struct Session {
    pub client: reqwest::Client,
    pub endpoint: String,
    pub credential: ApiCredential,
}

impl Session {
    pub fn new(client: reqwest::Client, testnet: bool, credential: ApiCredential) -> Self {
        let endpoint = if testnet { TESTNET_ENDPOINT } else { MAINNET_ENDPOINT };
        Self {
            client,
            endpoint: endpoint.to_string(),
            credential,
        }
    }
}

fn parse_envelope<T: serde::de::DeserializeOwned>(
    path: &str,
    response_text: &str,
) -> Result<T, ApiResponseError> {
    let envelope: Envelope<T> = serde_json::from_str(response_text)?;
    if envelope.ret_code != 0 {
        return Err(ApiResponseError::Api {
            code: envelope.ret_code,
            message: envelope.ret_msg,
        });
    }
    envelope
        .result
        .ok_or_else(|| ApiResponseError::EmptyResult(path.to_string()))
}

async fn handle_response<T: serde::de::DeserializeOwned + std::fmt::Debug>(
    path: &str,
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, ApiResponseError> {
    let response = response?;
    let status = response.status();
    let response_text = response.text().await?;

    debug!("API response {}: {}", path, response_text);

    if !status.is_success() {
        let error = ApiResponseError::from(status);
        error!("API error: {:?}", error);
        return Err(error);
    }

    parse_envelope(path, &response_text)
}

pub async fn get<T: serde::de::DeserializeOwned + std::fmt::Debug>(
    session: &Session,
    path: &str,
    query: &HashMap<String, String>,
) -> Result<T, ApiResponseError> {
    let url_str = format!("{}{}", session.endpoint, path);
    let url = Url::parse_with_params(&url_str, query)?;
    let payload = url.query().unwrap_or_default().to_string();
    let header = make_http_header(&session.credential, &payload)?;

    let get = session.client.get(url).headers(header).send().await;
    handle_response(path, get).await
}

/// Unauthenticated GET for market data.
pub async fn get_public<T: serde::de::DeserializeOwned + std::fmt::Debug>(
    session: &Session,
    path: &str,
    query: &HashMap<String, String>,
) -> Result<T, ApiResponseError> {
    let url_str = format!("{}{}", session.endpoint, path);
    let url = Url::parse_with_params(&url_str, query)?;

    let get = session.client.get(url).send().await;
    handle_response(path, get).await
}

pub async fn post<T: serde::Serialize, U: serde::de::DeserializeOwned + std::fmt::Debug>(
    session: &Session,
    path: &str,
    body: &T,
) -> Result<U, ApiResponseError> {
    let url_str = format!("{}{}", session.endpoint, path);
    let url = Url::parse(&url_str)?;
    let body_json = serde_json::to_string(body)?;
    let header = make_http_header(&session.credential, &body_json)?;

    let post = session
        .client
        .post(url)
        .headers(header)
        .body(body_json)
        .send()
        .await;
    handle_response(path, post).await
}

fn make_http_header(
    credential: &ApiCredential,
    payload: &str,
) -> Result<HeaderMap, ApiResponseError> {
    let mut header = HeaderMap::new();
    let signed = get_credential(credential, payload)?;

    header.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (k, v) in signed {
        // header names are constants and values are ascii key/hex/digits
        let (Ok(key), Ok(val)) = (k.parse::<HeaderName>(), v.parse::<HeaderValue>()) else {
            return Err(ApiResponseError::Credential(CredentialError::EmptyKey));
        };
        header.insert(key, val);
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_envelope_success() {
        let text = r#"{"retCode":0,"retMsg":"OK","result":{"a":1},"time":1}"#;
        let value: Value = parse_envelope("/v5/x", text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_envelope_error_code() {
        let text = r#"{"retCode":110043,"retMsg":"leverage not modified","result":{}}"#;
        let err = parse_envelope::<Value>("/v5/position/set-leverage", text).unwrap_err();
        assert_eq!(err.api_code(), Some(110043));
        assert!(err.to_string().contains("leverage not modified"));
    }

    #[test]
    fn test_envelope_missing_result() {
        let text = r#"{"retCode":0,"retMsg":"OK"}"#;
        let err = parse_envelope::<Value>("/v5/x", text).unwrap_err();
        assert!(matches!(err, ApiResponseError::EmptyResult(_)));
    }

    #[derive(Deserialize, Debug)]
    struct Numbers {
        #[serde(deserialize_with = "deserialize_f64_or_zero")]
        stop: f64,
        #[serde(deserialize_with = "deserialize_number_from_string")]
        size: f64,
    }

    #[test]
    fn test_number_deserializers() {
        let n: Numbers = serde_json::from_str(r#"{"stop":"","size":"1.5"}"#).unwrap();
        assert_eq!(n.stop, 0.0);
        assert_eq!(n.size, 1.5);

        let n: Numbers = serde_json::from_str(r#"{"stop":"95.5","size":"0"}"#).unwrap();
        assert_eq!(n.stop, 95.5);
    }

    #[test]
    fn test_session_endpoint() {
        let client = reqwest::Client::new();
        let s = Session::new(client.clone(), true, ApiCredential::new("k", "s"));
        assert_eq!(s.endpoint, TESTNET_ENDPOINT);
        let s = Session::new(client, false, ApiCredential::new("k", "s"));
        assert_eq!(s.endpoint, MAINNET_ENDPOINT);
    }
}
