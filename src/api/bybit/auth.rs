use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ring::hmac;

pub const RECV_WINDOW: &str = "5000";

/// API key pair of one bot.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredential {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

// keep the secret out of logs
impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .finish()
    }
}

#[derive(Debug)]
pub enum CredentialError {
    EmptyKey,
    Clock(std::time::SystemTimeError),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::EmptyKey => write!(f, "api key or secret is empty"),
            CredentialError::Clock(e) => write!(f, "system clock error: {}", e),
        }
    }
}

/// Builds the signed authentication headers for one request.
///
/// `payload` is the query string for GET requests and the JSON body for POST
/// requests, exactly as sent.
pub fn get_credential(
    credential: &ApiCredential,
    payload: &str,
) -> Result<HashMap<String, String>, CredentialError> {
    if credential.api_key.is_empty() || credential.api_secret.is_empty() {
        return Err(CredentialError::EmptyKey);
    }

    let timestamp = get_timestamp()?;
    let sign = get_access_sign(
        &credential.api_key,
        &credential.api_secret,
        timestamp,
        RECV_WINDOW,
        payload,
    );

    let mut map = HashMap::new();

    map.insert("X-BAPI-API-KEY".to_string(), credential.api_key.clone());
    map.insert("X-BAPI-TIMESTAMP".to_string(), timestamp.to_string());
    map.insert("X-BAPI-RECV-WINDOW".to_string(), RECV_WINDOW.to_string());
    map.insert("X-BAPI-SIGN".to_string(), sign);

    Ok(map)
}

fn get_timestamp() -> Result<u64, CredentialError> {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(CredentialError::Clock)?;

    Ok(since_epoch.as_secs() * 1000 + since_epoch.subsec_millis() as u64)
}

fn get_access_sign(
    api_key: &str,
    secret: &str,
    timestamp: u64,
    recv_window: &str,
    payload: &str,
) -> String {
    let data = format!("{}{}{}{}", timestamp, api_key, recv_window, payload);
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let signature = hmac::sign(&key, data.as_bytes());
    hex::encode(signature.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_rejects_empty_key() {
        let credential = ApiCredential::new("", "secret");
        assert!(matches!(
            get_credential(&credential, ""),
            Err(CredentialError::EmptyKey)
        ));
    }

    #[test]
    fn test_credential_headers() {
        let credential = ApiCredential::new("key", "secret");
        let headers = get_credential(&credential, "category=linear").unwrap();

        assert_eq!(headers["X-BAPI-API-KEY"], "key");
        assert_eq!(headers["X-BAPI-RECV-WINDOW"], RECV_WINDOW);
        assert_eq!(headers["X-BAPI-SIGN"].len(), 64);
        assert!(headers["X-BAPI-TIMESTAMP"].parse::<u64>().is_ok());
    }

    #[test]
    fn test_access_sign_produces_hex() {
        let sign = get_access_sign("key", "test_secret", 1234567890000, "5000", "");

        // SHA256のHex文字列は64文字
        assert_eq!(sign.len(), 64);
        assert!(sign.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_access_sign_consistent() {
        let sign1 = get_access_sign("key", "secret", 1234567890000, "5000", "{}");
        let sign2 = get_access_sign("key", "secret", 1234567890000, "5000", "{}");

        assert_eq!(sign1, sign2);
    }

    #[test]
    fn test_access_sign_different_with_different_params() {
        let sign1 = get_access_sign("key", "secret", 1234567890000, "5000", "");
        let sign2 = get_access_sign("key", "secret", 1234567890001, "5000", "");

        assert_ne!(sign1, sign2);
    }

    #[test]
    fn test_debug_hides_secret() {
        let credential = ApiCredential::new("key", "very-secret");
        let printed = format!("{:?}", credential);
        assert!(printed.contains("key"));
        assert!(!printed.contains("very-secret"));
    }
}
