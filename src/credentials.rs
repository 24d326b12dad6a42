use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::api::bybit::auth::ApiCredential;
use crate::config::ConfigError;

#[derive(Deserialize, Debug)]
struct KeyRow {
    botid: String,
    key: String,
    secret: String,
}

#[derive(Deserialize, Debug)]
struct ProxyRow {
    botid: String,
    url: String,
}

/// API keys and proxies of every bot, keyed by bot id.
#[derive(Debug, Default, Clone)]
pub struct CredentialBook {
    keys: HashMap<String, ApiCredential>,
    proxies: HashMap<String, String>,
}

fn reader<R: std::io::Read>(source: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source)
}

impl CredentialBook {
    /// Builds a book from `botid,key,secret` and `botid,url` tables.
    pub fn from_readers<K, P>(keys: K, proxies: Option<P>) -> Result<Self, csv::Error>
    where
        K: std::io::Read,
        P: std::io::Read,
    {
        let mut book = CredentialBook::default();
        for row in reader(keys).deserialize::<KeyRow>() {
            let row = row?;
            book.keys
                .insert(row.botid, ApiCredential::new(&row.key, &row.secret));
        }
        if let Some(proxies) = proxies {
            for row in reader(proxies).deserialize::<ProxyRow>() {
                let row = row?;
                if !row.url.is_empty() {
                    book.proxies.insert(row.botid, row.url);
                }
            }
        }
        Ok(book)
    }

    /// Loads the key table and, when the file exists, the proxy table.
    pub fn load(keys_path: &Path, proxies_path: &Path) -> Result<Self, ConfigError> {
        let keys = fs::File::open(keys_path)
            .map_err(|e| ConfigError::Io(keys_path.to_path_buf(), e))?;
        let proxies = match fs::File::open(proxies_path) {
            Ok(file) => Some(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No proxy table at {}", proxies_path.display());
                None
            }
            Err(e) => return Err(ConfigError::Io(proxies_path.to_path_buf(), e)),
        };
        Self::from_readers(keys, proxies)
            .map_err(|e| ConfigError::Csv(keys_path.to_path_buf(), e))
    }

    pub fn credential(&self, bot_id: &str) -> Option<&ApiCredential> {
        self.keys.get(bot_id)
    }

    pub fn proxy(&self, bot_id: &str) -> Option<&str> {
        self.proxies.get(bot_id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_from_tables() {
        let keys = "botid,key,secret\n1,key1,secret1\n2, key2 ,secret2\n";
        let proxies = "botid,url\n1,http://10.0.0.1:3128\n2,\n";
        let book = CredentialBook::from_readers(keys.as_bytes(), Some(proxies.as_bytes())).unwrap();

        assert_eq!(book.credential("2").unwrap().api_key, "key2");
        assert!(book.credential("3").is_none());
        assert_eq!(book.proxy("1"), Some("http://10.0.0.1:3128"));
        assert_eq!(book.proxy("2"), None);
    }

    #[test]
    fn test_missing_proxy_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys.csv");
        fs::write(&keys_path, "botid,key,secret\n7,k,s\n").unwrap();

        let book = CredentialBook::load(&keys_path, &dir.path().join("proxies.csv")).unwrap();
        assert!(book.credential("7").is_some());
        assert_eq!(book.proxy("7"), None);
    }
}
