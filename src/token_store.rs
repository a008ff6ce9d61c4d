use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::TokenStoreError;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TokenPair {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenPair {
    /// Access token if present and non-empty.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// The single JSON file that survives restarts.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<TokenPair>, TokenStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Overwrites the file in full. Writes a sibling file first and renames it
    /// so a crash never leaves a truncated token file behind.
    pub fn save(&self, tokens: &TokenPair) -> Result<(), TokenStoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec(tokens)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved tokens to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_tokens() -> TokenPair {
        TokenPair {
            access_token: Some("access".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_in: Some(3600),
            token_type: Some("Bearer".to_string()),
        }
    }

    #[test]
    fn test_load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));

        store.save(&create_test_tokens()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, create_test_tokens());
        assert!(!dir.path().join("tokens.json.tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_pair() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));

        store.save(&create_test_tokens()).unwrap();
        let newer = TokenPair {
            access_token: Some("newer".to_string()),
            ..TokenPair::default()
        };
        store.save(&newer).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token(), Some("newer"));
        assert_eq!(loaded.refresh_token(), None);
    }

    #[test]
    fn test_load_accepts_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, r#"{"refresh_token": "only-refresh"}"#).unwrap();

        let loaded = TokenStore::new(&path).load().unwrap().unwrap();
        assert_eq!(loaded.access_token(), None);
        assert_eq!(loaded.refresh_token(), Some("only-refresh"));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, "not json").unwrap();

        let result = TokenStore::new(&path).load();
        assert!(matches!(result, Err(TokenStoreError::Json(_))));
    }

    #[test]
    fn test_empty_access_token_counts_as_missing() {
        let tokens = TokenPair {
            access_token: Some(String::new()),
            ..TokenPair::default()
        };
        assert_eq!(tokens.access_token(), None);
    }
}
