//! Startup-phase configuration, read once from the process environment.
//! Every collaborator that needs a setting receives it by reference or
//! value from the `Config` built here; nothing else calls `std::env`.

use std::path::PathBuf;
use std::time::Duration;

use knowbase_core::error::{KbError, KbResult};
use knowbase_pipeline::SectionReaderConfig;

const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_FILE_STORAGE_BASE_PATH: &str = "./data/blobs";
const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_EMBEDDING_MODEL: &str = "nomic-embed-text";
const DEFAULT_OLLAMA_CHAT_MODEL: &str = "llama3";
const DEFAULT_UPLOAD_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Startup-phase configuration (spec §6's configuration key table, §0.1).
///
/// `postgres_connection_string` and `jwt_signing_secret` are opaque
/// passthroughs: this workspace's reference storage adapter is sqlite
/// (§0.3) and it issues no JWTs of its own, but both keys are part of the
/// external contract and are threaded through unread.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_file_size_bytes: u64,
    pub file_storage_base_path: PathBuf,
    pub postgres_connection_string: String,
    pub jwt_signing_secret: String,
    pub ollama_base_url: String,
    pub ollama_api_key: Option<String>,
    pub ollama_embedding_model: String,
    pub ollama_chat_model: String,
    pub section: SectionReaderConfig,
    pub upload_session_ttl: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> KbResult<u64> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|e| KbError::input_invalid(format!("{key} must be a non-negative integer: {e}"))),
    }
}

impl Config {
    /// Reads every configuration key from the environment, applying the
    /// documented defaults, and fails fast with `KbError::InputInvalid`
    /// (never panics) on a malformed numeric value.
    pub fn from_env() -> KbResult<Self> {
        Ok(Self {
            max_file_size_bytes: env_u64("MAX_FILE_SIZE_BYTES", DEFAULT_MAX_FILE_SIZE_BYTES)?,
            file_storage_base_path: PathBuf::from(env_or(
                "FILE_STORAGE_BASE_PATH",
                DEFAULT_FILE_STORAGE_BASE_PATH,
            )),
            postgres_connection_string: env_or("POSTGRES_CONNECTION_STRING", ""),
            jwt_signing_secret: env_or("JWT_SIGNING_SECRET", ""),
            ollama_base_url: env_or("OLLAMA_BASE_URL", DEFAULT_OLLAMA_BASE_URL),
            ollama_api_key: env_opt("OLLAMA_API_KEY"),
            ollama_embedding_model: env_or("OLLAMA_EMBEDDING_MODEL", DEFAULT_OLLAMA_EMBEDDING_MODEL),
            ollama_chat_model: env_or("OLLAMA_CHAT_MODEL", DEFAULT_OLLAMA_CHAT_MODEL),
            section: SectionReaderConfig::default(),
            upload_session_ttl: DEFAULT_UPLOAD_SESSION_TTL,
        })
    }

    /// Path to the sqlite database file backing both `KnowledgeStore` and
    /// `LibraryStore`. Not an independent configuration key (spec §6 only
    /// names `POSTGRES_CONNECTION_STRING`, an external contract this
    /// sqlite-backed reference adapter doesn't consume); derived from
    /// `file_storage_base_path` so the two on-disk roots stay together.
    pub fn sqlite_db_path(&self) -> PathBuf {
        self.file_storage_base_path.join("knowbase.sqlite3")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_no_environment_overrides_when_loading_then_defaults_apply() {
        // SAFETY: test runs single-threaded with respect to these keys and
        // restores them before returning.
        let keys = ["MAX_FILE_SIZE_BYTES", "FILE_STORAGE_BASE_PATH", "OLLAMA_BASE_URL"];
        for key in keys {
            std::env::remove_var(key);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_file_size_bytes, DEFAULT_MAX_FILE_SIZE_BYTES);
        assert_eq!(config.file_storage_base_path, PathBuf::from(DEFAULT_FILE_STORAGE_BASE_PATH));
        assert_eq!(config.ollama_base_url, DEFAULT_OLLAMA_BASE_URL);
        assert!(config.ollama_api_key.is_none());
    }

    #[test]
    fn given_malformed_max_file_size_when_loading_then_input_invalid_not_panic() {
        std::env::set_var("MAX_FILE_SIZE_BYTES", "not-a-number");
        let result = Config::from_env();
        std::env::remove_var("MAX_FILE_SIZE_BYTES");

        let error = result.unwrap_err();
        assert_eq!(error.kind(), knowbase_core::error::KbErrorKind::InputInvalid);
    }

    #[test]
    fn given_sqlite_db_path_when_derived_then_it_sits_under_storage_root() {
        let mut config = Config::from_env().unwrap();
        config.file_storage_base_path = PathBuf::from("/tmp/kb-data");
        assert_eq!(config.sqlite_db_path(), PathBuf::from("/tmp/kb-data/knowbase.sqlite3"));
    }
}
