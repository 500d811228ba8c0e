//! File host configuration loaded from environment variables.
//!
//! All settings have defaults so the host can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use tether_shared::constants::MAX_UPLOAD_SIZE;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:6200`
    pub http_addr: SocketAddr,

    /// Directory where uploaded files are stored, one file per hash.
    /// Env: `FILE_STORAGE_PATH`
    /// Default: `./files`
    pub file_storage_path: PathBuf,

    /// Maximum accepted upload size in bytes.
    /// Env: `MAX_FILE_SIZE`
    pub max_file_size: usize,

    /// Accepted bearer tokens. Empty disables the check.
    /// Env: `AUTH_TOKENS` (comma separated)
    pub auth_tokens: Vec<String>,

    /// Hashes the host refuses to store, with the reason reported back.
    /// Env: `FORBIDDEN_HASHES` (comma separated, `HASH` or `HASH:reason`)
    pub forbidden_hashes: Vec<(String, String)>,

    /// Public base URL advertised as the file server address.
    /// Env: `CDN_BASE_URL`
    pub cdn_base_url: Option<String>,

    /// Whether `/files/upload` accepts uploads. Turning it off leaves only
    /// the munged endpoint, which is what clients see behind filters that
    /// drop plain uploads.
    /// Env: `PLAIN_UPLOAD_ENABLED` (true/false)
    /// Default: `true`
    pub plain_upload_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 6200).into(),
            file_storage_path: PathBuf::from("./files"),
            max_file_size: MAX_UPLOAD_SIZE,
            auth_tokens: Vec::new(),
            forbidden_hashes: Vec::new(),
            cdn_base_url: None,
            plain_upload_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("FILE_STORAGE_PATH") {
            config.file_storage_path = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("MAX_FILE_SIZE") {
            match val.parse::<usize>() {
                Ok(n) => config.max_file_size = n,
                Err(_) => tracing::warn!(value = %val, "Invalid MAX_FILE_SIZE, using default"),
            }
        }

        if let Ok(val) = std::env::var("AUTH_TOKENS") {
            config.auth_tokens = split_list(&val).map(str::to_string).collect();
        }

        if let Ok(val) = std::env::var("FORBIDDEN_HASHES") {
            config.forbidden_hashes = parse_forbidden(&val);
        }

        if let Ok(url) = std::env::var("CDN_BASE_URL") {
            if !url.is_empty() {
                config.cdn_base_url = Some(url);
            }
        }

        if let Ok(val) = std::env::var("PLAIN_UPLOAD_ENABLED") {
            config.plain_upload_enabled = val != "false" && val != "0";
        }

        config
    }

    /// Reason `hash` is forbidden, compared without case.
    pub fn forbidden_reason(&self, hash: &str) -> Option<&str> {
        self.forbidden_hashes
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(hash))
            .map(|(_, reason)| reason.as_str())
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_forbidden(value: &str) -> Vec<(String, String)> {
    split_list(value)
        .map(|entry| match entry.split_once(':') {
            Some((hash, reason)) => (hash.trim().to_string(), reason.trim().to_string()),
            None => (entry.to_string(), "Forbidden by server policy".to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 6200).into());
        assert!(config.auth_tokens.is_empty());
        assert!(config.plain_upload_enabled);
    }

    #[test]
    fn test_parse_forbidden() {
        let parsed = parse_forbidden("AAA:copyrighted, BBB ,");
        assert_eq!(
            parsed,
            vec![
                ("AAA".to_string(), "copyrighted".to_string()),
                ("BBB".to_string(), "Forbidden by server policy".to_string()),
            ]
        );
    }

    #[test]
    fn test_forbidden_reason_ignores_case() {
        let config = ServerConfig {
            forbidden_hashes: parse_forbidden("abc:nope"),
            ..Default::default()
        };
        assert_eq!(config.forbidden_reason("ABC"), Some("nope"));
        assert_eq!(config.forbidden_reason("ABD"), None);
    }
}
