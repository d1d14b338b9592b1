//! Local node configuration
//!
//! A short list of well-known paths is searched for a line-oriented
//! `KEY=VALUE` file with `#` comments. Every key is also accepted through a
//! `NXPROXY_<KEY>` environment variable, which takes precedence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "NXPROXY_";

const CONFIG_PATHS: &[&str] = &[
    "/etc/nx-proxy/nx-proxy.conf",
    "~/nx-proxy.conf",
    "./nx-proxy.conf",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid url scheme: {0}")]
    InvalidUrlScheme(String),

    #[error("invalid url host")]
    InvalidUrlHost,
}

pub type ConfigEntries = HashMap<String, String>;

/// Loads the first config file found, returning its entries and location
pub fn load_config_file() -> Option<(ConfigEntries, PathBuf)> {
    for entry in CONFIG_PATHS {
        let path = expand_home(entry);
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some((parse_entries(&content), path));
        }
    }

    None
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }

    PathBuf::from(path)
}

pub fn parse_entries(content: &str) -> ConfigEntries {
    let mut entries = ConfigEntries::new();

    for line in content.lines() {
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim();
        let val = val.trim();

        if key.is_empty() || key.starts_with('#') || val.is_empty() {
            continue;
        }

        entries.insert(key.to_uppercase(), val.to_string());
    }

    entries
}

/// Option lookup: environment first, then the config file
pub fn get_opt(entries: Option<&ConfigEntries>, name: &str) -> Option<String> {
    let name = name.to_uppercase();

    if let Ok(val) = std::env::var(format!("{ENV_PREFIX}{name}")) {
        if !val.is_empty() {
            return Some(val);
        }
    }

    entries.and_then(|map| map.get(&name).cloned())
}

pub fn is_true(val: &str) -> bool {
    val.eq_ignore_ascii_case("true")
}

/// Validates the backend base URL: http(s) scheme, host required
pub fn parse_auth_url(val: &str) -> Result<reqwest::Url, ConfigError> {
    let url = reqwest::Url::parse(val).map_err(|err| ConfigError::InvalidUrl(err.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(ConfigError::InvalidUrlScheme(scheme.to_string())),
    }

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrlHost);
    }

    Ok(url)
}
