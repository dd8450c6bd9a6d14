//! Configuration loading.
//!
//! Settings are layered: built-in defaults, then an optional JSON file, then
//! environment variables. Command-line flags are applied on top by the binary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BIND, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_HANDSHAKE_BYTES,
    DEFAULT_OUTBOUND_HIGH_WATER, DEFAULT_PORT, FRAME_PREFIX_LEN, ROOT_CHANNEL,
};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CHANPROXY_CONFIG";

/// Configuration for the proxy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address to listen on.
    pub bind: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Preconfigured server token per channel name.
    pub channels: BTreeMap<String, String>,
    /// Largest accepted frame `totalLength`.
    pub max_frame_bytes: u32,
    /// Largest handshake head buffered before giving up.
    pub max_handshake_bytes: usize,
    /// Queued outbound bytes above which deliveries are logged as backpressure.
    pub outbound_high_water: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            channels: BTreeMap::from([(ROOT_CHANNEL.to_string(), String::new())]),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_handshake_bytes: DEFAULT_MAX_HANDSHAKE_BYTES,
            outbound_high_water: DEFAULT_OUTBOUND_HIGH_WATER,
        }
    }
}

impl Config {
    /// Platform config directory for chanproxy (e.g. `~/.config/chanproxy`).
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chanproxy"))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// File selection: `explicit`, else `CHANPROXY_CONFIG`, else
    /// `config.json` in [`Config::config_dir`] if it exists. With no file the
    /// defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .or_else(|| {
                Self::config_dir()
                    .map(|dir| dir.join("config.json"))
                    .filter(|path| path.exists())
            });

        let mut config = match path {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a JSON config file; missing keys take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.ensure_root_channel();
        Ok(config)
    }

    /// Apply `PORT`, `CHANPROXY_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        // CHANPROXY_PORT wins over the generic PORT.
        for key in ["PORT", "CHANPROXY_PORT"] {
            if let Some(port) = lookup(key) {
                self.port = port
                    .parse()
                    .with_context(|| format!("{key} is not a port: {port:?}"))?;
            }
        }

        if let Some(bind) = lookup("CHANPROXY_BIND") {
            self.bind = bind;
        }

        if let Some(channels) = lookup("CHANPROXY_CHANNELS") {
            for entry in channels.split(',').filter(|e| !e.trim().is_empty()) {
                let (name, token) = parse_channel(entry.trim())
                    .context("CHANPROXY_CHANNELS must be name=token pairs")?;
                self.channels.insert(name, token);
            }
        }

        if let Some(max) = lookup("CHANPROXY_MAX_FRAME_BYTES") {
            self.max_frame_bytes = max
                .parse()
                .with_context(|| format!("CHANPROXY_MAX_FRAME_BYTES is not a number: {max:?}"))?;
        }

        Ok(())
    }

    /// Check limits and channel names.
    pub fn validate(&self) -> Result<()> {
        if (self.max_frame_bytes as usize) < FRAME_PREFIX_LEN {
            anyhow::bail!(
                "max_frame_bytes must be at least {FRAME_PREFIX_LEN}, got {}",
                self.max_frame_bytes
            );
        }
        if self.max_handshake_bytes == 0 {
            anyhow::bail!("max_handshake_bytes must be positive");
        }
        if self.channels.keys().any(String::is_empty) {
            anyhow::bail!("channel names must not be empty");
        }
        Ok(())
    }

    fn ensure_root_channel(&mut self) {
        self.channels.entry(ROOT_CHANNEL.to_string()).or_default();
    }
}

/// Parse a `name=token` pair. The token may be empty.
pub fn parse_channel(entry: &str) -> Result<(String, String)> {
    let (name, token) = entry
        .split_once('=')
        .with_context(|| format!("expected NAME=TOKEN, got {entry:?}"))?;
    if name.is_empty() {
        anyhow::bail!("empty channel name in {entry:?}");
    }
    Ok((name.to_string(), token.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 80);
        assert_eq!(config.channels.get("/"), Some(&String::new()));
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_fills_defaults_and_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"port": 9000, "channels": {"/room": "tok"}}"#).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.channels.get("/room").map(String::as_str), Some("tok"));
        assert_eq!(config.channels.get("/").map(String::as_str), Some(""));
    }

    #[test]
    fn test_load_explicit_path_errors_mention_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope.json");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(format!("{err:#}").contains("nope.json"));

        let bad = tmp.path().join("bad.json");
        fs::write(&bad, "{not json").unwrap();
        assert!(Config::load_from_file(&bad).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(env(&[
                ("PORT", "8080"),
                ("CHANPROXY_PORT", "8081"),
                ("CHANPROXY_BIND", "127.0.0.1"),
                ("CHANPROXY_CHANNELS", "/a=one, /b=,/=root"),
                ("CHANPROXY_MAX_FRAME_BYTES", "1024"),
            ]))
            .unwrap();

        assert_eq!(config.port, 8081);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.channels.get("/a").map(String::as_str), Some("one"));
        assert_eq!(config.channels.get("/b").map(String::as_str), Some(""));
        assert_eq!(config.channels.get("/").map(String::as_str), Some("root"));
        assert_eq!(config.max_frame_bytes, 1024);
    }

    #[test]
    fn test_env_overrides_reject_garbage() {
        let mut config = Config::default();
        assert!(config.apply_env_overrides(env(&[("PORT", "eighty")])).is_err());
        assert!(config
            .apply_env_overrides(env(&[("CHANPROXY_CHANNELS", "missing-equals")]))
            .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let tiny = Config {
            max_frame_bytes: 7,
            ..Config::default()
        };
        assert!(tiny.validate().is_err());

        let no_handshake = Config {
            max_handshake_bytes: 0,
            ..Config::default()
        };
        assert!(no_handshake.validate().is_err());

        let mut unnamed = Config::default();
        unnamed.channels.insert(String::new(), "x".to_string());
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_parse_channel() {
        assert_eq!(
            parse_channel("/room=tok").unwrap(),
            ("/room".to_string(), "tok".to_string())
        );
        assert_eq!(parse_channel("/room=").unwrap().1, "");
        assert!(parse_channel("=tok").is_err());
        assert!(parse_channel("/room").is_err());
    }
}
