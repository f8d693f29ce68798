//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

/// Host configuration. File: ~/.config/handoff/config.toml or /etc/handoff/config.toml.
/// Env overrides: HANDOFF_PORT, HANDOFF_NAME, HANDOFF_DOWNLOAD_DIR, HANDOFF_AUTO_ACCEPT,
/// HANDOFF_MAX_FILE_SIZE. Command-line flags are applied last, in `main`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port for `listen` (default 45680).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name announced to the peer.
    #[serde(default = "default_name")]
    pub name: String,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Accept every incoming offer without asking.
    #[serde(default)]
    pub auto_accept: bool,
    /// Largest incoming file, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_port() -> u16 {
    45680
}
fn default_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "handoff".to_string())
}
fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join("Downloads"),
        None => PathBuf::from("."),
    }
}
fn default_max_file_size() -> u64 {
    handoff_core::config::DEFAULT_MAX_FILE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            name: default_name(),
            download_dir: default_download_dir(),
            auto_accept: false,
            max_file_size: default_max_file_size(),
        }
    }
}

impl Config {
    /// Session settings derived from the host config.
    pub fn session_config(&self) -> handoff_core::Config {
        handoff_core::Config {
            max_file_size: self.max_file_size,
            ..handoff_core::Config::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match find_file() {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

/// Overlay environment values. Unparseable values are logged and skipped.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("HANDOFF_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring HANDOFF_PORT"),
        }
    }
    if let Some(s) = var("HANDOFF_NAME") {
        if !s.trim().is_empty() {
            c.name = s.trim().to_string();
        }
    }
    if let Some(s) = var("HANDOFF_DOWNLOAD_DIR") {
        if !s.is_empty() {
            c.download_dir = PathBuf::from(s);
        }
    }
    if let Some(s) = var("HANDOFF_AUTO_ACCEPT") {
        match parse_bool(&s) {
            Some(b) => c.auto_accept = b,
            None => warn!(value = %s, "ignoring HANDOFF_AUTO_ACCEPT"),
        }
    }
    if let Some(s) = var("HANDOFF_MAX_FILE_SIZE") {
        match s.parse::<u64>() {
            Ok(n) => c.max_file_size = n,
            Err(_) => warn!(value = %s, "ignoring HANDOFF_MAX_FILE_SIZE"),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/handoff/config.toml"));
    }
    out.push(PathBuf::from("/etc/handoff/config.toml"));
    out
}

/// First existing config file wins; later paths are not consulted.
fn find_file() -> Option<PathBuf> {
    config_paths().into_iter().find(|p| p.exists())
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    debug!(path = %path.display(), "loading config");
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c = parse("port = 9000\nauto_accept = true\n").unwrap();
        assert_eq!(c.port, 9000);
        assert!(c.auto_accept);
        assert_eq!(c.max_file_size, handoff_core::config::DEFAULT_MAX_FILE_SIZE);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = parse("port = 9000\nname = \"desk\"\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("HANDOFF_PORT", "9100"),
            ("HANDOFF_NAME", " laptop "),
            ("HANDOFF_AUTO_ACCEPT", "yes"),
            ("HANDOFF_MAX_FILE_SIZE", "1024"),
            ("HANDOFF_DOWNLOAD_DIR", "/tmp/in"),
        ]
        .into_iter()
        .collect();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.port, 9100);
        assert_eq!(c.name, "laptop");
        assert!(c.auto_accept);
        assert_eq!(c.max_file_size, 1024);
        assert_eq!(c.download_dir, PathBuf::from("/tmp/in"));
        assert_eq!(c.session_config().max_file_size, 1024);
    }

    #[test]
    fn bad_env_values_ignored() {
        let mut c = parse("port = 9000\n").unwrap();
        apply_env(&mut c, |k| match k {
            "HANDOFF_PORT" => Some("not-a-port".into()),
            "HANDOFF_AUTO_ACCEPT" => Some("maybe".into()),
            _ => None,
        });
        assert_eq!(c.port, 9000);
        assert!(!c.auto_accept);
    }
}
