//! Load daemon config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use lanshare_core::ServiceConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/lanshare/config.toml or /etc/lanshare/config.toml.
/// Env overrides: LANSHARE_DISCOVERY_PORT, LANSHARE_DATA_PORT, LANSHARE_GROUP,
/// LANSHARE_DOWNLOAD_DIR, LANSHARE_IDENTITY.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Engine settings, `[service]` table.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Incoming files are accepted into this directory. Without it every offer is rejected.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Where the instance identity is kept (default ~/.config/lanshare/identity.toml).
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
}

impl Config {
    pub fn identity_path(&self) -> PathBuf {
        self.identity_path.clone().unwrap_or_else(|| {
            config_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib/lanshare"))
                .join("identity.toml")
        })
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c.service.validate().context("checking [service] settings")?;
    Ok(c)
}

fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/lanshare"))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(dir) = config_dir() {
        out.push(dir.join("config.toml"));
    }
    out.push(PathBuf::from("/etc/lanshare/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("LANSHARE_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.service.discovery_port = p;
    }
    if let Some(p) = var("LANSHARE_DATA_PORT").and_then(|s| s.parse().ok()) {
        c.service.data_port = p;
    }
    if let Some(g) = var("LANSHARE_GROUP").and_then(|s| s.parse().ok()) {
        c.service.group = g;
    }
    if let Some(d) = var("LANSHARE_DOWNLOAD_DIR") {
        c.download_dir = Some(PathBuf::from(d));
    }
    if let Some(p) = var("LANSHARE_IDENTITY") {
        c.identity_path = Some(PathBuf::from(p));
    }
}
