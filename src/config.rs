use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub peering: Peering,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.upstream.mirror_url.trim().is_empty() {
            return Err(anyhow!("upstream.mirror_url is required"));
        }
        self.cache.limits()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for Server {
    fn default() -> Self {
        Self { addr: default_addr() }
    }
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            mirror_url: default_mirror_url(),
            insecure_skip_verify: false,
            timeout: default_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Cache {
    #[serde(default = "default_block_size")]
    pub block_size: String,
    #[serde(default = "default_max_memory")]
    pub max_memory_usage: String,
    #[serde(default = "default_max_disk")]
    pub max_disk_usage: String,
    #[serde(default = "default_cleaned_disk")]
    pub cleaned_disk_usage: String,
    #[serde(default = "default_disk_dir")]
    pub disk_cache_dir: String,
    #[serde(default = "default_true")]
    pub disk_cache_enabled: bool,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_memory_usage: default_max_memory(),
            max_disk_usage: default_max_disk(),
            cleaned_disk_usage: default_cleaned_disk(),
            disk_cache_dir: default_disk_dir(),
            disk_cache_enabled: true,
        }
    }
}

impl Cache {
    pub fn limits(&self) -> Result<CacheLimits> {
        let block_size = parse_size(&self.block_size)
            .with_context(|| format!("cache.block_size {:?}", self.block_size))?;
        let max_memory_usage = parse_size(&self.max_memory_usage)
            .with_context(|| format!("cache.max_memory_usage {:?}", self.max_memory_usage))?;
        let max_disk_usage = parse_size(&self.max_disk_usage)
            .with_context(|| format!("cache.max_disk_usage {:?}", self.max_disk_usage))?;
        let cleaned_disk_usage = parse_size(&self.cleaned_disk_usage)
            .with_context(|| format!("cache.cleaned_disk_usage {:?}", self.cleaned_disk_usage))?;
        if block_size == 0 {
            return Err(anyhow!("cache.block_size must be greater than zero"));
        }
        if self.disk_cache_enabled && cleaned_disk_usage >= max_disk_usage {
            return Err(anyhow!(
                "cache.cleaned_disk_usage ({}) must be below cache.max_disk_usage ({})",
                self.cleaned_disk_usage,
                self.max_disk_usage
            ));
        }
        Ok(CacheLimits {
            block_size,
            max_memory_usage,
            max_disk_usage,
            cleaned_disk_usage,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub block_size: u64,
    pub max_memory_usage: u64,
    pub max_disk_usage: u64,
    pub cleaned_disk_usage: u64,
}

/// Accepted by the config surface for a future peer cache tier; inert today.
#[derive(Debug, Deserialize, Default)]
pub struct Peering {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub etcd: Vec<String>,
}

fn default_addr() -> String {
    ":8080".to_string()
}

fn default_mirror_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_block_size() -> String {
    "2M".to_string()
}

fn default_max_memory() -> String {
    "100M".to_string()
}

fn default_max_disk() -> String {
    "1G".to_string()
}

fn default_cleaned_disk() -> String {
    "800M".to_string()
}

fn default_disk_dir() -> String {
    "./data".to_string()
}

fn default_true() -> bool {
    true
}

pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("empty size"));
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    if digits.is_empty() {
        return Err(anyhow!("invalid size {raw:?}"));
    }
    let value: u64 = digits.parse().with_context(|| format!("invalid size {raw:?}"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        other => return Err(anyhow!("unknown size unit {other:?} in {raw:?}")),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size {raw:?} overflows"))
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
