//! File configuration for CLI defaults.
//!
//! The file is a flat list of `key = value` lines. Strings are double-quoted,
//! `#` starts a comment outside strings.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use mss_core::download::Egress;

const APP_DIR: &str = "mss-downloader";

/// Values read from the config file. `None` means the key was absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub max_retries: Option<u32>,
    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub max_quality_fallbacks: Option<bool>,
    pub quality_fallback_threshold: Option<u32>,
    pub proxy_health_check: Option<bool>,
    pub proxies: Option<Vec<Egress>>,
    pub persistent_queue: Option<bool>,
    pub page_verification_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub tile_concurrency: Option<usize>,
    pub max_sweeps: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub max_canvas_dimension: Option<u32>,
    pub output_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

impl FileConfig {
    /// Validates config values against the ranges the CLI accepts.
    pub fn validate(&self) -> Result<()> {
        check_range("max_retries", self.max_retries, 1, 100)?;
        check_range("quality_fallback_threshold", self.quality_fallback_threshold, 1, 50)?;
        check_range("concurrency", self.concurrency, 1, 100)?;
        check_range("tile_concurrency", self.tile_concurrency, 1, 64)?;
        check_range("max_sweeps", self.max_sweeps, 0, 20)?;
        check_range("request_timeout_secs", self.request_timeout_secs, 1, 3600)?;
        check_range("connect_timeout_secs", self.connect_timeout_secs, 1, 3600)?;
        check_range("max_canvas_dimension", self.max_canvas_dimension, 256, 65_535)?;

        if let (Some(min), Some(max)) = (self.min_delay_ms, self.max_delay_ms)
            && min > max
        {
            bail!("Invalid config: `min_delay_ms` ({min}) exceeds `max_delay_ms` ({max})");
        }
        Ok(())
    }
}

fn check_range<T>(field: &str, value: Option<T>, min: T, max: T) -> Result<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    let Some(value) = value else {
        return Ok(());
    };
    if value < min || value > max {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/mss-downloader/config.toml`
/// 2. `$HOME/.config/mss-downloader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join(APP_DIR).join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

/// Default state directory for the retry queue and manifest cache.
///
/// `$XDG_DATA_HOME/mss-downloader`, then `$HOME/.local/share/mss-downloader`,
/// then `./.mss-downloader`.
#[must_use]
pub fn resolve_default_state_dir() -> PathBuf {
    if let Some(xdg) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join(APP_DIR);
    }
    match env_var_non_empty_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("share").join(APP_DIR),
        None => PathBuf::from(".").join(format!(".{APP_DIR}")),
    }
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config at `explicit`, or the default path if it exists.
///
/// An explicit path must exist; a missing default file yields `None`.
pub fn load_config(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = explicit {
        return load_file_config(path).map(Some);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path).map(Some),
        _ => Ok(None),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "max_retries" => cfg.max_retries = Some(parse_int(value).with_context(context)?),
            "min_delay_ms" => cfg.min_delay_ms = Some(parse_int(value).with_context(context)?),
            "max_delay_ms" => cfg.max_delay_ms = Some(parse_int(value).with_context(context)?),
            "max_quality_fallbacks" => {
                cfg.max_quality_fallbacks = Some(parse_boolean(value).with_context(context)?);
            }
            "quality_fallback_threshold" => {
                cfg.quality_fallback_threshold = Some(parse_int(value).with_context(context)?);
            }
            "proxy_health_check" => {
                cfg.proxy_health_check = Some(parse_boolean(value).with_context(context)?);
            }
            "proxies" => cfg.proxies = Some(parse_proxies(value).with_context(context)?),
            "persistent_queue" => {
                cfg.persistent_queue = Some(parse_boolean(value).with_context(context)?);
            }
            "page_verification_size" => {
                cfg.page_verification_size = Some(parse_int(value).with_context(context)?);
            }
            "concurrency" => cfg.concurrency = Some(parse_int(value).with_context(context)?),
            "tile_concurrency" => {
                cfg.tile_concurrency = Some(parse_int(value).with_context(context)?);
            }
            "max_sweeps" => cfg.max_sweeps = Some(parse_int(value).with_context(context)?),
            "request_timeout_secs" => {
                cfg.request_timeout_secs = Some(parse_int(value).with_context(context)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_int(value).with_context(context)?);
            }
            "max_canvas_dimension" => {
                cfg.max_canvas_dimension = Some(parse_int(value).with_context(context)?);
            }
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "state_dir" => {
                cfg.state_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_int<T>(raw_value: &str) -> Result<T>
where
    T: TryFrom<u64>,
{
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    let value = u64::try_from(value).map_err(|_| anyhow!("Integer value out of range"))?;
    T::try_from(value).map_err(|_| anyhow!("Integer value out of range"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

/// Comma-separated egress list inside one quoted string.
fn parse_proxies(raw_value: &str) -> Result<Vec<Egress>> {
    let list = parse_string_literal(raw_value)?;
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| Egress::from_str(entry).map_err(|e| anyhow!("{e}: '{entry}'")))
        .collect()
}
