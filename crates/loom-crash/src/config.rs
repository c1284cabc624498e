// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered reporter configuration.
//!
//! Sources apply in precedence order: built-in defaults, the TOML file
//! (`<config_dir>/loom/crash.toml`), then `LOOM_CRASH_*` environment
//! variables. Each source yields a [`CrashConfigLayer`] of optional fields;
//! later layers override earlier ones and the merged layer is finalized into
//! a [`CrashConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use loom_crash_core::{DeleteBehavior, MonitorType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::context::CaptureLimits;
use crate::error::ConfigError;
use crate::pipeline::{SendConfig, SendOrder};

const ENV_PREFIX: &str = "LOOM_CRASH_";

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CrashConfigLayer {
	pub report_dir: Option<PathBuf>,
	pub app_name: Option<String>,
	pub monitors: Option<MonitorType>,
	pub max_report_count: Option<usize>,
	pub delete_behavior: Option<DeleteBehavior>,
	pub deadlock_interval_ms: Option<u64>,
	pub terminate_on_deadlock: Option<bool>,
	pub introspect_memory: Option<bool>,
	pub snapshot_all_threads: Option<bool>,
	pub max_threads: Option<usize>,
	pub max_frames: Option<usize>,
	pub send_timeout_secs: Option<u64>,
	pub send_concurrency: Option<usize>,
	pub send_order: Option<SendOrder>,
	pub send_url: Option<String>,
	pub console_log: Option<bool>,
	pub print_previous_log: Option<bool>,
}

impl CrashConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.report_dir.is_some() {
			self.report_dir = other.report_dir;
		}
		if other.app_name.is_some() {
			self.app_name = other.app_name;
		}
		if other.monitors.is_some() {
			self.monitors = other.monitors;
		}
		if other.max_report_count.is_some() {
			self.max_report_count = other.max_report_count;
		}
		if other.delete_behavior.is_some() {
			self.delete_behavior = other.delete_behavior;
		}
		if other.deadlock_interval_ms.is_some() {
			self.deadlock_interval_ms = other.deadlock_interval_ms;
		}
		if other.terminate_on_deadlock.is_some() {
			self.terminate_on_deadlock = other.terminate_on_deadlock;
		}
		if other.introspect_memory.is_some() {
			self.introspect_memory = other.introspect_memory;
		}
		if other.snapshot_all_threads.is_some() {
			self.snapshot_all_threads = other.snapshot_all_threads;
		}
		if other.max_threads.is_some() {
			self.max_threads = other.max_threads;
		}
		if other.max_frames.is_some() {
			self.max_frames = other.max_frames;
		}
		if other.send_timeout_secs.is_some() {
			self.send_timeout_secs = other.send_timeout_secs;
		}
		if other.send_concurrency.is_some() {
			self.send_concurrency = other.send_concurrency;
		}
		if other.send_order.is_some() {
			self.send_order = other.send_order;
		}
		if other.send_url.is_some() {
			self.send_url = other.send_url;
		}
		if other.console_log.is_some() {
			self.console_log = other.console_log;
		}
		if other.print_previous_log.is_some() {
			self.print_previous_log = other.print_previous_log;
		}
	}

	pub fn finalize(self) -> CrashConfig {
		let defaults = CrashConfig::default();
		CrashConfig {
			report_dir: self.report_dir.unwrap_or(defaults.report_dir),
			app_name: self.app_name.unwrap_or(defaults.app_name),
			monitors: self.monitors.unwrap_or(defaults.monitors),
			max_report_count: self.max_report_count.unwrap_or(defaults.max_report_count),
			delete_behavior: self.delete_behavior.unwrap_or(defaults.delete_behavior),
			deadlock_interval_ms: self.deadlock_interval_ms.unwrap_or(defaults.deadlock_interval_ms),
			terminate_on_deadlock: self.terminate_on_deadlock.unwrap_or(defaults.terminate_on_deadlock),
			introspect_memory: self.introspect_memory.unwrap_or(defaults.introspect_memory),
			snapshot_all_threads: self.snapshot_all_threads.unwrap_or(defaults.snapshot_all_threads),
			max_threads: self.max_threads.unwrap_or(defaults.max_threads),
			max_frames: self.max_frames.unwrap_or(defaults.max_frames),
			send_timeout_secs: self.send_timeout_secs.unwrap_or(defaults.send_timeout_secs),
			send_concurrency: self.send_concurrency.unwrap_or(defaults.send_concurrency),
			send_order: self.send_order.unwrap_or(defaults.send_order),
			send_url: self.send_url,
			console_log: self.console_log.unwrap_or(defaults.console_log),
			print_previous_log: self.print_previous_log.unwrap_or(defaults.print_previous_log),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrashConfig {
	pub report_dir: PathBuf,
	pub app_name: String,
	pub monitors: MonitorType,
	pub max_report_count: usize,
	pub delete_behavior: DeleteBehavior,
	/// 0 disables the deadlock watchdog.
	pub deadlock_interval_ms: u64,
	pub terminate_on_deadlock: bool,
	pub introspect_memory: bool,
	pub snapshot_all_threads: bool,
	pub max_threads: usize,
	pub max_frames: usize,
	pub send_timeout_secs: u64,
	pub send_concurrency: usize,
	pub send_order: SendOrder,
	/// Collector base URL for the HTTP sink.
	pub send_url: Option<String>,
	/// Keep a console log beside the reports and copy its tail into each
	/// crash report.
	pub console_log: bool,
	/// Print the previous run's console log to stderr when the reporter is
	/// built.
	pub print_previous_log: bool,
}

impl Default for CrashConfig {
	fn default() -> Self {
		Self {
			report_dir: default_report_dir(),
			app_name: "app".to_string(),
			monitors: MonitorType::PRODUCTION_SAFE_MINIMAL,
			max_report_count: 5,
			delete_behavior: DeleteBehavior::Always,
			deadlock_interval_ms: 0,
			terminate_on_deadlock: true,
			introspect_memory: true,
			snapshot_all_threads: true,
			max_threads: 128,
			max_frames: 128,
			send_timeout_secs: 30,
			send_concurrency: 1,
			send_order: SendOrder::OldestFirst,
			send_url: None,
			console_log: false,
			print_previous_log: false,
		}
	}
}

impl CrashConfig {
	/// Loads defaults, the default config file and the environment.
	pub fn load() -> Result<Self, ConfigError> {
		let mut sources: Vec<Box<dyn ConfigSource>> = vec![Box::new(DefaultsSource)];
		if let Some(path) = default_config_path() {
			sources.push(Box::new(TomlSource::new(path)));
		}
		sources.push(Box::new(EnvSource::process()));
		load_from_sources(sources)
	}

	/// Like [`CrashConfig::load`] with an explicit config file.
	pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
		load_from_sources(vec![
			Box::new(DefaultsSource),
			Box::new(TomlSource::new(path)),
			Box::new(EnvSource::process()),
		])
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let at_least_one = [
			("max_report_count", self.max_report_count),
			("max_threads", self.max_threads),
			("max_frames", self.max_frames),
			("send_concurrency", self.send_concurrency),
		];
		for (key, value) in at_least_one {
			if value == 0 {
				return Err(ConfigError::InvalidValue {
					key: key.to_string(),
					message: "must be at least 1".to_string(),
				});
			}
		}
		if self.app_name.trim().is_empty() {
			return Err(ConfigError::Validation("app_name must not be empty".to_string()));
		}
		if self.app_name.contains('/') {
			return Err(ConfigError::Validation(format!(
				"app_name must not contain '/': {}",
				self.app_name
			)));
		}
		Ok(())
	}

	pub fn send_config(&self) -> SendConfig {
		SendConfig {
			delete_behavior: self.delete_behavior,
			order: self.send_order,
			report_timeout: Duration::from_secs(self.send_timeout_secs),
			concurrency: self.send_concurrency,
		}
	}

	pub(crate) fn capture_limits(&self) -> CaptureLimits {
		CaptureLimits {
			max_threads: self.max_threads,
			max_frames: self.max_frames,
			introspect_memory: self.introspect_memory,
		}
	}

	/// `<report_dir>/<app_name>-console.log`.
	pub fn console_log_path(&self) -> PathBuf {
		self.report_dir.join(format!("{}-console.log", self.app_name))
	}
}

/// `<data_dir>/loom/crash-reports`.
pub fn default_report_dir() -> PathBuf {
	dirs::data_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("loom")
		.join("crash-reports")
}

/// `<config_dir>/loom/crash.toml`.
pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("loom").join("crash.toml"))
}

fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<CrashConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());
	let mut merged = CrashConfigLayer::default();
	for source in &sources {
		trace!(source = source.name(), "applying config source");
		merged.merge(source.load()?);
	}
	let config = merged.finalize();
	config.validate()?;
	info!(
		report_dir = %config.report_dir.display(),
		monitors = %config.monitors,
		max_report_count = config.max_report_count,
		"Crash reporter configuration loaded"
	);
	Ok(config)
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<CrashConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<CrashConfigLayer, ConfigError> {
		Ok(CrashConfigLayer::default())
	}
}

/// TOML file configuration source. A missing file is an empty layer.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<CrashConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(CrashConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: self.path.clone(),
			source: e,
		})
	}
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment variable source.
///
/// Convention: `LOOM_CRASH_<FIELD>`, e.g. `LOOM_CRASH_MAX_REPORT_COUNT`.
pub struct EnvSource {
	lookup: EnvLookup,
}

impl EnvSource {
	/// Reads the process environment.
	pub fn process() -> Self {
		Self::with_lookup(|name| std::env::var(name).ok())
	}

	pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
		Self {
			lookup: Box::new(lookup),
		}
	}

	fn var(&self, field: &str) -> Option<String> {
		(self.lookup)(&format!("{ENV_PREFIX}{field}")).filter(|s| !s.is_empty())
	}

	fn bool(&self, field: &str) -> Option<bool> {
		self.var(field)
			.map(|v| v.eq_ignore_ascii_case("true") || v == "1")
	}

	fn parsed<T>(&self, field: &str) -> Result<Option<T>, ConfigError>
	where
		T: std::str::FromStr,
		T::Err: std::fmt::Display,
	{
		match self.var(field) {
			Some(v) => v.parse().map(Some).map_err(|e| ConfigError::InvalidValue {
				key: format!("{ENV_PREFIX}{field}"),
				message: format!("invalid value '{v}': {e}"),
			}),
			None => Ok(None),
		}
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<CrashConfigLayer, ConfigError> {
		Ok(CrashConfigLayer {
			report_dir: self.var("REPORT_DIR").map(PathBuf::from),
			app_name: self.var("APP_NAME"),
			monitors: self.parsed("MONITORS")?,
			max_report_count: self.parsed("MAX_REPORT_COUNT")?,
			delete_behavior: self.parsed("DELETE_BEHAVIOR")?,
			deadlock_interval_ms: self.parsed("DEADLOCK_INTERVAL_MS")?,
			terminate_on_deadlock: self.bool("TERMINATE_ON_DEADLOCK"),
			introspect_memory: self.bool("INTROSPECT_MEMORY"),
			snapshot_all_threads: self.bool("SNAPSHOT_ALL_THREADS"),
			max_threads: self.parsed("MAX_THREADS")?,
			max_frames: self.parsed("MAX_FRAMES")?,
			send_timeout_secs: self.parsed("SEND_TIMEOUT_SECS")?,
			send_concurrency: self.parsed("SEND_CONCURRENCY")?,
			send_order: self.parsed("SEND_ORDER")?,
			send_url: self.var("SEND_URL"),
			console_log: self.bool("CONSOLE_LOG"),
			print_previous_log: self.bool("PRINT_PREVIOUS_LOG"),
		})
	}
}
