// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the crash SDK.

use std::path::PathBuf;

use loom_crash_core::{CrashError, MonitorType, ReportId};
use thiserror::Error;

/// Result type alias for crash operations.
pub type Result<T> = std::result::Result<T, CrashSdkError>;

/// Errors that can occur in the crash SDK.
#[derive(Debug, Error)]
pub enum CrashSdkError {
	/// Another reporter already owns the process-wide crash handlers.
	#[error("a crash reporter is already installed in this process")]
	AlreadyInstalled,

	#[error("crash reporter is not installed")]
	NotInstalled,

	#[error("monitor not enabled: {0}")]
	MonitorDisabled(MonitorType),

	/// A fatal event is being handled and did not finish in time.
	#[error("another crash capture is in progress")]
	CaptureInProgress,

	/// Sending requires a sink.
	#[error("no report sink configured")]
	NoSink,

	#[error("invalid user info: {0}")]
	InvalidUserInfo(String),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Core(#[from] CrashError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	SerializationError(#[from] serde_json::Error),

	/// Lock acquisition failed.
	#[error("failed to acquire lock")]
	LockError,
}

/// Errors from the on-disk report store.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("report not found: {0}")]
	NotFound(ReportId),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to encode report: {0}")]
	Encode(#[from] CrashError),

	#[error("path cannot be used from a signal handler: {0}")]
	InvalidPath(PathBuf),

	#[error("failed to acquire store lock")]
	LockError,
}

/// A filter refused or failed to transform a report.
#[derive(Debug, Error)]
pub enum FilterError {
	#[error("filter {filter} rejected report: {reason}")]
	Rejected { filter: String, reason: String },

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// A sink failed to deliver a report.
#[derive(Debug, Error)]
pub enum SinkError {
	/// HTTP request failed.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// Collector returned an error.
	#[error("collector rejected report (status {status}): {message}")]
	Rejected {
		/// HTTP status code.
		status: u16,
		/// Error message from the collector.
		message: String,
	},

	/// Rate limited by collector.
	#[error("rate limited, retry after {retry_after_secs:?} seconds")]
	RateLimited {
		/// Optional retry-after header value.
		retry_after_secs: Option<u64>,
	},

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// I/O error reading config file
	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// TOML parsing error
	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	/// Invalid value
	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	/// Validation error
	#[error("validation error: {0}")]
	Validation(String),
}
