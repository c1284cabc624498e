// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for crash capture.

use thiserror::Error;

/// Errors that can occur in the crash capture system.
#[derive(Debug, Error)]
pub enum CrashError {
	/// A monitor could not attach. Non-fatal: the monitor is left out of the active set.
	#[error("failed to install {monitor} monitor: {reason}")]
	InstallFailure { monitor: String, reason: String },

	/// A preallocated capture buffer filled up; partial data was kept.
	#[error("capture buffer exhausted: {field}")]
	CaptureTruncation { field: &'static str },

	#[error("failed to write report: {0}")]
	WriteFailure(String),

	#[error("failed to send report: {0}")]
	SendFailure(String),

	/// A second fatal event arrived on the thread already handling one.
	#[error("fatal signal {signal} while handling a previous fatal event")]
	ReentrantFault { signal: i32 },

	#[error("report not found: {0}")]
	ReportNotFound(u64),

	#[error("invalid monitor type: {0}")]
	InvalidMonitorType(String),

	#[error("invalid delete behavior: {0}")]
	InvalidDeleteBehavior(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl CrashError {
	pub fn install(monitor: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::InstallFailure {
			monitor: monitor.into(),
			reason: reason.into(),
		}
	}
}

/// Result type for crash capture operations.
pub type Result<T> = std::result::Result<T, CrashError>;
