// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for Loom crash capture.
//!
//! This crate holds everything that does not touch the operating system:
//! the monitor bitmask, the report document model, the on-disk report format
//! and its decoder, the delete-after-send policy and fingerprinting. It is
//! shared by the capture engine (`loom-crash`) and offline tooling.

pub mod app_state;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod monitor;
pub mod policy;
pub mod report;

pub use app_state::AppStateRecord;
pub use error::{CrashError, Result};
pub use fingerprint::{compute_fingerprint, find_culprit};
pub use format::{decode_report, encode_report};
pub use monitor::{MonitorState, MonitorType};
pub use policy::DeleteBehavior;
pub use report::{
	BinaryImage, CrashInfo, CrashReport, ErrorInfo, ErrorKind, ExceptionInfo, Frame, MemorySample,
	ReportHeader, SignalInfo, ThreadRecord, ZombieRecord,
};

use std::fmt;
use std::str::FromStr;

/// Report identifier.
///
/// Allocated from a persisted monotonic counter; never reused, even after the
/// report is deleted.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ReportId(pub u64);

impl ReportId {
	pub fn next(self) -> Self {
		Self(self.0.saturating_add(1))
	}
}

impl fmt::Display for ReportId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ReportId {
	type Err = std::num::ParseIntError;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

impl From<u64> for ReportId {
	fn from(value: u64) -> Self {
		Self(value)
	}
}
