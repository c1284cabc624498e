// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persisted application-state record carried across launches.

use serde::{Deserialize, Serialize};

pub const APP_STATE_FORMAT_VERSION: u32 = 1;

/// What one launch leaves behind for the next.
///
/// `crashed_last_launch` is written by the crash path of the launch that
/// crashed, so at the next startup it describes the previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppStateRecord {
	pub format_version: u32,
	pub crashed_last_launch: bool,
	pub active_duration_since_last_crash_ms: u64,
	pub background_duration_since_last_crash_ms: u64,
	pub launches_since_last_crash: u32,
	pub sessions_since_last_crash: u32,
}

impl AppStateRecord {
	/// The record the next launch starts from, given what this file said.
	pub fn next_launch(&self) -> Self {
		let mut next = if self.crashed_last_launch {
			Self::default()
		} else {
			self.clone()
		};
		next.format_version = APP_STATE_FORMAT_VERSION;
		next.crashed_last_launch = false;
		next.launches_since_last_crash = next.launches_since_last_crash.saturating_add(1);
		next.sessions_since_last_crash = next.sessions_since_last_crash.saturating_add(1);
		next
	}
}
