// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! What happens to a stored report after a send attempt.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CrashError;

/// Delete-after-send policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteBehavior {
	/// Keep every report regardless of outcome.
	Never,
	/// Delete only reports the sink accepted.
	OnSuccess,
	/// Delete every report that reached a final outcome, success or failure.
	#[default]
	Always,
}

impl DeleteBehavior {
	/// Whether a report with the given outcome should be removed from the store.
	pub fn should_delete(self, sent: bool) -> bool {
		match self {
			Self::Never => false,
			Self::OnSuccess => sent,
			Self::Always => true,
		}
	}
}

impl fmt::Display for DeleteBehavior {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Never => "never",
			Self::OnSuccess => "on_success",
			Self::Always => "always",
		};
		f.write_str(s)
	}
}

impl FromStr for DeleteBehavior {
	type Err = CrashError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
			"never" => Ok(Self::Never),
			"on_success" | "onsuccess" => Ok(Self::OnSuccess),
			"always" => Ok(Self::Always),
			_ => Err(CrashError::InvalidDeleteBehavior(s.to_string())),
		}
	}
}
