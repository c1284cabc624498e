// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Monitor type bitmask, monitor groups and per-monitor lifecycle state.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Sub, SubAssign};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CrashError;

/// A set of monitor variants.
///
/// Single bits name one monitor; the associated group constants combine them
/// for common install profiles.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MonitorType(u32);

impl MonitorType {
	/// Hardware faults routed through the exception listener thread.
	pub const KERNEL_EXCEPTION: Self = Self(0x001);
	/// Fatal POSIX signals.
	pub const SIGNAL: Self = Self(0x002);
	/// Uncaught Rust panics.
	pub const PANIC: Self = Self(0x004);
	/// Uncaught exceptions forwarded by a foreign language runtime.
	pub const FOREIGN_EXCEPTION: Self = Self(0x008);
	/// Main thread stopped answering the watchdog.
	pub const MAIN_THREAD_DEADLOCK: Self = Self(0x010);
	/// Reports requested directly by the application.
	pub const USER_REPORTED: Self = Self(0x020);
	/// System metadata.
	pub const SYSTEM: Self = Self(0x040);
	/// Launch, session and duration bookkeeping.
	pub const APPLICATION_STATE: Self = Self(0x080);
	/// Last bad access recorded by an object-lifecycle tracker.
	pub const ZOMBIE: Self = Self(0x100);

	pub const NONE: Self = Self(0);
	pub const ALL: Self = Self(0x1ff);

	pub const EXPERIMENTAL: Self = Self::MAIN_THREAD_DEADLOCK;
	pub const DEBUGGER_UNSAFE: Self =
		Self(Self::KERNEL_EXCEPTION.0 | Self::SIGNAL.0 | Self::PANIC.0 | Self::FOREIGN_EXCEPTION.0);
	pub const ASYNC_SAFE: Self = Self(Self::KERNEL_EXCEPTION.0 | Self::SIGNAL.0);
	pub const OPTIONAL: Self = Self::ZOMBIE;
	pub const ASYNC_UNSAFE: Self = Self(Self::ALL.0 & !Self::ASYNC_SAFE.0);
	pub const DEBUGGER_SAFE: Self = Self(Self::ALL.0 & !Self::DEBUGGER_UNSAFE.0);
	pub const PRODUCTION_SAFE: Self = Self(Self::ALL.0 & !Self::EXPERIMENTAL.0);
	pub const PRODUCTION_SAFE_MINIMAL: Self = Self(Self::PRODUCTION_SAFE.0 & !Self::OPTIONAL.0);
	pub const REQUIRED: Self = Self(Self::SYSTEM.0 | Self::APPLICATION_STATE.0);
	pub const MANUAL: Self = Self(Self::REQUIRED.0 | Self::USER_REPORTED.0);

	const SINGLE: [(Self, &'static str); 9] = [
		(Self::KERNEL_EXCEPTION, "kernel_exception"),
		(Self::SIGNAL, "signal"),
		(Self::PANIC, "panic"),
		(Self::FOREIGN_EXCEPTION, "foreign_exception"),
		(Self::MAIN_THREAD_DEADLOCK, "main_thread_deadlock"),
		(Self::USER_REPORTED, "user_reported"),
		(Self::SYSTEM, "system"),
		(Self::APPLICATION_STATE, "application_state"),
		(Self::ZOMBIE, "zombie"),
	];

	const GROUPS: [(Self, &'static str); 12] = [
		(Self::NONE, "none"),
		(Self::ALL, "all"),
		(Self::EXPERIMENTAL, "experimental"),
		(Self::DEBUGGER_UNSAFE, "debugger_unsafe"),
		(Self::ASYNC_SAFE, "async_safe"),
		(Self::OPTIONAL, "optional"),
		(Self::ASYNC_UNSAFE, "async_unsafe"),
		(Self::DEBUGGER_SAFE, "debugger_safe"),
		(Self::PRODUCTION_SAFE, "production_safe"),
		(Self::PRODUCTION_SAFE_MINIMAL, "production_safe_minimal"),
		(Self::REQUIRED, "required"),
		(Self::MANUAL, "manual"),
	];

	/// Builds a set from raw bits, dropping bits that name no monitor.
	pub const fn from_bits_truncate(bits: u32) -> Self {
		Self(bits & Self::ALL.0)
	}

	pub const fn bits(self) -> u32 {
		self.0
	}

	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}

	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}

	pub const fn intersects(self, other: Self) -> bool {
		self.0 & other.0 != 0
	}

	/// Number of monitors in the set.
	pub const fn len(self) -> usize {
		self.0.count_ones() as usize
	}

	/// Iterates the single-monitor members in ascending bit order.
	pub fn iter(self) -> impl Iterator<Item = MonitorType> {
		Self::SINGLE
			.into_iter()
			.map(|(kind, _)| kind)
			.filter(move |kind| self.contains(*kind))
	}

	/// Name of a single monitor; `None` for empty sets and combinations.
	pub fn name(self) -> Option<&'static str> {
		Self::SINGLE
			.iter()
			.find(|(kind, _)| *kind == self)
			.map(|(_, name)| *name)
	}

	/// Position of a single monitor's bit, used to index fixed per-monitor tables.
	pub fn index(self) -> Option<usize> {
		if self.len() == 1 {
			Some(self.0.trailing_zeros() as usize)
		} else {
			None
		}
	}
}

impl fmt::Debug for MonitorType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "MonitorType({self})")
	}
}

impl fmt::Display for MonitorType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_empty() {
			return f.write_str("none");
		}
		let mut first = true;
		for kind in self.iter() {
			if !first {
				f.write_str("|")?;
			}
			first = false;
			f.write_str(kind.name().unwrap_or("unknown"))?;
		}
		Ok(())
	}
}

impl FromStr for MonitorType {
	type Err = CrashError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut result = Self::NONE;
		for part in s.split(['|', ',']) {
			let part = part.trim();
			if part.is_empty() {
				continue;
			}
			let lower = part.to_ascii_lowercase();
			let found = Self::SINGLE
				.iter()
				.chain(Self::GROUPS.iter())
				.find(|(_, name)| *name == lower)
				.map(|(kind, _)| *kind)
				.ok_or_else(|| CrashError::InvalidMonitorType(part.to_string()))?;
			result |= found;
		}
		Ok(result)
	}
}

impl Serialize for MonitorType {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for MonitorType {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

impl BitOr for MonitorType {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

impl BitOrAssign for MonitorType {
	fn bitor_assign(&mut self, rhs: Self) {
		self.0 |= rhs.0;
	}
}

impl BitAnd for MonitorType {
	type Output = Self;

	fn bitand(self, rhs: Self) -> Self {
		Self(self.0 & rhs.0)
	}
}

impl BitAndAssign for MonitorType {
	fn bitand_assign(&mut self, rhs: Self) {
		self.0 &= rhs.0;
	}
}

impl Sub for MonitorType {
	type Output = Self;

	fn sub(self, rhs: Self) -> Self {
		Self(self.0 & !rhs.0)
	}
}

impl SubAssign for MonitorType {
	fn sub_assign(&mut self, rhs: Self) {
		self.0 &= !rhs.0;
	}
}

impl Not for MonitorType {
	type Output = Self;

	fn not(self) -> Self {
		Self(!self.0 & Self::ALL.0)
	}
}

/// Lifecycle of one monitor.
///
/// `Uninstalled -> Installing -> {Installed | FailedInstall} -> Uninstalled`, and
/// `Installed -> Triggered` once a fatal monitor has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
	#[default]
	Uninstalled,
	Installing,
	Installed,
	FailedInstall,
	Triggered,
}

impl MonitorState {
	/// Whether the monitor's install succeeded and it has not been torn down.
	pub fn is_active(self) -> bool {
		matches!(self, Self::Installed | Self::Triggered)
	}

	pub fn as_u8(self) -> u8 {
		match self {
			Self::Uninstalled => 0,
			Self::Installing => 1,
			Self::Installed => 2,
			Self::FailedInstall => 3,
			Self::Triggered => 4,
		}
	}

	pub fn from_u8(value: u8) -> Self {
		match value {
			1 => Self::Installing,
			2 => Self::Installed,
			3 => Self::FailedInstall,
			4 => Self::Triggered,
			_ => Self::Uninstalled,
		}
	}
}

impl fmt::Display for MonitorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Uninstalled => "uninstalled",
			Self::Installing => "installing",
			Self::Installed => "installed",
			Self::FailedInstall => "failed_install",
			Self::Triggered => "triggered",
		};
		f.write_str(s)
	}
}
