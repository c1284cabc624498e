// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Failure monitors.
//!
//! Each monitor detects one category of event and records it through the
//! registered [`CrashRuntime`](crate::runtime::CrashRuntime). The set is
//! closed and indexed by [`MonitorType`]; the controller decides the order.

pub(crate) mod deadlock;
pub(crate) mod fatal;
pub(crate) mod foreign;
pub(crate) mod handoff;
pub(crate) mod kernel;
pub(crate) mod panic;
pub(crate) mod sigaction;
pub(crate) mod signal;
pub(crate) mod system;
pub(crate) mod user;

use std::sync::atomic::{AtomicU8, Ordering};

use loom_crash_core::{CrashError, MonitorState, MonitorType};

pub use deadlock::{MainThreadExecutor, MainThreadQueue};
pub use foreign::{report_foreign_exception, set_foreign_exception_handler, ForeignException};
pub use system::ZombieRecorder;
pub use user::UserException;

const MONITOR_COUNT: usize = 9;

/// One failure-detection capability.
pub trait Monitor: Send {
	fn monitor_type(&self) -> MonitorType;

	/// Attaches the monitor. A failure leaves it out of the active set.
	fn install(&mut self) -> Result<(), CrashError>;

	/// Detaches the monitor, restoring whatever it replaced.
	fn uninstall(&mut self);

	fn is_enabled(&self) -> bool;

	fn is_async_signal_safe(&self) -> bool {
		MonitorType::ASYNC_SAFE.contains(self.monitor_type())
	}
}

/// Per-monitor lifecycle state, readable from signal handlers.
pub(crate) struct MonitorStates {
	states: [AtomicU8; MONITOR_COUNT],
}

impl MonitorStates {
	pub(crate) const fn new() -> Self {
		Self {
			states: [const { AtomicU8::new(0) }; MONITOR_COUNT],
		}
	}

	pub(crate) fn get(&self, kind: MonitorType) -> MonitorState {
		kind.index()
			.and_then(|i| self.states.get(i))
			.map(|s| MonitorState::from_u8(s.load(Ordering::Acquire)))
			.unwrap_or_default()
	}

	pub(crate) fn set(&self, kind: MonitorType, state: MonitorState) {
		if let Some(slot) = kind.index().and_then(|i| self.states.get(i)) {
			slot.store(state.as_u8(), Ordering::Release);
		}
	}

	/// Moves an installed monitor to `Triggered`. Async-signal-safe.
	pub(crate) fn mark_triggered(&self, kind: MonitorType) {
		if let Some(slot) = kind.index().and_then(|i| self.states.get(i)) {
			let _ = slot.compare_exchange(
				MonitorState::Installed.as_u8(),
				MonitorState::Triggered.as_u8(),
				Ordering::AcqRel,
				Ordering::Acquire,
			);
		}
	}
}

/// States of the process-wide monitor set.
pub(crate) static STATES: MonitorStates = MonitorStates::new();
