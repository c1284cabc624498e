// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Monitor controller.
//!
//! Owns the closed set of monitors and installs a requested subset in a
//! fixed order. Changing the active set always tears the previous set down
//! first, so there is never a mix of old and new monitors.

use loom_crash_core::{MonitorState, MonitorType};
use tracing::{debug, info, warn};

use crate::monitors::{Monitor, MonitorStates};
use crate::sys;

/// Metadata monitors first, the experimental watchdog last.
pub(crate) const INSTALL_ORDER: [MonitorType; 9] = [
	MonitorType::SYSTEM,
	MonitorType::APPLICATION_STATE,
	MonitorType::ZOMBIE,
	MonitorType::KERNEL_EXCEPTION,
	MonitorType::SIGNAL,
	MonitorType::PANIC,
	MonitorType::FOREIGN_EXCEPTION,
	MonitorType::USER_REPORTED,
	MonitorType::MAIN_THREAD_DEADLOCK,
];

fn install_rank(kind: MonitorType) -> usize {
	INSTALL_ORDER
		.iter()
		.position(|k| *k == kind)
		.unwrap_or(INSTALL_ORDER.len())
}

pub(crate) struct MonitorController {
	monitors: Vec<Box<dyn Monitor>>,
	states: &'static MonitorStates,
	debugger_attached: fn() -> bool,
}

impl MonitorController {
	pub(crate) fn new(mut monitors: Vec<Box<dyn Monitor>>, states: &'static MonitorStates) -> Self {
		monitors.sort_by_key(|m| install_rank(m.monitor_type()));
		Self {
			monitors,
			states,
			debugger_attached: sys::debugger_attached,
		}
	}

	#[cfg(test)]
	pub(crate) fn with_debugger_check(mut self, check: fn() -> bool) -> Self {
		self.debugger_attached = check;
		self
	}

	/// Replaces the active set with as much of `requested` as installs.
	///
	/// Returns the installed subset.
	pub(crate) fn set_active(&mut self, requested: MonitorType) -> MonitorType {
		self.uninstall_all();

		let mut requested = requested;
		if (self.debugger_attached)() && requested.intersects(MonitorType::DEBUGGER_UNSAFE) {
			warn!(
				removed = %(requested & MonitorType::DEBUGGER_UNSAFE),
				"Debugger attached, skipping debugger-unsafe monitors"
			);
			requested = requested - MonitorType::DEBUGGER_UNSAFE;
		}

		let mut installed = MonitorType::NONE;
		for monitor in self.monitors.iter_mut() {
			let kind = monitor.monitor_type();
			if !requested.contains(kind) {
				continue;
			}
			self.states.set(kind, MonitorState::Installing);
			match monitor.install() {
				Ok(()) => {
					self.states.set(kind, MonitorState::Installed);
					installed = installed | kind;
					debug!(
						monitor = %kind,
						async_signal_safe = monitor.is_async_signal_safe(),
						"Monitor installed"
					);
				}
				Err(e) => {
					self.states.set(kind, MonitorState::FailedInstall);
					warn!(monitor = %kind, error = %e, "Monitor failed to install");
				}
			}
		}

		info!(requested = %requested, installed = %installed, "Monitors activated");
		installed
	}

	/// Uninstalls every enabled monitor, newest first, and resets every
	/// monitor's state to uninstalled.
	pub(crate) fn uninstall_all(&mut self) {
		let mut removed = MonitorType::NONE;
		for monitor in self.monitors.iter_mut().rev() {
			let kind = monitor.monitor_type();
			if monitor.is_enabled() {
				monitor.uninstall();
				removed = removed | kind;
			}
			if self.states.get(kind) != MonitorState::Uninstalled {
				self.states.set(kind, MonitorState::Uninstalled);
			}
		}
		if !removed.is_empty() {
			debug!(monitors = %removed, "Monitors uninstalled");
		}
	}

	/// Monitors currently enabled.
	pub(crate) fn active(&self) -> MonitorType {
		self.monitors
			.iter()
			.filter(|m| m.is_enabled())
			.fold(MonitorType::NONE, |set, m| set | m.monitor_type())
	}

	#[cfg(test)]
	pub(crate) fn state(&self, kind: MonitorType) -> MonitorState {
		self.states.get(kind)
	}
}

impl Drop for MonitorController {
	fn drop(&mut self) {
		self.uninstall_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_crash_core::CrashError;
	use proptest::prelude::*;
	use std::sync::{Arc, Mutex};

	type Log = Arc<Mutex<Vec<String>>>;

	struct MockMonitor {
		kind: MonitorType,
		fails: bool,
		enabled: bool,
		log: Log,
	}

	impl Monitor for MockMonitor {
		fn monitor_type(&self) -> MonitorType {
			self.kind
		}

		fn install(&mut self) -> Result<(), CrashError> {
			self.log.lock().unwrap().push(format!("+{}", self.kind));
			if self.fails {
				return Err(CrashError::install(self.kind.to_string(), "mock failure"));
			}
			self.enabled = true;
			Ok(())
		}

		fn uninstall(&mut self) {
			self.log.lock().unwrap().push(format!("-{}", self.kind));
			self.enabled = false;
		}

		fn is_enabled(&self) -> bool {
			self.enabled
		}
	}

	fn leaked_states() -> &'static MonitorStates {
		Box::leak(Box::new(MonitorStates::new()))
	}

	fn controller(failing: MonitorType, log: &Log) -> MonitorController {
		// Registered out of order on purpose.
		let monitors = INSTALL_ORDER
			.iter()
			.rev()
			.map(|kind| {
				Box::new(MockMonitor {
					kind: *kind,
					fails: failing.contains(*kind),
					enabled: false,
					log: Arc::clone(log),
				}) as Box<dyn Monitor>
			})
			.collect();
		MonitorController::new(monitors, leaked_states()).with_debugger_check(|| false)
	}

	#[test]
	fn installs_in_order_and_uninstalls_in_reverse() {
		let log = Log::default();
		let mut controller = controller(MonitorType::NONE, &log);
		let requested = MonitorType::SIGNAL | MonitorType::SYSTEM | MonitorType::USER_REPORTED;
		assert_eq!(controller.set_active(requested), requested);
		controller.uninstall_all();

		assert_eq!(
			*log.lock().unwrap(),
			vec![
				"+system",
				"+signal",
				"+user_reported",
				"-user_reported",
				"-signal",
				"-system"
			]
		);
		assert_eq!(controller.active(), MonitorType::NONE);
		assert_eq!(controller.state(MonitorType::SIGNAL), MonitorState::Uninstalled);
	}

	#[test]
	fn failures_are_excluded_and_recorded() {
		let log = Log::default();
		let mut controller = controller(MonitorType::KERNEL_EXCEPTION, &log);
		let requested = MonitorType::KERNEL_EXCEPTION | MonitorType::SIGNAL;
		assert_eq!(controller.set_active(requested), MonitorType::SIGNAL);
		assert_eq!(controller.state(MonitorType::KERNEL_EXCEPTION), MonitorState::FailedInstall);
		assert_eq!(controller.state(MonitorType::SIGNAL), MonitorState::Installed);
	}

	#[test]
	fn uninstall_resets_failed_monitors() {
		let log = Log::default();
		let mut controller = controller(MonitorType::KERNEL_EXCEPTION, &log);
		controller.set_active(MonitorType::KERNEL_EXCEPTION | MonitorType::SIGNAL);
		controller.uninstall_all();
		assert_eq!(controller.state(MonitorType::KERNEL_EXCEPTION), MonitorState::Uninstalled);
		assert_eq!(controller.state(MonitorType::SIGNAL), MonitorState::Uninstalled);
		assert_eq!(controller.active(), MonitorType::NONE);
	}

	#[test]
	fn active_set_follows_the_monitors() {
		let log = Log::default();
		let mut controller = controller(MonitorType::NONE, &log);
		controller.set_active(MonitorType::SIGNAL | MonitorType::PANIC);

		// A monitor that shut itself down is no longer active or uninstalled again.
		let panic = controller
			.monitors
			.iter_mut()
			.find(|m| m.monitor_type() == MonitorType::PANIC)
			.unwrap();
		panic.uninstall();
		assert_eq!(controller.active(), MonitorType::SIGNAL);

		log.lock().unwrap().clear();
		controller.uninstall_all();
		assert_eq!(*log.lock().unwrap(), vec!["-signal"]);
		assert_eq!(controller.state(MonitorType::PANIC), MonitorState::Uninstalled);
	}

	#[test]
	fn reinstall_tears_down_previous_set_first() {
		let log = Log::default();
		let mut controller = controller(MonitorType::NONE, &log);
		controller.set_active(MonitorType::SIGNAL | MonitorType::PANIC);
		log.lock().unwrap().clear();
		controller.set_active(MonitorType::PANIC);
		assert_eq!(*log.lock().unwrap(), vec!["-panic", "-signal", "+panic"]);
	}

	#[test]
	fn debugger_masks_unsafe_monitors() {
		let log = Log::default();
		let mut controller = controller(MonitorType::NONE, &log).with_debugger_check(|| true);
		let installed = controller.set_active(MonitorType::SIGNAL | MonitorType::USER_REPORTED);
		assert_eq!(installed, MonitorType::USER_REPORTED);
		assert_eq!(controller.state(MonitorType::SIGNAL), MonitorState::Uninstalled);
	}

	proptest! {
		#[test]
		fn installed_is_subset_of_requested(requested in 0u32..0x200, failing in 0u32..0x200) {
			let log = Log::default();
			let requested = MonitorType::from_bits_truncate(requested);
			let mut controller = controller(MonitorType::from_bits_truncate(failing), &log);
			let installed = controller.set_active(requested);
			prop_assert!(requested.contains(installed));
			for monitor in &controller.monitors {
				prop_assert_eq!(monitor.is_enabled(), installed.contains(monitor.monitor_type()));
			}
		}
	}
}
