// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fatal POSIX signal monitor.

use std::ffi::c_void;

use loom_crash_core::{CrashError, MonitorType};
use tracing::debug;

use super::fatal::{self, KERNEL_HANDLERS, SIGNAL_HANDLERS};
use super::{handoff, kernel, Monitor};

pub(crate) const FATAL_SIGNALS: [libc::c_int; 8] = [
	libc::SIGABRT,
	libc::SIGBUS,
	libc::SIGFPE,
	libc::SIGILL,
	libc::SIGPIPE,
	libc::SIGSEGV,
	libc::SIGSYS,
	libc::SIGTRAP,
];

extern "C" fn handle_signal(signal: libc::c_int, info: *mut libc::siginfo_t, uc: *mut c_void) {
	if KERNEL_HANDLERS.handles(signal) {
		kernel::handle_exception(signal, info, uc);
		return;
	}
	fatal::handle_fatal(MonitorType::SIGNAL, signal, info, uc);
}

#[derive(Default)]
pub(crate) struct SignalMonitor {
	enabled: bool,
}

impl Monitor for SignalMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::SIGNAL
	}

	fn install(&mut self) -> Result<(), CrashError> {
		handoff::acquire("signal")?;
		fatal::ensure_alt_stack();
		let installed = match SIGNAL_HANDLERS.install(&FATAL_SIGNALS, handle_signal, true) {
			Ok(installed) => installed,
			Err(e) => {
				handoff::release();
				return Err(CrashError::install("signal", e.to_string()));
			}
		};
		debug!(signals = installed, "Installed fatal signal handlers");
		self.enabled = true;
		Ok(())
	}

	fn uninstall(&mut self) {
		if !self.enabled {
			return;
		}
		SIGNAL_HANDLERS.restore();
		handoff::release();
		fatal::release_alt_stack();
		self.enabled = false;
	}

	fn is_enabled(&self) -> bool {
		self.enabled
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serial_test::serial;

	fn current_handler(signal: libc::c_int) -> usize {
		// SAFETY: query only.
		unsafe {
			let mut current: libc::sigaction = std::mem::zeroed();
			libc::sigaction(signal, std::ptr::null(), &mut current);
			current.sa_sigaction
		}
	}

	#[test]
	#[serial(signal_handlers)]
	fn install_and_uninstall_restore_previous_actions() {
		let before = current_handler(libc::SIGSEGV);
		let mut monitor = SignalMonitor::default();
		monitor.install().unwrap();
		assert!(monitor.is_enabled());
		assert!(monitor.is_async_signal_safe());
		assert!(SIGNAL_HANDLERS.handles(libc::SIGSEGV));
		assert_ne!(current_handler(libc::SIGSEGV), before);

		monitor.uninstall();
		assert!(!monitor.is_enabled());
		assert_eq!(current_handler(libc::SIGSEGV), before);
	}
}
