// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Hardware-fault monitor.
//!
//! Owns the exception signals and routes every fault to the capture thread,
//! which records the faulting thread while it is stopped in its handler.
//! When the signal monitor is installed on top, it forwards these signals
//! here so the fault is reported as a kernel exception.

use std::ffi::c_void;

use loom_crash_core::{CrashError, MonitorType};
use tracing::debug;

use super::fatal::{self, KERNEL_HANDLERS};
use super::{handoff, Monitor};

pub(crate) const EXCEPTION_SIGNALS: [libc::c_int; 5] = [
	libc::SIGSEGV,
	libc::SIGBUS,
	libc::SIGILL,
	libc::SIGFPE,
	libc::SIGTRAP,
];

/// Signal handler for the exception signals; also called by the signal
/// monitor when this monitor owns the signal.
pub(crate) extern "C" fn handle_exception(
	signal: libc::c_int,
	info: *mut libc::siginfo_t,
	uc: *mut c_void,
) {
	fatal::handle_fatal(MonitorType::KERNEL_EXCEPTION, signal, info, uc);
}

#[derive(Default)]
pub(crate) struct KernelExceptionMonitor {
	enabled: bool,
}

impl Monitor for KernelExceptionMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::KERNEL_EXCEPTION
	}

	fn install(&mut self) -> Result<(), CrashError> {
		handoff::acquire("kernel_exception")?;
		fatal::ensure_alt_stack();
		match KERNEL_HANDLERS.install(&EXCEPTION_SIGNALS, handle_exception, true) {
			Ok(installed) => {
				debug!(signals = installed, "Installed exception handlers");
				self.enabled = true;
				Ok(())
			}
			Err(e) => {
				handoff::release();
				Err(CrashError::install("kernel_exception", e.to_string()))
			}
		}
	}

	fn uninstall(&mut self) {
		if !self.enabled {
			return;
		}
		KERNEL_HANDLERS.restore();
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
	use crate::monitors::signal::{SignalMonitor, FATAL_SIGNALS};
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
	fn starts_and_stops_the_capture_thread() {
		let mut monitor = KernelExceptionMonitor::default();
		monitor.install().unwrap();
		assert!(monitor.is_enabled());
		assert!(KERNEL_HANDLERS.handles(libc::SIGSEGV));
		assert!(!KERNEL_HANDLERS.handles(libc::SIGABRT));
		assert!(handoff::is_running());

		monitor.uninstall();
		assert!(!monitor.is_enabled());
		assert!(KERNEL_HANDLERS.is_empty());
		assert!(!handoff::is_running());
	}

	#[test]
	#[serial(signal_handlers)]
	fn stacked_with_signal_monitor_restores_in_order() {
		let before: Vec<usize> = FATAL_SIGNALS.iter().map(|s| current_handler(*s)).collect();

		let mut kernel = KernelExceptionMonitor::default();
		let mut signal = SignalMonitor::default();
		kernel.install().unwrap();
		signal.install().unwrap();
		assert!(handoff::is_running());
		assert!(KERNEL_HANDLERS.handles(libc::SIGSEGV));
		assert!(!KERNEL_HANDLERS.handles(libc::SIGABRT));

		// Both tables restored newest first, as the fatal path does.
		fatal::restore_all();
		let after: Vec<usize> = FATAL_SIGNALS.iter().map(|s| current_handler(*s)).collect();
		assert_eq!(after, before);

		signal.uninstall();
		assert!(handoff::is_running());
		kernel.uninstall();
		assert!(!handoff::is_running());
		let after: Vec<usize> = FATAL_SIGNALS.iter().map(|s| current_handler(*s)).collect();
		assert_eq!(after, before);
	}
}
