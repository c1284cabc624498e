// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared fatal-signal path for the signal and kernel-exception monitors.

use std::ffi::c_void;
use std::sync::Mutex;

use loom_crash_core::MonitorType;
use tracing::debug;

use super::handoff;
use super::sigaction::HandlerTable;
use super::STATES;
use crate::context::TriggerInfo;
use crate::guard::{self, Claim};
use crate::runtime::{CrashRuntime, CrashedThread};
use crate::sys::{self, AltStack};
use crate::writer::ErrorDetail;

pub(crate) static SIGNAL_HANDLERS: HandlerTable<8> = HandlerTable::new();
pub(crate) static KERNEL_HANDLERS: HandlerTable<5> = HandlerTable::new();

static ALT_STACK: Mutex<Option<AltStack>> = Mutex::new(None);

const REENTRANT_MESSAGE: &[u8] = b"loom-crash: fatal signal while writing a crash report\n";

/// Gives the installing thread an alternate signal stack large enough for
/// the in-place capture path.
pub(crate) fn ensure_alt_stack() {
	if let Ok(mut slot) = ALT_STACK.lock() {
		if slot.is_none() {
			*slot = AltStack::install_if_needed();
			debug!(size = sys::alt_stack_size(), "Alternate signal stack ready");
		}
	}
}

/// Drops our alternate stack once no fatal handler needs it.
pub(crate) fn release_alt_stack() {
	if SIGNAL_HANDLERS.is_empty() && KERNEL_HANDLERS.is_empty() {
		if let Ok(mut slot) = ALT_STACK.lock() {
			slot.take();
		}
	}
}

/// Puts back every action this library replaced, newest first.
/// Async-signal-safe.
pub(crate) fn restore_all() {
	SIGNAL_HANDLERS.restore();
	KERNEL_HANDLERS.restore();
}

/// Whether returning from the handler re-executes the faulting instruction.
fn refaults(signal: libc::c_int, info: *const libc::siginfo_t) -> bool {
	if info.is_null() {
		return false;
	}
	// SAFETY: the kernel passed a valid siginfo.
	let code = unsafe { (*info).si_code };
	code > 0 && matches!(signal, libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE)
}

/// Lets the previous action see the signal once handlers are restored.
///
/// A kernel-generated fault re-faults on return and reaches the restored
/// handler with its original siginfo; anything else is raised again and
/// delivered when this handler returns.
pub(crate) fn chain(signal: libc::c_int, info: *const libc::siginfo_t) {
	if !refaults(signal, info) {
		// SAFETY: raise is async-signal-safe.
		unsafe { libc::raise(signal) };
	}
}

pub(crate) fn trigger_from(
	monitor: MonitorType,
	signal: libc::c_int,
	info: *const libc::siginfo_t,
) -> TriggerInfo {
	let mut trigger = TriggerInfo::now(monitor);
	trigger.signal = signal;
	if !info.is_null() {
		// SAFETY: the kernel passed a valid siginfo.
		unsafe {
			trigger.signal_code = (*info).si_code;
			if matches!(signal, libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE) {
				trigger.fault_address = Some((*info).si_addr() as u64);
			}
		}
	}
	trigger
}

/// Second fault on the thread already writing: say so, then let it die.
pub(crate) fn reentrant(signal: libc::c_int) {
	sys::write_stderr(REENTRANT_MESSAGE);
	restore_all();
	// SAFETY: raise is async-signal-safe.
	unsafe { libc::raise(signal) };
}

/// Another thread is writing: give it time, then chain without writing.
pub(crate) fn wait_then_chain(signal: libc::c_int, info: *const libc::siginfo_t) {
	let deadline = sys::monotonic_ms() + guard::FATAL_WAIT_MS;
	while guard::is_held() && sys::monotonic_ms() < deadline {
		sys::sleep_ms(5);
	}
	restore_all();
	chain(signal, info);
}

/// Records a fatal signal, then chains.
///
/// The capture thread does the work while this thread waits; the handler
/// records in place only when that thread cannot serve it.
pub(crate) fn handle_fatal(
	monitor: MonitorType,
	signal: libc::c_int,
	info: *mut libc::siginfo_t,
	uc: *mut c_void,
) {
	let _errno = sys::ErrnoGuard::save();
	let token = match guard::try_claim() {
		Claim::Acquired(token) => token,
		Claim::Reentrant => return reentrant(signal),
		Claim::Busy => return wait_then_chain(signal, info),
	};

	if !handoff::forward(monitor, signal, info, uc) {
		let trigger = trigger_from(monitor, signal, info);
		// SAFETY: we hold the guard; `uc` belongs to this thread's handler frame.
		unsafe {
			if let Some(runtime) = CrashRuntime::current_in_handler() {
				runtime.record_fatal(
					trigger,
					CrashedThread::Context {
						tid: trigger.thread_id,
						uc,
					},
					ErrorDetail::of_kind(handoff::error_kind(monitor)),
					&[],
				);
			}
		}
	}
	STATES.mark_triggered(monitor);
	restore_all();
	drop(token);
	chain(signal, info);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::monitors::signal::SignalMonitor;
	use crate::monitors::Monitor;

	#[test]
	fn only_kernel_faults_refault() {
		// SAFETY: a zeroed siginfo is a valid value to inspect.
		let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
		info.si_code = 1;
		assert!(refaults(libc::SIGSEGV, &info));
		assert!(!refaults(libc::SIGABRT, &info));
		assert!(!refaults(libc::SIGTRAP, &info));

		info.si_code = -6;
		assert!(!refaults(libc::SIGSEGV, &info));
		assert!(!refaults(libc::SIGSEGV, std::ptr::null()));
	}

	const REENTRANT_CHILD: &str = "LOOM_CRASH_REENTRANT_CHILD";

	/// Faults while this thread already holds the capture guard. A no-op
	/// outside the child process.
	#[test]
	fn reentrant_fault_child() {
		if std::env::var_os(REENTRANT_CHILD).is_none() {
			return;
		}
		let mut monitor = SignalMonitor::default();
		monitor.install().unwrap();
		let Claim::Acquired(_token) = guard::try_claim() else {
			panic!("guard should be free");
		};
		// SAFETY: deliberately invalid.
		unsafe { std::ptr::null_mut::<u64>().write_volatile(1) };
		unreachable!("the child should have died");
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn reentrant_fault_is_reported_and_dies_with_the_signal() {
		use std::os::unix::process::ExitStatusExt;

		let output = std::process::Command::new(std::env::current_exe().unwrap())
			.args([
				"--exact",
				"monitors::fatal::tests::reentrant_fault_child",
				"--nocapture",
				"--test-threads=1",
			])
			.env(REENTRANT_CHILD, "1")
			.output()
			.unwrap();
		assert_eq!(output.status.signal(), Some(libc::SIGSEGV));
		let stderr = String::from_utf8_lossy(&output.stderr);
		assert!(stderr.contains("fatal signal while writing a crash report"), "{stderr}");
	}

	#[test]
	fn trigger_carries_fault_address() {
		// SAFETY: a zeroed siginfo is a valid value to inspect.
		let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
		info.si_code = 1;
		let trigger = trigger_from(MonitorType::SIGNAL, libc::SIGABRT, &info);
		assert_eq!(trigger.signal, libc::SIGABRT);
		assert_eq!(trigger.signal_code, 1);
		assert_eq!(trigger.fault_address, None);
		assert_eq!(trigger.thread_id, sys::current_thread_id());
	}
}
