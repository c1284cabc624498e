// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Panic hook integration.
//!
//! Panics are reported as non-fatal events: the report is written and
//! published, the slot re-armed, and then the previous hook runs.

use std::panic::PanicHookInfo;
use std::sync::Arc;

use loom_crash_core::{CrashError, ErrorKind, ExceptionInfo, MonitorType};
use tracing::warn;

use super::Monitor;
use crate::backtrace::capture_backtrace;
use crate::context::TriggerInfo;
use crate::runtime::{CrashRuntime, CrashedThread};

type PanicHook = dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static;

#[derive(Default)]
pub(crate) struct PanicMonitor {
	previous: Option<Arc<PanicHook>>,
}

impl Monitor for PanicMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::PANIC
	}

	fn install(&mut self) -> Result<(), CrashError> {
		if self.previous.is_some() {
			return Ok(());
		}
		let previous: Arc<PanicHook> = Arc::from(std::panic::take_hook());
		let chained = Arc::clone(&previous);
		std::panic::set_hook(Box::new(move |info| {
			report_panic(info);
			chained(info);
		}));
		self.previous = Some(previous);
		Ok(())
	}

	fn uninstall(&mut self) {
		if let Some(previous) = self.previous.take() {
			let _ours = std::panic::take_hook();
			std::panic::set_hook(Box::new(move |info| previous(info)));
		}
	}

	fn is_enabled(&self) -> bool {
		self.previous.is_some()
	}
}

pub(crate) fn panic_exception(info: &PanicHookInfo<'_>) -> ExceptionInfo {
	let thread = std::thread::current();
	ExceptionInfo {
		name: "panic".to_string(),
		reason: Some(extract_panic_message(info)),
		language: Some("rust".to_string()),
		location: info
			.location()
			.map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
		thread_name: thread.name().map(str::to_string),
		stack: capture_backtrace(),
		..Default::default()
	}
}

fn report_panic(info: &PanicHookInfo<'_>) {
	let Some(runtime) = CrashRuntime::current() else {
		return;
	};
	let exception = panic_exception(info);
	if let Err(e) = runtime.record_nonfatal(
		TriggerInfo::now(MonitorType::PANIC),
		CrashedThread::Current,
		ErrorKind::Panic,
		Some(&exception),
		None,
		true,
	) {
		warn!(error = %e, "Failed to record panic report");
	}
}

/// Extract the panic message from panic info.
fn extract_panic_message(info: &PanicHookInfo<'_>) -> String {
	if let Some(s) = info.payload().downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = info.payload().downcast_ref::<String>() {
		s.clone()
	} else {
		"Box<dyn Any>".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serial_test::serial;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Mutex;

	static SEEN: Mutex<Vec<ExceptionInfo>> = Mutex::new(Vec::new());
	static PREVIOUS_CALLS: AtomicUsize = AtomicUsize::new(0);

	#[test]
	#[serial(panic_hook, capture_guard)]
	fn hook_chains_to_previous_and_restores_it() {
		let original = std::panic::take_hook();
		std::panic::set_hook(Box::new(|info| {
			PREVIOUS_CALLS.fetch_add(1, Ordering::SeqCst);
			SEEN.lock().unwrap().push(panic_exception(info));
		}));

		let mut monitor = PanicMonitor::default();
		monitor.install().unwrap();
		assert!(monitor.is_enabled());
		let _ = std::panic::catch_unwind(|| panic!("first {}", 1));
		assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);

		monitor.uninstall();
		assert!(!monitor.is_enabled());
		let _ = std::panic::catch_unwind(|| panic!("second"));
		assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 2);

		let seen = SEEN.lock().unwrap().clone();
		assert_eq!(seen[0].reason.as_deref(), Some("first 1"));
		assert_eq!(seen[1].reason.as_deref(), Some("second"));
		assert!(seen[0].location.as_deref().unwrap().contains("panic.rs"));
		assert_eq!(seen[0].language.as_deref(), Some("rust"));
		assert!(!seen[0].stack.is_empty());

		std::panic::set_hook(original);
	}
}
