// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Uncaught exceptions from foreign runtimes.
//!
//! Embedded runtimes (a scripting VM, a JVM bridge, C++ `std::terminate`)
//! report through one process-wide handler slot, either from Rust with
//! [`report_foreign_exception`] or over the C ABI entry point
//! `loom_crash_report_foreign_exception`.

use std::ffi::{c_char, CStr};
use std::sync::{Arc, RwLock};

use loom_crash_core::{CrashError, ErrorKind, ExceptionInfo, Frame, MonitorType};
use tracing::warn;

use super::Monitor;
use crate::backtrace::parse_frame_line;
use crate::context::TriggerInfo;
use crate::runtime::{CrashRuntime, CrashedThread};

/// An exception a foreign runtime could not handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForeignException {
	pub language: String,
	pub type_name: String,
	pub reason: Option<String>,
	/// Frames as the foreign runtime reported them, innermost first.
	pub stack: Vec<Frame>,
}

impl ForeignException {
	pub fn new(language: impl Into<String>, type_name: impl Into<String>) -> Self {
		Self {
			language: language.into(),
			type_name: type_name.into(),
			..Default::default()
		}
	}

	pub fn reason(mut self, reason: impl Into<String>) -> Self {
		self.reason = Some(reason.into());
		self
	}

	/// Parses textual frames, one per line.
	pub fn stack_trace(mut self, trace: &str) -> Self {
		self.stack = trace.lines().filter_map(parse_frame_line).collect();
		self
	}

	fn to_exception_info(&self) -> ExceptionInfo {
		ExceptionInfo {
			name: self.type_name.clone(),
			reason: self.reason.clone(),
			language: Some(self.language.clone()),
			thread_name: std::thread::current().name().map(str::to_string),
			stack: self.stack.clone(),
			..Default::default()
		}
	}
}

pub type ForeignExceptionHandler = Arc<dyn Fn(&ForeignException) + Send + Sync>;

static HANDLER: RwLock<Option<ForeignExceptionHandler>> = RwLock::new(None);

/// Replaces the process-wide handler, returning the one it displaced so the
/// caller can chain to it.
pub fn set_foreign_exception_handler(
	handler: Option<ForeignExceptionHandler>,
) -> Option<ForeignExceptionHandler> {
	match HANDLER.write() {
		Ok(mut slot) => std::mem::replace(&mut *slot, handler),
		Err(_) => None,
	}
}

/// Delivers an exception to the installed handler. Returns false when no
/// handler is installed.
pub fn report_foreign_exception(exception: &ForeignException) -> bool {
	let handler = HANDLER.read().ok().and_then(|slot| slot.clone());
	match handler {
		Some(handler) => {
			handler(exception);
			true
		}
		None => false,
	}
}

/// C ABI entry point for foreign runtimes.
///
/// Returns 1 when a handler received the exception, 0 otherwise.
///
/// # Safety
///
/// String arguments must be null or NUL-terminated. `frames` must be null or
/// point at `frame_count` such strings.
#[no_mangle]
pub unsafe extern "C" fn loom_crash_report_foreign_exception(
	language: *const c_char,
	type_name: *const c_char,
	reason: *const c_char,
	frames: *const *const c_char,
	frame_count: usize,
) -> i32 {
	// SAFETY: per the function contract.
	let text = |ptr: *const c_char| unsafe {
		(!ptr.is_null()).then(|| CStr::from_ptr(ptr).to_string_lossy().into_owned())
	};
	let mut exception = ForeignException::new(
		text(language).unwrap_or_else(|| "unknown".to_string()),
		text(type_name).unwrap_or_else(|| "unknown".to_string()),
	);
	exception.reason = text(reason);
	if !frames.is_null() {
		// SAFETY: per the function contract.
		let lines = unsafe { std::slice::from_raw_parts(frames, frame_count) };
		exception.stack = lines
			.iter()
			.filter_map(|line| text(*line))
			.filter_map(|line| parse_frame_line(&line))
			.collect();
	}
	report_foreign_exception(&exception) as i32
}

fn record(exception: &ForeignException) {
	let Some(runtime) = CrashRuntime::current() else {
		return;
	};
	let info = exception.to_exception_info();
	if let Err(e) = runtime.record_nonfatal(
		TriggerInfo::now(MonitorType::FOREIGN_EXCEPTION),
		CrashedThread::Current,
		ErrorKind::ForeignException,
		Some(&info),
		None,
		true,
	) {
		warn!(error = %e, language = %exception.language, "Failed to record foreign exception");
	}
}

#[derive(Default)]
pub(crate) struct ForeignExceptionMonitor {
	installed: bool,
	previous: Option<ForeignExceptionHandler>,
}

impl Monitor for ForeignExceptionMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::FOREIGN_EXCEPTION
	}

	fn install(&mut self) -> Result<(), CrashError> {
		if self.installed {
			return Ok(());
		}
		let mut slot = HANDLER
			.write()
			.map_err(|_| CrashError::install("foreign_exception", "handler slot poisoned"))?;
		let previous = slot.clone();
		let chained = previous.clone();
		*slot = Some(Arc::new(move |exception: &ForeignException| {
			record(exception);
			if let Some(previous) = &chained {
				previous(exception);
			}
		}));
		drop(slot);
		self.previous = previous;
		self.installed = true;
		Ok(())
	}

	fn uninstall(&mut self) {
		if self.installed {
			set_foreign_exception_handler(self.previous.take());
			self.installed = false;
		}
	}

	fn is_enabled(&self) -> bool {
		self.installed
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serial_test::serial;
	use std::ffi::CString;
	use std::sync::Mutex;

	#[test]
	#[serial(foreign_handler, capture_guard)]
	fn monitor_chains_and_restores_previous_handler() {
		let seen: Arc<Mutex<Vec<String>>> = Arc::default();
		let sink = Arc::clone(&seen);
		set_foreign_exception_handler(Some(Arc::new(move |e: &ForeignException| {
			sink.lock().unwrap().push(e.type_name.clone());
		})));

		let mut monitor = ForeignExceptionMonitor::default();
		monitor.install().unwrap();
		assert!(report_foreign_exception(&ForeignException::new("python", "KeyError")));
		monitor.uninstall();
		assert!(report_foreign_exception(&ForeignException::new("python", "ValueError")));

		assert_eq!(*seen.lock().unwrap(), vec!["KeyError", "ValueError"]);
		set_foreign_exception_handler(None);
		assert!(!report_foreign_exception(&ForeignException::new("python", "Lost")));
	}

	#[test]
	#[serial(foreign_handler, capture_guard)]
	fn c_entry_point_parses_arguments() {
		let captured: Arc<Mutex<Option<ForeignException>>> = Arc::default();
		let sink = Arc::clone(&captured);
		set_foreign_exception_handler(Some(Arc::new(move |e: &ForeignException| {
			*sink.lock().unwrap() = Some(e.clone());
		})));

		let language = CString::new("cpp").unwrap();
		let type_name = CString::new("std::runtime_error").unwrap();
		let reason = CString::new("bad state").unwrap();
		let frame_a = CString::new("0: engine::tick").unwrap();
		let frame_b = CString::new("1: engine::run").unwrap();
		let frames = [frame_a.as_ptr(), frame_b.as_ptr()];
		// SAFETY: every pointer is a live NUL-terminated string.
		let delivered = unsafe {
			loom_crash_report_foreign_exception(
				language.as_ptr(),
				type_name.as_ptr(),
				reason.as_ptr(),
				frames.as_ptr(),
				frames.len(),
			)
		};
		set_foreign_exception_handler(None);

		assert_eq!(delivered, 1);
		let exception = captured.lock().unwrap().clone().unwrap();
		assert_eq!(exception.language, "cpp");
		assert_eq!(exception.reason.as_deref(), Some("bad state"));
		assert_eq!(exception.stack.len(), 2);
		assert_eq!(exception.stack[0].function.as_deref(), Some("engine::tick"));
	}

	#[test]
	fn stack_trace_skips_location_lines() {
		let exception = ForeignException::new("rust", "Error")
			.reason("failed")
			.stack_trace("0: app::a\n      at src/a.rs:1\n1: app::b\n");
		assert_eq!(exception.stack.len(), 2);
	}
}
