// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reports raised directly by the application.

use loom_crash_core::{CrashError, ErrorKind, ExceptionInfo, MonitorState, MonitorType, ReportId};
use tracing::{info, warn};

use super::{fatal, Monitor, STATES};
use crate::backtrace::{capture_backtrace, parse_frame_line};
use crate::context::TriggerInfo;
use crate::error::{CrashSdkError, Result};
use crate::runtime::{CrashRuntime, CrashedThread};

/// An application-level error to record as a crash report.
///
/// Without an explicit stack trace the calling thread's backtrace is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserException {
	pub name: String,
	pub reason: Option<String>,
	pub language: Option<String>,
	pub line_of_code: Option<String>,
	/// Frames in text form, one per line, innermost first.
	pub stack_trace: Option<String>,
	pub log_all_threads: bool,
	/// Abort the process once the report is published.
	pub terminate_program: bool,
}

impl UserException {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Default::default()
		}
	}

	pub fn reason(mut self, reason: impl Into<String>) -> Self {
		self.reason = Some(reason.into());
		self
	}

	pub fn language(mut self, language: impl Into<String>) -> Self {
		self.language = Some(language.into());
		self
	}

	pub fn line_of_code(mut self, line: impl Into<String>) -> Self {
		self.line_of_code = Some(line.into());
		self
	}

	pub fn stack_trace(mut self, trace: impl Into<String>) -> Self {
		self.stack_trace = Some(trace.into());
		self
	}

	pub fn log_all_threads(mut self, enabled: bool) -> Self {
		self.log_all_threads = enabled;
		self
	}

	pub fn terminate_program(mut self, enabled: bool) -> Self {
		self.terminate_program = enabled;
		self
	}

	fn to_exception_info(&self) -> ExceptionInfo {
		let stack = match &self.stack_trace {
			Some(trace) => trace.lines().filter_map(parse_frame_line).collect(),
			None => capture_backtrace(),
		};
		ExceptionInfo {
			name: self.name.clone(),
			reason: self.reason.clone(),
			language: self.language.clone(),
			line_of_code: self.line_of_code.clone(),
			location: None,
			thread_name: std::thread::current().name().map(str::to_string),
			stack,
		}
	}
}

/// Gate for user-reported captures; it has nothing to attach.
#[derive(Default)]
pub(crate) struct UserReportedMonitor {
	enabled: bool,
}

impl Monitor for UserReportedMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::USER_REPORTED
	}

	fn install(&mut self) -> std::result::Result<(), CrashError> {
		self.enabled = true;
		Ok(())
	}

	fn uninstall(&mut self) {
		self.enabled = false;
	}

	fn is_enabled(&self) -> bool {
		self.enabled
	}
}

/// Writes a user-reported exception and returns the new report's ID.
pub(crate) fn report(runtime: &CrashRuntime, exception: &UserException) -> Result<ReportId> {
	if STATES.get(MonitorType::USER_REPORTED) != MonitorState::Installed {
		return Err(CrashSdkError::MonitorDisabled(MonitorType::USER_REPORTED));
	}
	let info = exception.to_exception_info();
	let id = runtime.record_nonfatal(
		TriggerInfo::now(MonitorType::USER_REPORTED),
		CrashedThread::Current,
		ErrorKind::User,
		Some(&info),
		None,
		exception.log_all_threads,
	)?;
	info!(report_id = %id, name = %exception.name, "Recorded user-reported exception");

	if exception.terminate_program {
		warn!(report_id = %id, "Terminating after user-reported exception");
		fatal::restore_all();
		std::process::abort();
	}
	Ok(id)
}
