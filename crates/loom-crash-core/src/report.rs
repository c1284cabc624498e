// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Decoded crash report document.
//!
//! Top-level shape: `{header, system, threads[], binaryImages[], user, crash}`.
//! Every section is optional because a report interrupted mid-write is still
//! readable up to its last intact record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::MonitorType;
use crate::ReportId;

/// A single language-level stack frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Frame {
	/// Function/method name
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function: Option<String>,
	/// Module/crate/package
	#[serde(skip_serializing_if = "Option::is_none")]
	pub module: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub filename: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub lineno: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub colno: Option<u32>,
	/// User code vs dependency
	pub in_app: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub instruction_addr: Option<u64>,
}

impl Frame {
	/// A frame that only carries a symbol name.
	pub fn symbol(name: impl Into<String>) -> Self {
		Self {
			function: Some(name.into()),
			..Default::default()
		}
	}
}

impl From<&str> for Frame {
	fn from(name: &str) -> Self {
		Self::symbol(name)
	}
}

/// Report header: identity and trigger basics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportHeader {
	pub format_version: u32,
	pub report_id: u64,
	pub uuid: String,
	pub session_id: String,
	pub app_name: String,
	pub pid: i32,
	pub monitor: MonitorType,
	/// Microseconds since the Unix epoch.
	pub timestamp_us: u64,
	pub crashed_thread_id: u64,
	pub on_main_thread: bool,
}

impl ReportHeader {
	pub fn timestamp(&self) -> Option<DateTime<Utc>> {
		let micros = i64::try_from(self.timestamp_us).ok()?;
		DateTime::<Utc>::from_timestamp_micros(micros)
	}
}

/// Raw memory copied from around an address of interest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySample {
	pub address: u64,
	/// Hex-encoded bytes; empty when the address was unreadable.
	pub bytes: String,
	pub readable: bool,
}

/// One thread's snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadRecord {
	pub index: u32,
	pub id: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub crashed: bool,
	pub current: bool,
	pub registers: BTreeMap<String, u64>,
	pub registers_truncated: bool,
	/// Return addresses, innermost first.
	pub frames: Vec<u64>,
	pub frames_truncated: bool,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub memory: Vec<MemorySample>,
}

/// A loaded module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryImage {
	pub path: String,
	pub load_address: u64,
	pub size: u64,
	/// GNU build-id, hex.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub uuid: Option<String>,
}

impl BinaryImage {
	pub fn contains(&self, address: u64) -> bool {
		address >= self.load_address && address - self.load_address < self.size
	}

	pub fn file_name(&self) -> &str {
		self.path.rsplit('/').next().unwrap_or(&self.path)
	}
}

/// Category of the triggering event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	#[default]
	Signal,
	KernelException,
	Panic,
	ForeignException,
	Deadlock,
	User,
}

impl ErrorKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Signal => "signal",
			Self::KernelException => "kernel_exception",
			Self::Panic => "panic",
			Self::ForeignException => "foreign_exception",
			Self::Deadlock => "deadlock",
			Self::User => "user",
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalInfo {
	pub signo: i32,
	pub code: i32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code_name: Option<String>,
}

/// A language-level exception: panic, foreign exception or user report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionInfo {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub language: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub line_of_code: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub location: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thread_name: Option<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub stack: Vec<Frame>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInfo {
	pub kind: ErrorKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub signal: Option<SignalInfo>,
	/// Faulting address, when the trigger has one.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub address: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub exception: Option<ExceptionInfo>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub deadlock_interval_ms: Option<u64>,
}

/// Last bad access seen by an object-lifecycle tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZombieRecord {
	pub address: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub class_name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashInfo {
	pub monitor: MonitorType,
	pub error: ErrorInfo,
	pub thread_count: u32,
	pub threads_truncated: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub zombie: Option<ZombieRecord>,
}

/// A stored report as read back from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
	pub id: ReportId,
	/// The end marker was present.
	pub complete: bool,
	pub header: Option<ReportHeader>,
	pub system: Option<serde_json::Value>,
	#[serde(default)]
	pub threads: Vec<ThreadRecord>,
	#[serde(default, rename = "binaryImages")]
	pub binary_images: Vec<BinaryImage>,
	pub user: Option<serde_json::Value>,
	pub crash: Option<CrashInfo>,
	/// Tail of the application's log at the time of the crash.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub console_log: Option<String>,
	/// Added by send filters; never written by the capture path.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub annotations: BTreeMap<String, serde_json::Value>,
	/// Records that were present but could not be decoded.
	#[serde(default)]
	pub damaged_sections: u32,
}

impl CrashReport {
	pub fn empty(id: ReportId) -> Self {
		Self {
			id,
			complete: false,
			header: None,
			system: None,
			threads: Vec::new(),
			binary_images: Vec::new(),
			user: None,
			crash: None,
			console_log: None,
			annotations: BTreeMap::new(),
			damaged_sections: 0,
		}
	}

	pub fn crashed_thread(&self) -> Option<&ThreadRecord> {
		self.threads.iter().find(|t| t.crashed)
	}

	pub fn error_kind(&self) -> Option<ErrorKind> {
		self.crash.as_ref().map(|c| c.error.kind)
	}

	pub fn exception(&self) -> Option<&ExceptionInfo> {
		self.crash.as_ref().and_then(|c| c.error.exception.as_ref())
	}

	/// The image containing `address`, if any.
	pub fn image_for(&self, address: u64) -> Option<&BinaryImage> {
		self.binary_images.iter().find(|img| img.contains(address))
	}

	/// One-line description used by listings.
	pub fn summary(&self) -> String {
		let Some(crash) = &self.crash else {
			return if self.complete {
				"no crash section".to_string()
			} else {
				"incomplete report".to_string()
			};
		};
		match (&crash.error.signal, &crash.error.exception) {
			(_, Some(exc)) => match &exc.reason {
				Some(reason) => format!("{}: {}: {}", crash.error.kind.as_str(), exc.name, reason),
				None => format!("{}: {}", crash.error.kind.as_str(), exc.name),
			},
			(Some(sig), None) => format!(
				"{}: {}",
				crash.error.kind.as_str(),
				sig.name.clone().unwrap_or_else(|| format!("signal {}", sig.signo))
			),
			(None, None) => crash.error.kind.as_str().to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_timestamp_converts_micros() {
		let header = ReportHeader {
			timestamp_us: 1_700_000_000_123_456,
			..Default::default()
		};
		let ts = header.timestamp().unwrap();
		assert_eq!(ts.timestamp(), 1_700_000_000);
		assert_eq!(ts.timestamp_subsec_micros(), 123_456);
	}

	#[test]
	fn binary_image_lookup() {
		let mut report = CrashReport::empty(ReportId(1));
		report.binary_images.push(BinaryImage {
			path: "/usr/lib/libfoo.so".to_string(),
			load_address: 0x1000,
			size: 0x100,
			uuid: None,
		});
		assert_eq!(report.image_for(0x10ff).map(|i| i.file_name()), Some("libfoo.so"));
		assert!(report.image_for(0x1100).is_none());
		assert!(report.image_for(0x0fff).is_none());
	}

	#[test]
	fn thread_record_tolerates_missing_fields() {
		let record: ThreadRecord = serde_json::from_str(r#"{"id":7,"frames":[1,2]}"#).unwrap();
		assert_eq!(record.id, 7);
		assert_eq!(record.frames, vec![1, 2]);
		assert!(record.registers.is_empty());
		assert!(!record.crashed);
	}

	#[test]
	fn summary_prefers_exception() {
		let mut report = CrashReport::empty(ReportId(3));
		report.crash = Some(CrashInfo {
			monitor: MonitorType::USER_REPORTED,
			error: ErrorInfo {
				kind: ErrorKind::User,
				exception: Some(ExceptionInfo {
					name: "QuotaExceeded".to_string(),
					reason: Some("disk full".to_string()),
					..Default::default()
				}),
				..Default::default()
			},
			..Default::default()
		});
		assert_eq!(report.summary(), "user: QuotaExceeded: disk full");
	}

	#[test]
	fn summary_of_incomplete_report() {
		let report = CrashReport::empty(ReportId(4));
		assert_eq!(report.summary(), "incomplete report");
	}

	#[test]
	fn binary_images_use_camel_case_key() {
		let report = CrashReport::empty(ReportId(5));
		let json = serde_json::to_value(&report).unwrap();
		assert!(json.get("binaryImages").is_some());
	}
}
