// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Launch, session and duration bookkeeping.
//!
//! Counters live in atomics so the crash path can read them and record the
//! crash without locking. The state file is opened once and rewritten in
//! place through that descriptor, including from a signal handler.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use loom_crash_core::app_state::APP_STATE_FORMAT_VERSION;
use loom_crash_core::AppStateRecord;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CrashSdkError, Result};
use crate::sys;
use crate::writer::{FdOutput, JsonWriter};

/// The state record is a few hundred bytes.
const RECORD_BUFFER: usize = 512;

/// Application state as seen right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppStateSnapshot {
	pub active_duration_since_last_crash: Duration,
	pub background_duration_since_last_crash: Duration,
	pub launches_since_last_crash: u64,
	pub sessions_since_last_crash: u64,
	pub active_duration_since_launch: Duration,
	pub background_duration_since_launch: Duration,
	pub sessions_since_launch: u64,
	pub crashed_last_launch: bool,
	pub application_active: bool,
	pub application_in_foreground: bool,
}

#[derive(Debug, Clone, Copy)]
struct Totals {
	active_since_crash_ms: u64,
	background_since_crash_ms: u64,
	sessions_since_crash: u64,
	active_since_launch_ms: u64,
	background_since_launch_ms: u64,
	sessions_since_launch: u64,
}

pub(crate) struct AppStateTracker {
	path: PathBuf,
	file: File,
	baseline: AppStateRecord,
	crashed_last_launch: bool,
	active: AtomicBool,
	foreground: AtomicBool,
	transition_ms: AtomicU64,
	active_ms: AtomicU64,
	background_ms: AtomicU64,
	sessions_since_launch: AtomicU64,
	crashed: AtomicBool,
	/// Serializes normal-thread transitions and saves.
	lock: Mutex<()>,
}

impl AppStateTracker {
	/// Loads the previous launch's record from `path` and counts this launch.
	pub(crate) fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref().to_path_buf();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let previous = match std::fs::read(&path) {
			Ok(bytes) if bytes.is_empty() => AppStateRecord::default(),
			Ok(bytes) => serde_json::from_slice::<AppStateRecord>(&bytes).unwrap_or_else(|e| {
				warn!(path = %path.display(), error = %e, "Discarding unreadable application state");
				AppStateRecord::default()
			}),
			Err(e) if e.kind() == io::ErrorKind::NotFound => AppStateRecord::default(),
			Err(e) => return Err(CrashSdkError::Io(e)),
		};
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.open(&path)?;

		let tracker = Self {
			crashed_last_launch: previous.crashed_last_launch,
			baseline: previous.next_launch(),
			path,
			file,
			active: AtomicBool::new(true),
			foreground: AtomicBool::new(true),
			transition_ms: AtomicU64::new(sys::monotonic_ms()),
			active_ms: AtomicU64::new(0),
			background_ms: AtomicU64::new(0),
			sessions_since_launch: AtomicU64::new(1),
			crashed: AtomicBool::new(false),
			lock: Mutex::new(()),
		};
		debug!(
			path = %tracker.path.display(),
			launches_since_last_crash = tracker.baseline.launches_since_last_crash,
			crashed_last_launch = tracker.crashed_last_launch,
			"Loaded application state"
		);
		tracker.save()?;
		Ok(tracker)
	}

	/// Folds the time since the last transition into the duration buckets.
	fn settle(&self) {
		let now = sys::monotonic_ms();
		let since = now.saturating_sub(self.transition_ms.swap(now, Ordering::AcqRel));
		if self.active.load(Ordering::Acquire) {
			self.active_ms.fetch_add(since, Ordering::AcqRel);
		}
		if !self.foreground.load(Ordering::Acquire) {
			self.background_ms.fetch_add(since, Ordering::AcqRel);
		}
	}

	/// Current totals including the interval still in progress. Async-signal-safe.
	fn totals(&self) -> Totals {
		let since = sys::monotonic_ms().saturating_sub(self.transition_ms.load(Ordering::Acquire));
		let mut active = self.active_ms.load(Ordering::Acquire);
		let mut background = self.background_ms.load(Ordering::Acquire);
		if self.active.load(Ordering::Acquire) {
			active += since;
		}
		if !self.foreground.load(Ordering::Acquire) {
			background += since;
		}
		let sessions = self.sessions_since_launch.load(Ordering::Acquire);
		Totals {
			active_since_crash_ms: self.baseline.active_duration_since_last_crash_ms + active,
			background_since_crash_ms: self.baseline.background_duration_since_last_crash_ms
				+ background,
			// The baseline already counts this launch's first session.
			sessions_since_crash: self.baseline.sessions_since_last_crash as u64
				+ sessions.saturating_sub(1),
			active_since_launch_ms: active,
			background_since_launch_ms: background,
			sessions_since_launch: sessions,
		}
	}

	pub(crate) fn notify_active(&self, active: bool) -> Result<()> {
		let _guard = self.lock.lock().map_err(|_| CrashSdkError::LockError)?;
		self.settle();
		self.active.store(active, Ordering::Release);
		Ok(())
	}

	/// Entering the foreground starts a new session; leaving it saves state.
	pub(crate) fn notify_foreground(&self, foreground: bool) -> Result<()> {
		let _guard = self.lock.lock().map_err(|_| CrashSdkError::LockError)?;
		self.settle();
		let was = self.foreground.swap(foreground, Ordering::AcqRel);
		if foreground && !was {
			self.sessions_since_launch.fetch_add(1, Ordering::AcqRel);
		}
		if !foreground && was {
			self.write_record()?;
		}
		Ok(())
	}

	pub(crate) fn notify_terminate(&self) -> Result<()> {
		let _guard = self.lock.lock().map_err(|_| CrashSdkError::LockError)?;
		self.settle();
		self.write_record()
	}

	fn save(&self) -> Result<()> {
		let _guard = self.lock.lock().map_err(|_| CrashSdkError::LockError)?;
		self.write_record()
	}

	/// A crash recorded this launch stays recorded.
	fn write_record(&self) -> Result<()> {
		if self.persist(self.crashed.load(Ordering::Acquire)) {
			Ok(())
		} else {
			Err(CrashSdkError::Io(io::Error::last_os_error()))
		}
	}

	/// Marks this launch as crashed in the state file. Async-signal-safe.
	pub(crate) fn record_crash(&self) -> bool {
		self.crashed.store(true, Ordering::Release);
		self.persist(true)
	}

	/// Rewrites the state file in place through the pre-opened descriptor.
	fn persist(&self, crashed: bool) -> bool {
		let fd = self.file.as_raw_fd();
		// SAFETY: lseek on our own open descriptor.
		if unsafe { libc::lseek(fd, 0, libc::SEEK_SET) } != 0 {
			return false;
		}
		let totals = self.totals();
		let mut buf = [0u8; RECORD_BUFFER];
		let mut out = FdOutput::new(fd, &mut buf);
		{
			let mut json = JsonWriter::new(&mut out);
			json.begin_object(None);
			json.field_u64("format_version", APP_STATE_FORMAT_VERSION as u64);
			json.field_bool("crashed_last_launch", crashed);
			json.field_u64("active_duration_since_last_crash_ms", totals.active_since_crash_ms);
			json.field_u64(
				"background_duration_since_last_crash_ms",
				totals.background_since_crash_ms,
			);
			json.field_u64(
				"launches_since_last_crash",
				self.baseline.launches_since_last_crash as u64,
			);
			json.field_u64("sessions_since_last_crash", totals.sessions_since_crash);
			json.end_object();
		}
		out.flush_buffer();
		let length = out.position();
		// SAFETY: ftruncate and fsync on our own open descriptor.
		let truncated = unsafe {
			let ok = libc::ftruncate(fd, length as libc::off_t) == 0;
			libc::fsync(fd);
			ok
		};
		truncated && !out.failed()
	}

	/// Emits the live application state as fields of the current object.
	/// Async-signal-safe.
	pub(crate) fn write_live<W: io::Write>(&self, json: &mut JsonWriter<'_, W>) {
		let totals = self.totals();
		json.field_u64("active_duration_since_last_crash_ms", totals.active_since_crash_ms);
		json.field_u64(
			"background_duration_since_last_crash_ms",
			totals.background_since_crash_ms,
		);
		json.field_u64(
			"launches_since_last_crash",
			self.baseline.launches_since_last_crash as u64,
		);
		json.field_u64("sessions_since_last_crash", totals.sessions_since_crash);
		json.field_u64("active_duration_since_launch_ms", totals.active_since_launch_ms);
		json.field_u64(
			"background_duration_since_launch_ms",
			totals.background_since_launch_ms,
		);
		json.field_u64("sessions_since_launch", totals.sessions_since_launch);
		json.field_bool("crashed_last_launch", self.crashed_last_launch);
		json.field_bool("application_active", self.active.load(Ordering::Acquire));
		json.field_bool(
			"application_in_foreground",
			self.foreground.load(Ordering::Acquire),
		);
	}

	pub(crate) fn snapshot(&self) -> AppStateSnapshot {
		let totals = self.totals();
		AppStateSnapshot {
			active_duration_since_last_crash: Duration::from_millis(totals.active_since_crash_ms),
			background_duration_since_last_crash: Duration::from_millis(
				totals.background_since_crash_ms,
			),
			launches_since_last_crash: self.baseline.launches_since_last_crash as u64,
			sessions_since_last_crash: totals.sessions_since_crash,
			active_duration_since_launch: Duration::from_millis(totals.active_since_launch_ms),
			background_duration_since_launch: Duration::from_millis(
				totals.background_since_launch_ms,
			),
			sessions_since_launch: totals.sessions_since_launch,
			crashed_last_launch: self.crashed_last_launch,
			application_active: self.active.load(Ordering::Acquire),
			application_in_foreground: self.foreground.load(Ordering::Acquire),
		}
	}

	/// True once this launch recorded a crash.
	#[cfg(test)]
	pub(crate) fn crashed_this_launch(&self) -> bool {
		self.crashed.load(Ordering::Acquire)
	}
}
