// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process-wide crash runtime.
//!
//! Signal handlers cannot receive arguments, so the state every monitor
//! records into is registered once per process and reached through an atomic
//! pointer. Registration happens when the reporter installs and ends when it
//! uninstalls. All capture goes through [`CrashRuntime::record_fatal`] or
//! [`CrashRuntime::record_nonfatal`], both gated by the capture guard.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use loom_crash_core::{ErrorKind, ExceptionInfo, ReportId};
use tracing::{debug, info};

use crate::app_state::AppStateTracker;
use crate::console_log::ConsoleLog;
use crate::context::{CaptureContext, CaptureLimits, TriggerInfo};
use crate::error::{CrashSdkError, Result};
use crate::guard::{self, Claim};
use crate::metadata::MetadataHub;
use crate::store::{ArmedSlot, FileReportStore};
use crate::writer::{self, ErrorDetail, PreparedView, ReportMeta, ReportWriter, WriteBuffer};
use crate::{snapshot, sys, unwind};

/// Called on a normal thread after a report was published.
pub type CrashCallback = Arc<dyn Fn(ReportId) + Send + Sync>;

const MAX_EXCLUDED: usize = 8;

/// Which thread the report marks as crashed, and how to record it.
#[derive(Clone, Copy)]
pub(crate) enum CrashedThread {
	/// A thread stopped in a signal handler, with its machine context.
	Context { tid: u64, uc: *const c_void },
	/// The calling thread.
	Current,
	/// Another thread, recorded through suspension like every other thread.
	Suspended { tid: u64 },
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeOptions {
	pub(crate) app_name: String,
	pub(crate) session_id: String,
	pub(crate) limits: CaptureLimits,
	pub(crate) snapshot_all_threads: bool,
	pub(crate) console_log: Option<ConsoleLog>,
}

pub(crate) struct CrashRuntime {
	options: RuntimeOptions,
	store: Arc<FileReportStore>,
	metadata: Arc<MetadataHub>,
	app_state: Arc<AppStateTracker>,
	app_state_enabled: AtomicBool,
	/// Written only by the thread holding the capture guard.
	context: UnsafeCell<CaptureContext>,
	/// Guarded like `context`.
	buffer: UnsafeCell<Box<WriteBuffer>>,
	on_crash: Option<CrashCallback>,
}

// SAFETY: `context` and `buffer` are only touched by the capture guard's owner; every other
// field is Sync.
unsafe impl Sync for CrashRuntime {}
// SAFETY: as above; the context holds plain data.
unsafe impl Send for CrashRuntime {}

static RUNTIME: AtomicPtr<CrashRuntime> = AtomicPtr::new(ptr::null_mut());
static REGISTERED: Mutex<Option<Arc<CrashRuntime>>> = Mutex::new(None);

impl CrashRuntime {
	pub(crate) fn new(
		options: RuntimeOptions,
		store: Arc<FileReportStore>,
		metadata: Arc<MetadataHub>,
		app_state: Arc<AppStateTracker>,
		on_crash: Option<CrashCallback>,
	) -> Self {
		Self {
			context: UnsafeCell::new(CaptureContext::new(options.limits)),
			buffer: UnsafeCell::new(writer::write_buffer()),
			options,
			store,
			metadata,
			app_state,
			app_state_enabled: AtomicBool::new(false),
			on_crash,
		}
	}

	/// Makes `runtime` the process-wide target of every monitor and arms
	/// the first report slot.
	pub(crate) fn register(runtime: Arc<CrashRuntime>) -> Result<()> {
		let mut registered = REGISTERED.lock().map_err(|_| CrashSdkError::LockError)?;
		if registered.is_some() {
			return Err(CrashSdkError::AlreadyInstalled);
		}
		runtime.rearm()?;
		snapshot::install(runtime.options.limits.introspect_memory);
		RUNTIME.store(Arc::as_ptr(&runtime) as *mut CrashRuntime, Ordering::Release);
		*registered = Some(runtime);
		info!("Registered crash runtime");
		Ok(())
	}

	/// Detaches the process-wide runtime and removes its unused report slot.
	pub(crate) fn unregister() -> Result<()> {
		let mut registered = REGISTERED.lock().map_err(|_| CrashSdkError::LockError)?;
		RUNTIME.store(ptr::null_mut(), Ordering::Release);
		let Some(runtime) = registered.take() else {
			return Ok(());
		};
		snapshot::uninstall();
		runtime.store.disarm()?;
		if guard::held_by_other_thread() {
			// A handler on another thread may still be reading it.
			std::mem::forget(runtime);
		}
		info!("Unregistered crash runtime");
		Ok(())
	}

	/// The registered runtime, for normal threads.
	pub(crate) fn current() -> Option<Arc<CrashRuntime>> {
		REGISTERED.lock().ok().and_then(|r| r.clone())
	}

	/// The registered runtime, for signal handlers.
	///
	/// # Safety
	///
	/// The caller must hold the capture guard for as long as it uses the
	/// reference.
	pub(crate) unsafe fn current_in_handler<'a>() -> Option<&'a CrashRuntime> {
		let runtime = RUNTIME.load(Ordering::Acquire);
		// SAFETY: a registered runtime is only freed by `unregister`, which
		// leaks it instead while another thread holds the guard.
		unsafe { runtime.as_ref() }
	}

	#[cfg(test)]
	pub(crate) fn store(&self) -> &Arc<FileReportStore> {
		&self.store
	}

	pub(crate) fn set_app_state_enabled(&self, enabled: bool) {
		self.app_state_enabled.store(enabled, Ordering::Release);
	}

	fn app_state_if_enabled(&self) -> Option<&AppStateTracker> {
		self.app_state_enabled
			.load(Ordering::Acquire)
			.then_some(self.app_state.as_ref())
	}

	/// Allocates and publishes a fresh report slot for the next capture.
	pub(crate) fn rearm(&self) -> Result<()> {
		self.store.arm()?;
		Ok(())
	}

	/// Fills the context with the crashed thread and, if configured, every
	/// other thread. Async-signal-safe when `raw` is set.
	fn capture_threads(
		&self,
		ctx: &mut CaptureContext,
		crashed: CrashedThread,
		exclude: &[u64],
		snapshot_others: bool,
		raw: bool,
	) {
		let introspect = self.options.limits.introspect_memory;
		let current = sys::current_thread_id();
		let fault_address = ctx.trigger().fault_address;

		let mut skip = [0u64; MAX_EXCLUDED];
		let mut skipped = 0;
		for tid in exclude.iter().take(MAX_EXCLUDED - 1) {
			skip[skipped] = *tid;
			skipped += 1;
		}

		match crashed {
			CrashedThread::Context { tid, uc } => {
				if let Some(slot) = ctx.claim_slot() {
					slot.id = tid;
					slot.crashed = true;
					slot.current = tid == current;
					slot.fill_name();
					// SAFETY: `uc` came from the kernel for the handler that
					// stopped `tid`, which is blocked until we are done.
					unsafe { unwind::record_from_ucontext(slot, uc, fault_address, introspect) };
				}
				skip[skipped] = tid;
				skipped += 1;
			}
			CrashedThread::Current => {
				if let Some(slot) = ctx.claim_slot() {
					slot.id = current;
					slot.crashed = true;
					slot.current = true;
					slot.fill_name();
					if raw {
						unwind::record_current_raw(slot, introspect);
					} else {
						unwind::record_current(slot, introspect);
					}
				}
			}
			CrashedThread::Suspended { .. } => {}
		}

		if snapshot_others {
			snapshot::capture_other_threads(ctx, &skip[..skipped]);
		}

		if let CrashedThread::Suspended { tid } = crashed {
			let found = ctx.threads().iter().any(|t| t.id == tid);
			if !found {
				// Truncation is already flagged on the context.
				let _ = ctx.record_thread(tid, &[], &[]);
			}
			ctx.mark_crashed(tid);
		}
	}

	/// Records a fatal event into the armed slot and publishes it.
	///
	/// Async-signal-safe. Returns false if no slot was armed or it was
	/// already used.
	///
	/// # Safety
	///
	/// The caller must hold the capture guard. For
	/// [`CrashedThread::Context`], `uc` must be the signal context of the
	/// named thread, which must stay stopped until this returns.
	pub(crate) unsafe fn record_fatal(
		&self,
		trigger: TriggerInfo,
		crashed: CrashedThread,
		detail: ErrorDetail<'_>,
		exclude: &[u64],
	) -> bool {
		// SAFETY: the caller holds the guard, so replaced slots are leaked.
		let Some(slot) = (unsafe { self.store.armed_in_handler() }) else {
			return false;
		};
		if !slot.try_consume() {
			return false;
		}
		// SAFETY: only the guard owner touches the context.
		let ctx = unsafe { &mut *self.context.get() };
		ctx.reset();
		ctx.begin_capture(trigger);
		self.capture_threads(ctx, crashed, exclude, self.options.snapshot_all_threads, true);
		ctx.finalize();

		let app_state = self.app_state_if_enabled();
		if let Some(tracker) = app_state {
			tracker.record_crash();
		}
		// SAFETY: the caller holds the guard.
		let prepared = unsafe { self.metadata.prepared() }
			.map(|p| p.view())
			.unwrap_or_default();
		self.write(slot, ctx, detail, prepared, app_state);
		snapshot::resume_all();
		let published = slot.publish_in_handler();
		ctx.reset();
		published
	}

	fn write(
		&self,
		slot: &ArmedSlot,
		ctx: &CaptureContext,
		detail: ErrorDetail<'_>,
		prepared: PreparedView<'_>,
		app_state: Option<&AppStateTracker>,
	) -> bool {
		let meta = ReportMeta {
			report_id: slot.id().0,
			uuid: slot.uuid(),
			session_id: &self.options.session_id,
			app_name: &self.options.app_name,
			pid: sys::process_id(),
		};
		let prepared = PreparedView {
			console_log: self.options.console_log.as_ref().map(ConsoleLog::read_fd),
			..prepared
		};
		// SAFETY: only the guard owner touches the buffer.
		let buf = unsafe { &mut **self.buffer.get() };
		ReportWriter::new(slot.fd(), buf, meta).write(ctx, detail, prepared, app_state)
	}

	/// Records a report on a normal thread, publishes it and re-arms.
	///
	/// Waits up to the fatal wait time for another capture to finish.
	pub(crate) fn record_nonfatal(
		&self,
		trigger: TriggerInfo,
		crashed: CrashedThread,
		kind: ErrorKind,
		exception: Option<&ExceptionInfo>,
		deadlock_interval_ms: Option<u64>,
		snapshot_others: bool,
	) -> Result<ReportId> {
		self.metadata.refresh_images(false)?;

		let token = match guard::claim_within(guard::FATAL_WAIT_MS) {
			Claim::Acquired(token) => token,
			Claim::Reentrant | Claim::Busy => return Err(CrashSdkError::CaptureInProgress),
		};
		// SAFETY: we hold the guard.
		let slot = match unsafe { self.store.armed_in_handler() } {
			Some(slot) => Arc::clone(slot),
			None => return Err(CrashSdkError::NotInstalled),
		};
		if !slot.try_consume() {
			return Err(CrashSdkError::CaptureInProgress);
		}

		// SAFETY: only the guard owner touches the context.
		let ctx = unsafe { &mut *self.context.get() };
		ctx.reset();
		ctx.begin_capture(trigger);
		let snapshot_others = matches!(crashed, CrashedThread::Suspended { .. })
			|| (snapshot_others && self.options.snapshot_all_threads);
		self.capture_threads(ctx, crashed, &[], snapshot_others, false);
		ctx.finalize();

		let detail = ErrorDetail {
			kind,
			exception,
			deadlock_interval_ms,
		};
		// SAFETY: we hold the guard.
		let prepared = unsafe { self.metadata.prepared() }
			.map(|p| p.view())
			.unwrap_or_default();
		let written = self.write(&slot, ctx, detail, prepared, self.app_state_if_enabled());
		snapshot::resume_all();
		ctx.reset();

		let id = self.store.publish_armed(&slot)?;
		if !written {
			debug!(report_id = %id, "Report published with a short write");
		}
		self.rearm()?;
		drop(token);

		if let Some(callback) = &self.on_crash {
			callback(id);
		}
		Ok(id)
	}
}

#[cfg(test)]
pub(crate) mod testing {
	use super::*;
	use crate::metadata::MetadataHub;
	use serial_test::serial;
	use tempfile::TempDir;

	/// A runtime over a temp directory, not registered.
	pub(crate) fn runtime(dir: &TempDir, max_reports: usize) -> Arc<CrashRuntime> {
		let store = Arc::new(FileReportStore::open(dir.path(), "test", max_reports).unwrap());
		let metadata = Arc::new(MetadataHub::new("test", Some("1.0.0"), "session"));
		let app_state = Arc::new(AppStateTracker::open(dir.path().join("test-state.json")).unwrap());
		let options = RuntimeOptions {
			app_name: "test".to_string(),
			session_id: "session".to_string(),
			limits: CaptureLimits {
				max_threads: 32,
				max_frames: 32,
				introspect_memory: true,
			},
			snapshot_all_threads: false,
			console_log: None,
		};
		Arc::new(CrashRuntime::new(options, store, metadata, app_state, None))
	}

	#[test]
	#[serial(capture_guard)]
	fn nonfatal_reports_rearm_and_respect_retention() {
		use crate::store::ReportStore;
		use loom_crash_core::MonitorType;

		let dir = TempDir::new().unwrap();
		let runtime = runtime(&dir, 2);
		runtime.set_app_state_enabled(true);
		runtime.rearm().unwrap();

		let mut ids = Vec::new();
		for reason in ["first", "second", "third"] {
			let exception = ExceptionInfo {
				name: "TestError".to_string(),
				reason: Some(reason.to_string()),
				..Default::default()
			};
			let id = runtime
				.record_nonfatal(
					TriggerInfo::now(MonitorType::USER_REPORTED),
					CrashedThread::Current,
					ErrorKind::User,
					Some(&exception),
					None,
					false,
				)
				.unwrap();
			ids.push(id);
		}

		let store = runtime.store();
		assert_eq!(store.list().unwrap(), vec![ids[2], ids[1]]);
		let newest = store.read(ids[2]).unwrap();
		assert!(newest.complete);
		assert_eq!(newest.exception().and_then(|e| e.reason.as_deref()), Some("third"));
		let crashed = newest.crashed_thread().unwrap();
		assert!(crashed.current);
		assert!(!crashed.frames.is_empty());
		assert!(newest.system.as_ref().unwrap()["application_state"].is_object());
		runtime.store().disarm().unwrap();
	}

	#[test]
	#[serial(capture_guard)]
	fn fatal_path_writes_into_the_armed_slot() {
		use crate::store::ReportStore;
		use loom_crash_core::MonitorType;

		let dir = TempDir::new().unwrap();
		let runtime = runtime(&dir, 5);
		runtime.rearm().unwrap();

		let Claim::Acquired(token) = guard::try_claim() else {
			panic!("guard should be free");
		};
		let mut trigger = TriggerInfo::now(MonitorType::SIGNAL);
		trigger.signal = libc::SIGSEGV;
		trigger.fault_address = Some(0x10);
		// SAFETY: we hold the guard.
		let published = unsafe {
			runtime.record_fatal(
				trigger,
				CrashedThread::Current,
				ErrorDetail::of_kind(ErrorKind::Signal),
				&[],
			)
		};
		// The slot is spent until re-armed.
		// SAFETY: we still hold the guard.
		let again = unsafe {
			runtime.record_fatal(trigger, CrashedThread::Current, ErrorDetail::of_kind(ErrorKind::Signal), &[])
		};
		drop(token);

		assert!(published);
		assert!(!again);
		let ids = runtime.store().list().unwrap();
		assert_eq!(ids.len(), 1);
		let report = runtime.store().read(ids[0]).unwrap();
		assert!(report.complete);
		let signal = report.crash.unwrap().error.signal.unwrap();
		assert_eq!(signal.signo, libc::SIGSEGV);
		assert_eq!(signal.name.as_deref(), Some("SIGSEGV"));
	}
}
