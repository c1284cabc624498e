// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Main-thread deadlock watchdog.
//!
//! A watchdog thread schedules a no-op on the main thread through the app's
//! [`MainThreadExecutor`] and waits for it to run. A task that answers in
//! time resets the cycle. One that does not is treated as a deadlock: the
//! report marks the main thread crashed and, unless configured otherwise,
//! the process aborts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use loom_crash_core::{CrashError, ErrorKind, MonitorType};
use tracing::{error, warn};

use super::{fatal, Monitor, STATES};
use crate::context::TriggerInfo;
use crate::runtime::{CrashRuntime, CrashedThread};
use crate::sys;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks on the application's main thread.
pub trait MainThreadExecutor: Send + Sync {
	fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// A task queue the main loop drains with [`MainThreadQueue::run_pending`].
#[derive(Default)]
pub struct MainThreadQueue {
	tasks: Mutex<VecDeque<Task>>,
}

impl MainThreadQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Runs every queued task. Call from the main loop.
	pub fn run_pending(&self) -> usize {
		let tasks: Vec<Task> = match self.tasks.lock() {
			Ok(mut queue) => queue.drain(..).collect(),
			Err(_) => return 0,
		};
		let count = tasks.len();
		for task in tasks {
			task();
		}
		count
	}

	pub fn len(&self) -> usize {
		self.tasks.lock().map(|q| q.len()).unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl MainThreadExecutor for MainThreadQueue {
	fn execute(&self, task: Box<dyn FnOnce() + Send>) {
		if let Ok(mut queue) = self.tasks.lock() {
			queue.push_back(task);
		}
	}
}

pub(crate) struct DeadlockMonitor {
	executor: Option<Arc<dyn MainThreadExecutor>>,
	interval: Duration,
	terminate: bool,
	stop: Arc<AtomicBool>,
	watchdog: Option<JoinHandle<()>>,
}

impl DeadlockMonitor {
	pub(crate) fn new(
		executor: Option<Arc<dyn MainThreadExecutor>>,
		interval: Duration,
		terminate: bool,
	) -> Self {
		Self {
			executor,
			interval,
			terminate,
			stop: Arc::new(AtomicBool::new(false)),
			watchdog: None,
		}
	}
}

/// Sleeps in short steps until `until` or a stop request.
fn wait_until(until: Instant, stop: &AtomicBool, done: Option<&AtomicBool>) {
	while Instant::now() < until && !stop.load(Ordering::Acquire) {
		if done.is_some_and(|d| d.load(Ordering::Acquire)) {
			return;
		}
		std::thread::sleep(POLL_INTERVAL);
	}
}

fn watch(
	executor: Arc<dyn MainThreadExecutor>,
	interval: Duration,
	terminate: bool,
	stop: Arc<AtomicBool>,
	main_tid: u64,
) {
	while !stop.load(Ordering::Acquire) {
		let answered = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&answered);
		executor.execute(Box::new(move || flag.store(true, Ordering::Release)));

		wait_until(Instant::now() + interval, &stop, Some(&answered));
		if stop.load(Ordering::Acquire) {
			return;
		}
		if answered.load(Ordering::Acquire) {
			wait_until(Instant::now() + interval, &stop, None);
			continue;
		}

		error!(interval_ms = interval.as_millis() as u64, "Main thread deadlock detected");
		report_deadlock(interval, main_tid);
		STATES.mark_triggered(MonitorType::MAIN_THREAD_DEADLOCK);
		if terminate {
			fatal::restore_all();
			std::process::abort();
		}
		return;
	}
}

fn report_deadlock(interval: Duration, main_tid: u64) {
	let Some(runtime) = CrashRuntime::current() else {
		return;
	};
	let mut trigger = TriggerInfo::now(MonitorType::MAIN_THREAD_DEADLOCK);
	trigger.thread_id = main_tid;
	trigger.on_main_thread = true;
	if let Err(e) = runtime.record_nonfatal(
		trigger,
		CrashedThread::Suspended { tid: main_tid },
		ErrorKind::Deadlock,
		None,
		Some(interval.as_millis() as u64),
		true,
	) {
		warn!(error = %e, "Failed to record deadlock report");
	}
}

impl Monitor for DeadlockMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::MAIN_THREAD_DEADLOCK
	}

	fn install(&mut self) -> Result<(), CrashError> {
		if self.watchdog.is_some() {
			return Ok(());
		}
		if self.interval.is_zero() {
			return Err(CrashError::install("main_thread_deadlock", "deadlock interval is 0"));
		}
		let Some(executor) = self.executor.clone() else {
			return Err(CrashError::install(
				"main_thread_deadlock",
				"no main thread executor configured",
			));
		};
		self.stop = Arc::new(AtomicBool::new(false));
		let stop = Arc::clone(&self.stop);
		let (interval, terminate) = (self.interval, self.terminate);
		let main_tid = sys::process_id() as u64;
		let handle = std::thread::Builder::new()
			.name("loom-crash-deadlock-watchdog".to_string())
			.spawn(move || watch(executor, interval, terminate, stop, main_tid))
			.map_err(|e| CrashError::install("main_thread_deadlock", e.to_string()))?;
		self.watchdog = Some(handle);
		Ok(())
	}

	fn uninstall(&mut self) {
		self.stop.store(true, Ordering::Release);
		if let Some(handle) = self.watchdog.take() {
			if handle.join().is_err() {
				warn!("Deadlock watchdog thread panicked");
			}
		}
	}

	fn is_enabled(&self) -> bool {
		self.watchdog.is_some()
	}
}
