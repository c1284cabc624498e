// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Suspending other threads for a stable snapshot.
//!
//! The capturing thread signals each target with a real-time signal. The
//! target's handler records its own registers and frames into a slot that
//! was claimed for it, acknowledges, and parks until released. A target that
//! does not acknowledge in time keeps only its ID and name.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::context::{CaptureContext, ThreadSlot};
use crate::{sys, unwind};

const MAX_TARGETS: usize = 512;
const ACK_TIMEOUT_MS: u64 = 100;
const PARK_LIMIT_MS: u64 = 5_000;

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const CAPTURING: u8 = 2;
const DONE: u8 = 3;
const ABANDONED: u8 = 4;

struct Target {
	state: AtomicU8,
	tid: AtomicU64,
	slot: AtomicPtr<ThreadSlot>,
}

impl Target {
	const fn new() -> Self {
		Self {
			state: AtomicU8::new(IDLE),
			tid: AtomicU64::new(0),
			slot: AtomicPtr::new(ptr::null_mut()),
		}
	}
}

static TARGETS: [Target; MAX_TARGETS] = [const { Target::new() }; MAX_TARGETS];
static ACTIVE: AtomicUsize = AtomicUsize::new(0);
static RELEASED: AtomicBool = AtomicBool::new(true);
static INTROSPECT: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);

#[cfg(any(target_os = "linux", target_os = "android"))]
fn suspend_signal() -> libc::c_int {
	libc::SIGRTMIN() + 2
}

extern "C" fn suspend_handler(_signal: libc::c_int, _info: *mut libc::siginfo_t, uc: *mut c_void) {
	let _errno = sys::ErrnoGuard::save();
	let tid = sys::current_thread_id();
	let active = ACTIVE.load(Ordering::Acquire).min(MAX_TARGETS);
	let Some(target) = TARGETS[..active]
		.iter()
		.find(|t| t.tid.load(Ordering::Acquire) == tid)
	else {
		return;
	};
	if target
		.state
		.compare_exchange(PENDING, CAPTURING, Ordering::AcqRel, Ordering::Acquire)
		.is_err()
	{
		return;
	}

	let slot = target.slot.load(Ordering::Acquire);
	if !slot.is_null() {
		// SAFETY: the capturer handed this slot to this thread alone and waits
		// for DONE before reading it; `uc` is the kernel-provided context.
		unsafe {
			unwind::record_from_ucontext(&mut *slot, uc, None, INTROSPECT.load(Ordering::Relaxed));
		}
	}
	target.state.store(DONE, Ordering::Release);

	let deadline = sys::monotonic_ms() + PARK_LIMIT_MS;
	while !RELEASED.load(Ordering::Acquire) && sys::monotonic_ms() < deadline {
		sys::sleep_ms(1);
	}
}

/// Installs the suspension handler. Not async-signal-safe.
pub(crate) fn install(introspect_memory: bool) -> bool {
	INTROSPECT.store(introspect_memory, Ordering::Relaxed);
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		if INSTALLED.load(Ordering::Acquire) {
			return true;
		}
		// SAFETY: a zeroed sigaction is valid; fields are set before use.
		let ok = unsafe {
			let mut action: libc::sigaction = std::mem::zeroed();
			libc::sigfillset(&mut action.sa_mask);
			// Targets run the handler on their own stacks.
			action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
			action.sa_sigaction = suspend_handler
				as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)
				as usize;
			libc::sigaction(suspend_signal(), &action, ptr::null_mut()) == 0
		};
		INSTALLED.store(ok, Ordering::Release);
		ok
	}
	#[cfg(not(any(target_os = "linux", target_os = "android")))]
	{
		false
	}
}

/// Resets the suspension signal to its default action.
pub(crate) fn uninstall() {
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		if INSTALLED.swap(false, Ordering::AcqRel) {
			// SAFETY: restores the default disposition.
			unsafe {
				let mut action: libc::sigaction = std::mem::zeroed();
				action.sa_sigaction = libc::SIG_DFL;
				libc::sigaction(suspend_signal(), &action, ptr::null_mut());
			}
		}
	}
}

fn wait_while(states: &[u8], deadline: u64) -> bool {
	loop {
		let active = ACTIVE.load(Ordering::Acquire);
		let busy = TARGETS[..active]
			.iter()
			.any(|t| states.contains(&t.state.load(Ordering::Acquire)));
		if !busy {
			return true;
		}
		if sys::monotonic_ms() >= deadline {
			return false;
		}
		sys::sleep_ms(1);
	}
}

/// Suspends and records every thread except the caller and `exclude`.
///
/// Returns how many threads were claimed. Async-signal-safe. Call
/// [`resume_all`] once the report is written.
pub(crate) fn capture_other_threads(ctx: &mut CaptureContext, exclude: &[u64]) -> usize {
	let self_tid = sys::current_thread_id();
	let mut count = 0usize;
	RELEASED.store(false, Ordering::Release);
	ACTIVE.store(0, Ordering::Release);

	sys::for_each_thread(|tid| {
		if tid == self_tid || exclude.contains(&tid) || count == MAX_TARGETS {
			return;
		}
		let Some(slot) = ctx.claim_slot_ptr() else {
			return;
		};
		// SAFETY: the slot was just claimed and no handler knows about it yet.
		unsafe {
			(*slot).id = tid;
			(*slot).fill_name();
		}
		let target = &TARGETS[count];
		target.tid.store(tid, Ordering::Relaxed);
		target.slot.store(slot, Ordering::Relaxed);
		target.state.store(PENDING, Ordering::Release);
		count += 1;
	});
	ACTIVE.store(count, Ordering::Release);

	if !INSTALLED.load(Ordering::Acquire) {
		abandon_pending(count);
		return count;
	}

	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		for target in &TARGETS[..count] {
			if !sys::signal_thread(target.tid.load(Ordering::Relaxed), suspend_signal()) {
				let _ = target.state.compare_exchange(
					PENDING,
					ABANDONED,
					Ordering::AcqRel,
					Ordering::Acquire,
				);
			}
		}
	}

	let deadline = sys::monotonic_ms() + ACK_TIMEOUT_MS;
	wait_while(&[PENDING, CAPTURING], deadline);
	abandon_pending(count);
	// A handler already past PENDING gets one more window to finish its slot.
	wait_while(&[CAPTURING], sys::monotonic_ms() + ACK_TIMEOUT_MS);
	count
}

fn abandon_pending(count: usize) {
	for target in &TARGETS[..count] {
		let _ = target
			.state
			.compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire);
	}
}

/// Releases every parked thread.
pub(crate) fn resume_all() {
	RELEASED.store(true, Ordering::Release);
	let active = ACTIVE.swap(0, Ordering::AcqRel);
	for target in &TARGETS[..active] {
		target.state.store(IDLE, Ordering::Release);
		target.slot.store(ptr::null_mut(), Ordering::Release);
	}
}

/// Number of targets that recorded themselves in the last capture.
#[cfg(test)]
fn recorded_count() -> usize {
	let active = ACTIVE.load(Ordering::Acquire);
	TARGETS[..active]
		.iter()
		.filter(|t| t.state.load(Ordering::Acquire) == DONE)
		.count()
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
	use super::*;
	use crate::context::{CaptureLimits, TriggerInfo};
	use loom_crash_core::MonitorType;
	use serial_test::serial;
	use std::sync::mpsc;
	use std::time::Duration;

	#[test]
	#[serial(signal_handlers)]
	fn suspended_threads_record_themselves() {
		assert!(install(false));

		let (ready_tx, ready_rx) = mpsc::channel();
		let (stop_tx, stop_rx) = mpsc::channel::<()>();
		let worker = std::thread::Builder::new()
			.name("snapshot-worker".to_string())
			.spawn(move || {
				ready_tx.send(sys::current_thread_id()).unwrap();
				while stop_rx.recv_timeout(Duration::from_millis(5)).is_err() {}
			})
			.unwrap();
		let worker_tid = ready_rx.recv().unwrap();

		let mut ctx = CaptureContext::new(CaptureLimits {
			max_threads: 64,
			max_frames: 32,
			introspect_memory: false,
		});
		ctx.begin_capture(TriggerInfo::now(MonitorType::USER_REPORTED));
		let claimed = capture_other_threads(&mut ctx, &[]);
		let recorded = recorded_count();
		resume_all();

		assert!(claimed >= 1);
		assert!(recorded >= 1);
		let slot = ctx
			.threads()
			.iter()
			.find(|t| t.id == worker_tid)
			.expect("worker should be captured");
		assert_eq!(slot.name.as_bytes(), b"snapshot-worker");
		assert!(!slot.registers().is_empty());

		stop_tx.send(()).unwrap();
		worker.join().unwrap();
		uninstall();
	}

	#[test]
	#[serial(signal_handlers)]
	fn excluded_threads_are_skipped() {
		let mut ctx = CaptureContext::new(CaptureLimits {
			max_threads: 64,
			max_frames: 4,
			introspect_memory: false,
		});
		ctx.begin_capture(TriggerInfo::default());
		let mut others = Vec::new();
		sys::for_each_thread(|tid| others.push(tid));
		let claimed = capture_other_threads(&mut ctx, &others);
		resume_all();
		assert_eq!(claimed, 0);
		assert!(ctx.threads().is_empty());
	}
}
