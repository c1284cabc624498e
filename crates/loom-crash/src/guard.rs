// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process-wide capture guard.
//!
//! At most one thread writes a report at a time. The guard records the owning
//! thread ID so a fault raised while that same thread is writing is detected
//! as re-entrance instead of deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::sys;

/// How long a fatal handler waits for another thread's capture to finish.
pub(crate) const FATAL_WAIT_MS: u64 = 2_000;

const POLL_MS: u64 = 5;

static OWNER: AtomicU64 = AtomicU64::new(0);
/// A thread writing on the owner's behalf while the owner is blocked.
static DELEGATE: AtomicU64 = AtomicU64::new(0);

pub(crate) enum Claim {
	Acquired(GuardToken),
	/// The calling thread already holds the guard.
	Reentrant,
	/// Another thread holds the guard.
	Busy,
}

/// Held while a capture is in progress. Releases the guard on drop.
#[must_use]
pub(crate) struct GuardToken {
	tid: u64,
}

impl Drop for GuardToken {
	fn drop(&mut self) {
		let _ = OWNER.compare_exchange(self.tid, 0, Ordering::Release, Ordering::Relaxed);
	}
}

/// Marks the calling thread as writing for the current owner until dropped.
pub(crate) struct DelegateScope(());

impl Drop for DelegateScope {
	fn drop(&mut self) {
		DELEGATE.store(0, Ordering::Release);
	}
}

/// Lets the calling thread capture for the blocked guard owner. A fault on
/// this thread inside the scope counts as re-entrance. Async-signal-safe.
pub(crate) fn act_for_owner() -> DelegateScope {
	DELEGATE.store(sys::current_thread_id(), Ordering::Release);
	DelegateScope(())
}

/// Single attempt. Async-signal-safe.
pub(crate) fn try_claim() -> Claim {
	let tid = sys::current_thread_id();
	match OWNER.compare_exchange(0, tid, Ordering::Acquire, Ordering::Acquire) {
		Ok(_) => Claim::Acquired(GuardToken { tid }),
		Err(owner) if owner == tid => Claim::Reentrant,
		Err(_) if DELEGATE.load(Ordering::Acquire) == tid => Claim::Reentrant,
		Err(_) => Claim::Busy,
	}
}

/// Retries until the guard is free or `timeout_ms` elapses. Async-signal-safe.
pub(crate) fn claim_within(timeout_ms: u64) -> Claim {
	let deadline = sys::monotonic_ms().saturating_add(timeout_ms);
	loop {
		match try_claim() {
			Claim::Busy if sys::monotonic_ms() < deadline => sys::sleep_ms(POLL_MS),
			other => return other,
		}
	}
}

pub(crate) fn is_held() -> bool {
	OWNER.load(Ordering::Acquire) != 0
}

/// True when some thread other than the caller is capturing.
pub(crate) fn held_by_other_thread() -> bool {
	let owner = OWNER.load(Ordering::Acquire);
	owner != 0 && owner != sys::current_thread_id()
}

#[cfg(test)]
mod tests {
	use super::*;
	use serial_test::serial;

	#[test]
	#[serial(capture_guard)]
	fn second_claim_on_same_thread_is_reentrant() {
		let Claim::Acquired(token) = try_claim() else {
			panic!("guard should be free");
		};
		assert!(matches!(try_claim(), Claim::Reentrant));
		assert!(!held_by_other_thread());
		drop(token);
		assert!(!is_held());
	}

	#[test]
	#[serial(capture_guard)]
	fn other_thread_sees_busy_then_acquires() {
		let Claim::Acquired(token) = try_claim() else {
			panic!("guard should be free");
		};
		let busy = std::thread::spawn(|| {
			let busy = matches!(try_claim(), Claim::Busy);
			(busy, held_by_other_thread())
		})
		.join()
		.unwrap();
		assert_eq!(busy, (true, true));

		let waiter = std::thread::spawn(|| matches!(claim_within(1_000), Claim::Acquired(_)));
		std::thread::sleep(std::time::Duration::from_millis(20));
		drop(token);
		assert!(waiter.join().unwrap());
	}

	#[test]
	#[serial(capture_guard)]
	fn delegate_fault_is_reentrant() {
		let Claim::Acquired(token) = try_claim() else {
			panic!("guard should be free");
		};
		let (inside, after) = std::thread::spawn(|| {
			let scope = act_for_owner();
			let inside = matches!(try_claim(), Claim::Reentrant);
			drop(scope);
			(inside, matches!(try_claim(), Claim::Busy))
		})
		.join()
		.unwrap();
		assert!(inside);
		assert!(after);
		drop(token);
	}

	#[test]
	#[serial(capture_guard)]
	fn claim_within_times_out() {
		let Claim::Acquired(_token) = try_claim() else {
			panic!("guard should be free");
		};
		let started = std::time::Instant::now();
		let result = std::thread::spawn(|| matches!(claim_within(30), Claim::Busy))
			.join()
			.unwrap();
		assert!(result);
		assert!(started.elapsed() >= std::time::Duration::from_millis(25));
	}
}
