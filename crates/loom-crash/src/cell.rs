// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Lock-free hand-off of prepared data to signal handlers.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::guard;

/// A value swapped in by normal threads and read by crash handlers.
///
/// Writers publish a fresh `Box` with one atomic swap. A handler reads the
/// current pointer only while holding the capture guard. A value retired while
/// another thread holds the guard is leaked, since that thread may still be
/// reading it.
pub(crate) struct SignalSafeCell<T> {
	ptr: AtomicPtr<T>,
}

// SAFETY: values move between threads only as owned boxes.
unsafe impl<T: Send + Sync> Send for SignalSafeCell<T> {}
unsafe impl<T: Send + Sync> Sync for SignalSafeCell<T> {}

impl<T> SignalSafeCell<T> {
	pub(crate) const fn empty() -> Self {
		Self {
			ptr: AtomicPtr::new(ptr::null_mut()),
		}
	}

	pub(crate) fn new(value: T) -> Self {
		let cell = Self::empty();
		cell.publish(value);
		cell
	}

	/// Replaces the current value. Not async-signal-safe.
	pub(crate) fn publish(&self, value: T) {
		let fresh = Box::into_raw(Box::new(value));
		let old = self.ptr.swap(fresh, Ordering::AcqRel);
		retire(old);
	}

	/// Clears the cell. Not async-signal-safe.
	pub(crate) fn clear(&self) {
		let old = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
		retire(old);
	}

	/// Returns the current value.
	///
	/// # Safety
	///
	/// The caller must hold the capture guard for as long as the reference is
	/// alive, so no writer frees the value underneath it.
	pub(crate) unsafe fn load(&self) -> Option<&T> {
		let current = self.ptr.load(Ordering::Acquire);
		// SAFETY: non-null pointers come from Box::into_raw and are only freed
		// when no other thread holds the guard.
		unsafe { current.as_ref() }
	}

	#[cfg(test)]
	pub(crate) fn is_set(&self) -> bool {
		!self.ptr.load(Ordering::Acquire).is_null()
	}
}

fn retire<T>(old: *mut T) {
	if old.is_null() || guard::held_by_other_thread() {
		return;
	}
	// SAFETY: `old` came from Box::into_raw and was just unlinked.
	drop(unsafe { Box::from_raw(old) });
}

impl<T> Drop for SignalSafeCell<T> {
	fn drop(&mut self) {
		let old = std::mem::replace(self.ptr.get_mut(), ptr::null_mut());
		retire(old);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serial_test::serial;
	use std::sync::Arc;

	#[test]
	#[serial(capture_guard)]
	fn publish_replaces_and_frees_old_value() {
		let first = Arc::new(1u32);
		let cell = SignalSafeCell::new(Arc::clone(&first));
		assert_eq!(Arc::strong_count(&first), 2);

		cell.publish(Arc::new(2));
		assert_eq!(Arc::strong_count(&first), 1);
		// SAFETY: no capture is running in this test.
		assert_eq!(unsafe { cell.load() }.map(|v| **v), Some(2));
	}

	#[test]
	#[serial(capture_guard)]
	fn clear_empties_the_cell() {
		let cell = SignalSafeCell::new(String::from("x"));
		assert!(cell.is_set());
		cell.clear();
		assert!(!cell.is_set());
		// SAFETY: no capture is running in this test.
		assert!(unsafe { cell.load() }.is_none());
	}

	#[test]
	#[serial(capture_guard)]
	fn value_retired_during_foreign_capture_is_leaked() {
		let first = Arc::new(7u32);
		let cell = SignalSafeCell::new(Arc::clone(&first));

		let (held_tx, held_rx) = std::sync::mpsc::channel();
		let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
		let holder = std::thread::spawn(move || {
			let guard::Claim::Acquired(_token) = guard::try_claim() else {
				panic!("guard should be free");
			};
			held_tx.send(()).unwrap();
			release_rx.recv().unwrap();
		});
		held_rx.recv().unwrap();

		cell.publish(Arc::new(8));
		assert_eq!(Arc::strong_count(&first), 2);

		release_tx.send(()).unwrap();
		holder.join().unwrap();
	}
}
