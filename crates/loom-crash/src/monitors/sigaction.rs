// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Saved-previous-handler bookkeeping for POSIX signal monitors.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

pub(crate) type SigactionHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void);

struct Entry {
	signal: AtomicI32,
	previous: UnsafeCell<MaybeUninit<libc::sigaction>>,
	saved: AtomicBool,
}

impl Entry {
	const fn new() -> Self {
		Self {
			signal: AtomicI32::new(0),
			previous: UnsafeCell::new(MaybeUninit::uninit()),
			saved: AtomicBool::new(false),
		}
	}
}

/// Fixed table of signals this library handles, with the actions it replaced.
///
/// `install` and `restore_from_normal_thread` are serialized by the
/// controller. Handlers only read `previous` for entries marked saved.
pub(crate) struct HandlerTable<const N: usize> {
	entries: [Entry; N],
}

// SAFETY: `previous` is written only while `saved` is false and published by
// the Release store of `saved`; readers check `saved` with Acquire first.
unsafe impl<const N: usize> Sync for HandlerTable<N> {}

impl<const N: usize> HandlerTable<N> {
	pub(crate) const fn new() -> Self {
		Self {
			entries: [const { Entry::new() }; N],
		}
	}

	/// Installs `handler` for each signal, saving the previous actions.
	///
	/// Signals whose current action is `SIG_IGN` are skipped when
	/// `skip_ignored` is set. On any failure every signal installed so far is
	/// restored. Returns the number of signals now handled.
	pub(crate) fn install(
		&self,
		signals: &[libc::c_int],
		handler: SigactionHandler,
		skip_ignored: bool,
	) -> io::Result<usize> {
		if signals.len() > N {
			return Err(io::Error::new(io::ErrorKind::InvalidInput, "too many signals"));
		}
		let mut installed = 0;
		for (entry, &signal) in self.entries.iter().zip(signals) {
			// SAFETY: zeroed sigaction structs are valid; pointers are to locals
			// or to this entry's storage, which no handler reads while unsaved.
			unsafe {
				let mut current: libc::sigaction = std::mem::zeroed();
				if libc::sigaction(signal, ptr::null(), &mut current) != 0 {
					let err = io::Error::last_os_error();
					self.restore();
					return Err(err);
				}
				if skip_ignored && current.sa_sigaction == libc::SIG_IGN {
					continue;
				}

				let mut action: libc::sigaction = std::mem::zeroed();
				libc::sigfillset(&mut action.sa_mask);
				action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
				action.sa_sigaction = handler as usize;

				let previous = (*entry.previous.get()).as_mut_ptr();
				if libc::sigaction(signal, &action, previous) != 0 {
					let err = io::Error::last_os_error();
					self.restore();
					return Err(err);
				}
			}
			entry.signal.store(signal, Ordering::Relaxed);
			entry.saved.store(true, Ordering::Release);
			installed += 1;
		}
		Ok(installed)
	}

	/// Puts every saved action back. Async-signal-safe.
	pub(crate) fn restore(&self) {
		for entry in &self.entries {
			if !entry.saved.swap(false, Ordering::AcqRel) {
				continue;
			}
			let signal = entry.signal.load(Ordering::Relaxed);
			// SAFETY: `saved` was true, so `previous` holds the action
			// returned by the kernel for this signal.
			unsafe {
				libc::sigaction(signal, (*entry.previous.get()).as_ptr(), ptr::null_mut());
			}
		}
	}

	pub(crate) fn handles(&self, signal: libc::c_int) -> bool {
		self.entries.iter().any(|e| {
			e.saved.load(Ordering::Acquire) && e.signal.load(Ordering::Relaxed) == signal
		})
	}

	pub(crate) fn is_empty(&self) -> bool {
		!self.entries.iter().any(|e| e.saved.load(Ordering::Acquire))
	}

	/// The action that was in place before this table installed `signal`.
	#[cfg(test)]
	pub(crate) fn previous(&self, signal: libc::c_int) -> Option<libc::sigaction> {
		self.entries
			.iter()
			.find(|e| e.saved.load(Ordering::Acquire) && e.signal.load(Ordering::Relaxed) == signal)
			// SAFETY: saved entries hold an initialized action.
			.map(|e| unsafe { *(*e.previous.get()).as_ptr() })
	}
}
