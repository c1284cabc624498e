// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Capture thread shared by the fatal-signal monitors.
//!
//! A fatal handler runs on whatever stack the faulting thread has, often the
//! few KiB of alternate stack std gives each thread. Instead of writing there
//! it sends a fixed-size request over a pipe and blocks until the capture
//! thread replies. The capture thread records the faulting thread from its
//! saved machine context, suspends the rest, writes the report and replies.
//! Handlers fall back to recording in place when no capture thread can serve
//! the fault, including a fault on the capture thread itself.

use std::ffi::c_void;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread::JoinHandle;

use loom_crash_core::{CrashError, ErrorKind, MonitorType};
use tracing::{debug, warn};

use super::fatal;
use crate::context::TriggerInfo;
use crate::guard;
use crate::runtime::{CrashRuntime, CrashedThread};
use crate::sys::{self, AltStack};
use crate::writer::ErrorDetail;

const REPLY_TIMEOUT_MS: u64 = 10_000;

const KIND_CAPTURE: u32 = 1;
const KIND_SHUTDOWN: u32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CaptureRequest {
	kind: u32,
	signal: i32,
	code: i32,
	has_address: u32,
	monitor: u32,
	reserved: u32,
	fault_address: u64,
	tid: u64,
	uc: usize,
	timestamp_us: u64,
}

impl CaptureRequest {
	const SIZE: usize = std::mem::size_of::<Self>();

	fn as_bytes(&self) -> &[u8] {
		// SAFETY: repr(C) plain data with explicit padding fields.
		unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
	}

	fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
		// SAFETY: every bit pattern is a valid CaptureRequest.
		unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
	}

	fn monitor(&self) -> MonitorType {
		MonitorType::from_bits_truncate(self.monitor)
	}

	fn trigger(&self) -> TriggerInfo {
		TriggerInfo {
			monitor: self.monitor(),
			signal: self.signal,
			signal_code: self.code,
			fault_address: (self.has_address != 0).then_some(self.fault_address),
			timestamp_us: self.timestamp_us,
			thread_id: self.tid,
			on_main_thread: self.tid == sys::process_id() as u64,
		}
	}
}

/// Error kind a fatal monitor reports under.
pub(crate) fn error_kind(monitor: MonitorType) -> ErrorKind {
	if monitor == MonitorType::KERNEL_EXCEPTION {
		ErrorKind::KernelException
	} else {
		ErrorKind::Signal
	}
}

static REQUEST_READ: AtomicI32 = AtomicI32::new(-1);
static REQUEST_WRITE: AtomicI32 = AtomicI32::new(-1);
static REPLY_READ: AtomicI32 = AtomicI32::new(-1);
static REPLY_WRITE: AtomicI32 = AtomicI32::new(-1);
static CAPTURE_TID: AtomicU64 = AtomicU64::new(0);

struct Service {
	users: usize,
	thread: Option<JoinHandle<()>>,
}

static SERVICE: Mutex<Service> = Mutex::new(Service {
	users: 0,
	thread: None,
});

fn read_exact(fd: libc::c_int, buf: &mut [u8]) -> bool {
	let mut filled = 0;
	while filled < buf.len() {
		let n = sys::read_fd(fd, &mut buf[filled..]);
		if n == 0 {
			return false;
		}
		filled += n;
	}
	true
}

/// Waits for the capture thread's one-byte reply. Async-signal-safe.
fn wait_for_reply(fd: libc::c_int) -> bool {
	let deadline = sys::monotonic_ms() + REPLY_TIMEOUT_MS;
	loop {
		let now = sys::monotonic_ms();
		if now >= deadline {
			return false;
		}
		let mut pfd = libc::pollfd {
			fd,
			events: libc::POLLIN,
			revents: 0,
		};
		// SAFETY: one valid pollfd.
		let ready = unsafe { libc::poll(&mut pfd, 1, (deadline - now).min(1_000) as libc::c_int) };
		if ready > 0 {
			let mut byte = [0u8; 1];
			return sys::read_fd(fd, &mut byte) == 1;
		}
		if ready < 0 && sys::errno() != libc::EINTR {
			return false;
		}
	}
}

/// Hands a fatal signal to the capture thread and waits for it to finish.
///
/// Returns false if the capture thread could not serve it. The caller must
/// hold the capture guard. Async-signal-safe.
pub(crate) fn forward(
	monitor: MonitorType,
	signal: libc::c_int,
	info: *mut libc::siginfo_t,
	uc: *mut c_void,
) -> bool {
	let capture = CAPTURE_TID.load(Ordering::Acquire);
	let request = REQUEST_WRITE.load(Ordering::Acquire);
	let reply = REPLY_READ.load(Ordering::Acquire);
	let tid = sys::current_thread_id();
	if capture == 0 || capture == tid || request < 0 || reply < 0 {
		return false;
	}
	let trigger = fatal::trigger_from(monitor, signal, info);
	let message = CaptureRequest {
		kind: KIND_CAPTURE,
		signal,
		code: trigger.signal_code,
		has_address: trigger.fault_address.is_some() as u32,
		monitor: monitor.bits(),
		reserved: 0,
		fault_address: trigger.fault_address.unwrap_or(0),
		tid,
		uc: uc as usize,
		timestamp_us: trigger.timestamp_us,
	};
	sys::write_fd(request, message.as_bytes()) && wait_for_reply(reply)
}

fn serve() {
	let request = REQUEST_READ.load(Ordering::Acquire);
	let reply = REPLY_WRITE.load(Ordering::Acquire);
	let me = sys::current_thread_id();
	let mut buf = [0u8; CaptureRequest::SIZE];
	loop {
		if !read_exact(request, &mut buf) {
			return;
		}
		let message = CaptureRequest::from_bytes(&buf);
		if message.kind == KIND_SHUTDOWN {
			return;
		}
		if message.kind != KIND_CAPTURE {
			continue;
		}
		let _scope = guard::act_for_owner();
		// SAFETY: the faulting thread holds the guard on our behalf and is
		// blocked in its handler, so its context stays valid until we reply.
		unsafe {
			if let Some(runtime) = CrashRuntime::current_in_handler() {
				runtime.record_fatal(
					message.trigger(),
					CrashedThread::Context {
						tid: message.tid,
						uc: message.uc as *const c_void,
					},
					ErrorDetail::of_kind(error_kind(message.monitor())),
					&[me],
				);
			}
		}
		sys::write_fd(reply, &[1]);
	}
}

fn open_pipe() -> std::io::Result<(libc::c_int, libc::c_int)> {
	let mut fds = [0 as libc::c_int; 2];
	// SAFETY: fds has room for two descriptors.
	if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
		return Err(std::io::Error::last_os_error());
	}
	Ok((fds[0], fds[1]))
}

fn close_all() {
	for fd in [&REQUEST_READ, &REQUEST_WRITE, &REPLY_READ, &REPLY_WRITE] {
		let old = fd.swap(-1, Ordering::AcqRel);
		if old >= 0 {
			// SAFETY: the descriptor was opened by `open_pipe` and is no longer published.
			unsafe { libc::close(old) };
		}
	}
}

fn start(monitor: &str) -> Result<JoinHandle<()>, CrashError> {
	let fail = |e: std::io::Error| CrashError::install(monitor, e.to_string());
	let (request_read, request_write) = open_pipe().map_err(fail)?;
	let (reply_read, reply_write) = match open_pipe() {
		Ok(pair) => pair,
		Err(e) => {
			// SAFETY: descriptors just opened and never published.
			unsafe {
				libc::close(request_read);
				libc::close(request_write);
			}
			return Err(fail(e));
		}
	};
	REQUEST_READ.store(request_read, Ordering::Release);
	REQUEST_WRITE.store(request_write, Ordering::Release);
	REPLY_READ.store(reply_read, Ordering::Release);
	REPLY_WRITE.store(reply_write, Ordering::Release);

	let (ready_tx, ready_rx) = mpsc::channel();
	let handle = std::thread::Builder::new()
		.name("loom-crash-capture".to_string())
		.spawn(move || {
			// A fault on this thread is recorded in place.
			let _stack = AltStack::install_if_needed();
			CAPTURE_TID.store(sys::current_thread_id(), Ordering::Release);
			let _ = ready_tx.send(());
			serve();
			CAPTURE_TID.store(0, Ordering::Release);
		})
		.map_err(|e| {
			close_all();
			fail(e)
		})?;
	let _ = ready_rx.recv();
	debug!(monitor, "Started capture thread");
	Ok(handle)
}

fn stop(handle: JoinHandle<()>) {
	let shutdown = CaptureRequest {
		kind: KIND_SHUTDOWN,
		..Default::default()
	};
	sys::write_fd(REQUEST_WRITE.load(Ordering::Acquire), shutdown.as_bytes());
	if handle.join().is_err() {
		warn!("Capture thread panicked");
	}
	close_all();
	debug!("Stopped capture thread");
}

/// Starts the capture thread for the first monitor that needs it.
pub(crate) fn acquire(monitor: &str) -> Result<(), CrashError> {
	let mut service = SERVICE
		.lock()
		.map_err(|_| CrashError::install(monitor, "capture thread lock poisoned"))?;
	if service.thread.is_none() {
		service.thread = Some(start(monitor)?);
	}
	service.users += 1;
	Ok(())
}

/// Stops the capture thread once its last monitor is gone.
pub(crate) fn release() {
	let Ok(mut service) = SERVICE.lock() else {
		return;
	};
	service.users = service.users.saturating_sub(1);
	if service.users == 0 {
		if let Some(handle) = service.thread.take() {
			stop(handle);
		}
	}
}

pub(crate) fn is_running() -> bool {
	CAPTURE_TID.load(Ordering::Acquire) != 0
}

#[cfg(test)]
mod tests {
	use super::*;
	use serial_test::serial;

	#[test]
	fn request_bytes_roundtrip() {
		let message = CaptureRequest {
			kind: KIND_CAPTURE,
			signal: libc::SIGBUS,
			code: 2,
			has_address: 1,
			monitor: MonitorType::KERNEL_EXCEPTION.bits(),
			reserved: 0,
			fault_address: 0xdead,
			tid: 42,
			uc: 0x1000,
			timestamp_us: 7,
		};
		let mut buf = [0u8; CaptureRequest::SIZE];
		buf.copy_from_slice(message.as_bytes());
		let decoded = CaptureRequest::from_bytes(&buf);
		let trigger = decoded.trigger();
		assert_eq!(trigger.signal, libc::SIGBUS);
		assert_eq!(trigger.fault_address, Some(0xdead));
		assert_eq!(trigger.thread_id, 42);
		assert_eq!(trigger.monitor, MonitorType::KERNEL_EXCEPTION);
		assert_eq!(error_kind(decoded.monitor()), ErrorKind::KernelException);
		assert_eq!(error_kind(MonitorType::SIGNAL), ErrorKind::Signal);
	}

	#[test]
	#[serial(signal_handlers)]
	fn shared_by_every_user() {
		acquire("signal").unwrap();
		acquire("kernel_exception").unwrap();
		assert!(is_running());
		assert_ne!(REQUEST_WRITE.load(Ordering::Acquire), -1);

		release();
		assert!(is_running());

		release();
		assert!(!is_running());
		assert_eq!(REQUEST_WRITE.load(Ordering::Acquire), -1);
	}

	#[test]
	#[serial(signal_handlers)]
	fn forward_needs_a_running_capture_thread() {
		assert!(!forward(
			MonitorType::SIGNAL,
			libc::SIGABRT,
			std::ptr::null_mut(),
			std::ptr::null_mut()
		));
	}
}
