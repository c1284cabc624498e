// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Thin platform layer.
//!
//! Everything here is async-signal-safe unless its doc says otherwise: raw
//! syscalls, caller-provided buffers, no allocation, no locks.

use std::ffi::c_void;
use std::os::fd::RawFd;
use std::ptr;

/// Kernel thread ID of the calling thread.
pub(crate) fn current_thread_id() -> u64 {
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		// SAFETY: gettid takes no arguments and cannot fail.
		unsafe { libc::syscall(libc::SYS_gettid) as u64 }
	}
	#[cfg(not(any(target_os = "linux", target_os = "android")))]
	{
		// SAFETY: pthread_self is async-signal-safe.
		unsafe { libc::pthread_self() as u64 }
	}
}

pub(crate) fn process_id() -> i32 {
	// SAFETY: getpid cannot fail.
	unsafe { libc::getpid() }
}

fn clock(id: libc::clockid_t) -> libc::timespec {
	let mut ts = libc::timespec {
		tv_sec: 0,
		tv_nsec: 0,
	};
	// SAFETY: ts is a valid out-pointer.
	unsafe { libc::clock_gettime(id, &mut ts) };
	ts
}

/// Milliseconds on the monotonic clock.
pub(crate) fn monotonic_ms() -> u64 {
	let ts = clock(libc::CLOCK_MONOTONIC);
	(ts.tv_sec as u64).saturating_mul(1000) + (ts.tv_nsec as u64) / 1_000_000
}

/// Microseconds since the Unix epoch.
pub(crate) fn realtime_us() -> u64 {
	let ts = clock(libc::CLOCK_REALTIME);
	(ts.tv_sec.max(0) as u64).saturating_mul(1_000_000) + (ts.tv_nsec as u64) / 1_000
}

pub(crate) fn sleep_ms(ms: u64) {
	let mut req = libc::timespec {
		tv_sec: (ms / 1000) as libc::time_t,
		tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
	};
	let mut rem = libc::timespec {
		tv_sec: 0,
		tv_nsec: 0,
	};
	// SAFETY: both pointers are valid for the duration of the call.
	while unsafe { libc::nanosleep(&req, &mut rem) } != 0 && errno() == libc::EINTR {
		req = rem;
	}
}

pub(crate) fn errno() -> i32 {
	std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Restores `errno` on drop so a handler does not clobber the interrupted code's value.
pub(crate) struct ErrnoGuard(i32);

impl ErrnoGuard {
	pub(crate) fn save() -> Self {
		Self(errno())
	}
}

impl Drop for ErrnoGuard {
	fn drop(&mut self) {
		#[cfg(any(target_os = "linux", target_os = "android"))]
		// SAFETY: __errno_location returns the calling thread's errno slot.
		unsafe {
			*libc::__errno_location() = self.0;
		}
	}
}

/// Writes all of `bytes`, retrying on EINTR and short writes.
pub(crate) fn write_fd(fd: RawFd, bytes: &[u8]) -> bool {
	let mut written = 0usize;
	while written < bytes.len() {
		// SAFETY: the pointer and length describe the unwritten tail of `bytes`.
		let n = unsafe {
			libc::write(
				fd,
				bytes[written..].as_ptr() as *const c_void,
				bytes.len() - written,
			)
		};
		if n > 0 {
			written += n as usize;
		} else if n < 0 && errno() == libc::EINTR {
			continue;
		} else {
			return false;
		}
	}
	true
}

/// Reads up to `buf.len()` bytes, retrying on EINTR. Returns bytes read.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> usize {
	loop {
		// SAFETY: buf is valid for writes of buf.len() bytes.
		let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
		if n >= 0 {
			return n as usize;
		}
		if errno() != libc::EINTR {
			return 0;
		}
	}
}

/// Reads up to `buf.len()` bytes at `offset`, retrying on EINTR. Returns
/// bytes read.
pub(crate) fn pread_fd(fd: RawFd, buf: &mut [u8], offset: u64) -> usize {
	loop {
		// SAFETY: buf is valid for writes of buf.len() bytes.
		let n = unsafe {
			libc::pread(
				fd,
				buf.as_mut_ptr() as *mut c_void,
				buf.len(),
				offset as libc::off_t,
			)
		};
		if n >= 0 {
			return n as usize;
		}
		if errno() != libc::EINTR {
			return 0;
		}
	}
}

/// Size of the file behind `fd`, or 0 if it cannot be read.
pub(crate) fn file_size(fd: RawFd) -> u64 {
	// SAFETY: fstat fills a zeroed plain-data struct.
	unsafe {
		let mut stat: libc::stat = std::mem::zeroed();
		if libc::fstat(fd, &mut stat) == 0 {
			stat.st_size.max(0) as u64
		} else {
			0
		}
	}
}

pub(crate) fn write_stderr(message: &[u8]) {
	let _ = write_fd(libc::STDERR_FILENO, message);
}

/// Copies memory from this process without faulting on unmapped addresses.
pub(crate) fn read_memory(address: u64, buf: &mut [u8]) -> bool {
	if address == 0 || buf.is_empty() {
		return false;
	}
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		let local = libc::iovec {
			iov_base: buf.as_mut_ptr() as *mut c_void,
			iov_len: buf.len(),
		};
		let remote = libc::iovec {
			iov_base: address as usize as *mut c_void,
			iov_len: buf.len(),
		};
		// SAFETY: process_vm_readv validates the remote range and returns an
		// error instead of faulting; the local iovec points at `buf`.
		let n = unsafe { libc::process_vm_readv(process_id(), &local, 1, &remote, 1, 0) };
		n == buf.len() as isize
	}
	#[cfg(not(any(target_os = "linux", target_os = "android")))]
	{
		false
	}
}

pub(crate) fn read_word(address: u64) -> Option<u64> {
	let mut buf = [0u8; 8];
	if read_memory(address, &mut buf) {
		Some(u64::from_ne_bytes(buf))
	} else {
		None
	}
}

/// Formats `value` as decimal into `buf`, returning the digits.
pub(crate) fn fmt_u64(mut value: u64, buf: &mut [u8; 20]) -> &[u8] {
	let mut pos = buf.len();
	loop {
		pos -= 1;
		buf[pos] = b'0' + (value % 10) as u8;
		value /= 10;
		if value == 0 {
			break;
		}
	}
	&buf[pos..]
}

/// Fixed-capacity byte builder for paths and messages on the fatal path.
pub(crate) struct StackBuf<const N: usize> {
	buf: [u8; N],
	len: usize,
}

impl<const N: usize> StackBuf<N> {
	pub(crate) const fn new() -> Self {
		Self { buf: [0; N], len: 0 }
	}

	/// Appends as much of `bytes` as fits. Returns false if anything was dropped.
	pub(crate) fn push(&mut self, bytes: &[u8]) -> bool {
		let room = N - self.len;
		let take = bytes.len().min(room);
		self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
		self.len += take;
		take == bytes.len()
	}

	pub(crate) fn push_u64(&mut self, value: u64) -> bool {
		let mut digits = [0u8; 20];
		self.push(fmt_u64(value, &mut digits))
	}

	#[cfg(test)]
	pub(crate) fn as_bytes(&self) -> &[u8] {
		&self.buf[..self.len]
	}

	/// NUL-terminated pointer, or `None` when there is no room for the terminator.
	pub(crate) fn as_c_ptr(&mut self) -> Option<*const libc::c_char> {
		if self.len >= N {
			return None;
		}
		self.buf[self.len] = 0;
		Some(self.buf.as_ptr() as *const libc::c_char)
	}
}

/// Reads `/proc/self/task/<tid>/comm` into `out`. Returns the name length.
pub(crate) fn thread_name(tid: u64, out: &mut [u8]) -> usize {
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		let mut path = StackBuf::<64>::new();
		path.push(b"/proc/self/task/");
		path.push_u64(tid);
		path.push(b"/comm");
		let Some(c_path) = path.as_c_ptr() else {
			return 0;
		};
		// SAFETY: c_path is NUL-terminated and outlives the call.
		let fd = unsafe { libc::open(c_path, libc::O_RDONLY | libc::O_CLOEXEC) };
		if fd < 0 {
			return 0;
		}
		let mut n = read_fd(fd, out);
		// SAFETY: fd was opened above.
		unsafe { libc::close(fd) };
		while n > 0 && (out[n - 1] == b'\n' || out[n - 1] == 0) {
			n -= 1;
		}
		n
	}
	#[cfg(not(any(target_os = "linux", target_os = "android")))]
	{
		let _ = (tid, out);
		0
	}
}

/// Calls `f` with the ID of every thread in this process.
///
/// Reads `/proc/self/task` with raw `getdents64` so it can run inside a
/// signal handler. Returns false when enumeration is unavailable.
pub(crate) fn for_each_thread(mut f: impl FnMut(u64)) -> bool {
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		const TASK_DIR: &[u8] = b"/proc/self/task\0";
		// SAFETY: TASK_DIR is NUL-terminated.
		let fd = unsafe {
			libc::open(
				TASK_DIR.as_ptr() as *const libc::c_char,
				libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
			)
		};
		if fd < 0 {
			return false;
		}

		let mut buf = [0u8; 2048];
		loop {
			// SAFETY: buf is valid for writes of buf.len() bytes.
			let n = unsafe {
				libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len())
			};
			if n <= 0 {
				break;
			}
			let n = n as usize;
			let mut offset = 0usize;
			// linux_dirent64: d_ino u64, d_off i64, d_reclen u16, d_type u8, d_name[]
			while offset + 19 < n {
				let reclen = u16::from_ne_bytes([buf[offset + 16], buf[offset + 17]]) as usize;
				if reclen == 0 || offset + reclen > n {
					break;
				}
				let name = &buf[offset + 19..offset + reclen];
				let mut tid = 0u64;
				let mut digits = 0;
				for &b in name {
					if !b.is_ascii_digit() {
						break;
					}
					tid = tid.saturating_mul(10).saturating_add((b - b'0') as u64);
					digits += 1;
				}
				if digits > 0 {
					f(tid);
				}
				offset += reclen;
			}
		}
		// SAFETY: fd was opened above.
		unsafe { libc::close(fd) };
		true
	}
	#[cfg(not(any(target_os = "linux", target_os = "android")))]
	{
		let _ = &mut f;
		false
	}
}

/// Sends `signal` to one thread of this process.
pub(crate) fn signal_thread(tid: u64, signal: libc::c_int) -> bool {
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		// SAFETY: tgkill with our own pid only reaches threads of this process.
		unsafe { libc::syscall(libc::SYS_tgkill, process_id(), tid as libc::pid_t, signal) == 0 }
	}
	#[cfg(not(any(target_os = "linux", target_os = "android")))]
	{
		let _ = (tid, signal);
		false
	}
}

/// Whether a tracer is attached. Not async-signal-safe.
pub(crate) fn debugger_attached() -> bool {
	let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
		return false;
	};
	status
		.lines()
		.find_map(|line| line.strip_prefix("TracerPid:"))
		.and_then(|pid| pid.trim().parse::<u32>().ok())
		.is_some_and(|pid| pid != 0)
}

pub(crate) fn signal_name(signal: libc::c_int) -> Option<&'static str> {
	let name = match signal {
		libc::SIGABRT => "SIGABRT",
		libc::SIGBUS => "SIGBUS",
		libc::SIGFPE => "SIGFPE",
		libc::SIGILL => "SIGILL",
		libc::SIGPIPE => "SIGPIPE",
		libc::SIGSEGV => "SIGSEGV",
		libc::SIGSYS => "SIGSYS",
		libc::SIGTRAP => "SIGTRAP",
		libc::SIGTERM => "SIGTERM",
		libc::SIGKILL => "SIGKILL",
		_ => return None,
	};
	Some(name)
}

/// Symbolic name of a Linux `si_code` for the given signal.
pub(crate) fn signal_code_name(signal: libc::c_int, code: libc::c_int) -> Option<&'static str> {
	let name = match (signal, code) {
		(_, 0) => "SI_USER",
		(_, 0x80) => "SI_KERNEL",
		(_, -1) => "SI_QUEUE",
		(_, -6) => "SI_TKILL",
		(libc::SIGSEGV, 1) => "SEGV_MAPERR",
		(libc::SIGSEGV, 2) => "SEGV_ACCERR",
		(libc::SIGBUS, 1) => "BUS_ADRALN",
		(libc::SIGBUS, 2) => "BUS_ADRERR",
		(libc::SIGBUS, 3) => "BUS_OBJERR",
		(libc::SIGFPE, 1) => "FPE_INTDIV",
		(libc::SIGFPE, 2) => "FPE_INTOVF",
		(libc::SIGFPE, 3) => "FPE_FLTDIV",
		(libc::SIGFPE, 4) => "FPE_FLTOVF",
		(libc::SIGFPE, 5) => "FPE_FLTUND",
		(libc::SIGFPE, 6) => "FPE_FLTRES",
		(libc::SIGFPE, 7) => "FPE_FLTINV",
		(libc::SIGFPE, 8) => "FPE_FLTSUB",
		(libc::SIGILL, 1) => "ILL_ILLOPC",
		(libc::SIGILL, 2) => "ILL_ILLOPN",
		(libc::SIGILL, 3) => "ILL_ILLADR",
		(libc::SIGILL, 4) => "ILL_ILLTRP",
		(libc::SIGILL, 5) => "ILL_PRVOPC",
		(libc::SIGILL, 6) => "ILL_PRVREG",
		(libc::SIGILL, 7) => "ILL_COPROC",
		(libc::SIGILL, 8) => "ILL_BADSTK",
		(libc::SIGTRAP, 1) => "TRAP_BRKPT",
		(libc::SIGTRAP, 2) => "TRAP_TRACE",
		_ => return None,
	};
	Some(name)
}

pub(crate) const ALT_STACK_SIZE: usize = 128 * 1024;

/// An `mmap`ed alternate signal stack for the installing thread.
///
/// Replaces a smaller stack the thread already had (std gives every thread a
/// few KiB) and puts it back on drop.
pub(crate) struct AltStack {
	base: *mut c_void,
	previous: Option<libc::stack_t>,
}

// SAFETY: the mapping is owned exclusively by this value; `previous` only
// describes memory owned by whoever installed it.
unsafe impl Send for AltStack {}

impl AltStack {
	/// Installs an alternate stack of at least `ALT_STACK_SIZE` on the calling
	/// thread unless it already has one that large.
	///
	/// Returns `None` when nothing was installed. Not async-signal-safe.
	pub(crate) fn install_if_needed() -> Option<Self> {
		// SAFETY: querying with a null new-stack pointer only reads state;
		// the new mapping is ours until `Drop`.
		unsafe {
			let mut current: libc::stack_t = std::mem::zeroed();
			if libc::sigaltstack(ptr::null(), &mut current) != 0 {
				return None;
			}
			let enabled = current.ss_flags & libc::SS_DISABLE == 0;
			if enabled && current.ss_size >= ALT_STACK_SIZE {
				return None;
			}
			if current.ss_flags & libc::SS_ONSTACK != 0 {
				return None;
			}

			let base = libc::mmap(
				ptr::null_mut(),
				ALT_STACK_SIZE,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_ANON,
				-1,
				0,
			);
			if base == libc::MAP_FAILED {
				return None;
			}
			let stack = libc::stack_t {
				ss_sp: base,
				ss_flags: 0,
				ss_size: ALT_STACK_SIZE,
			};
			if libc::sigaltstack(&stack, ptr::null_mut()) != 0 {
				libc::munmap(base, ALT_STACK_SIZE);
				return None;
			}
			Some(Self {
				base,
				previous: enabled.then_some(current),
			})
		}
	}
}

/// Size of the calling thread's alternate signal stack, 0 if it has none.
pub(crate) fn alt_stack_size() -> usize {
	// SAFETY: query only.
	unsafe {
		let mut current: libc::stack_t = std::mem::zeroed();
		if libc::sigaltstack(ptr::null(), &mut current) != 0
			|| current.ss_flags & libc::SS_DISABLE != 0
		{
			return 0;
		}
		current.ss_size
	}
}

impl Drop for AltStack {
	fn drop(&mut self) {
		// SAFETY: only touches the alternate stack if it is still ours, and
		// unmaps only after nothing can run on it.
		unsafe {
			let mut current: libc::stack_t = std::mem::zeroed();
			if libc::sigaltstack(ptr::null(), &mut current) != 0 {
				return;
			}
			if current.ss_sp != self.base {
				// Installed from another thread; the mapping must stay valid.
				return;
			}
			if current.ss_flags & libc::SS_ONSTACK != 0 {
				return;
			}
			let replacement = self.previous.unwrap_or(libc::stack_t {
				ss_sp: ptr::null_mut(),
				ss_flags: libc::SS_DISABLE,
				ss_size: 0,
			});
			if libc::sigaltstack(&replacement, ptr::null_mut()) == 0 {
				libc::munmap(self.base, ALT_STACK_SIZE);
			}
		}
	}
}
