// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The crash context: fixed-capacity storage populated during a capture.
//!
//! Allocated once at install. Every mutation after that works on the
//! preallocated slots, so a capture never allocates and a full buffer only
//! sets a `truncated` flag.

use loom_crash_core::{CrashError, MonitorType};

use crate::sys;

pub(crate) const MAX_REGISTERS: usize = 40;
pub(crate) const MEMORY_SAMPLES: usize = 4;
pub(crate) const MEMORY_SAMPLE_BYTES: usize = 64;
pub(crate) const THREAD_NAME_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
	pub name: &'static str,
	pub value: u64,
}

impl Register {
	pub const fn new(name: &'static str, value: u64) -> Self {
		Self { name, value }
	}
}

const NO_REGISTER: Register = Register::new("", 0);

/// A string in a fixed buffer.
pub(crate) struct FixedStr<const N: usize> {
	buf: [u8; N],
	len: usize,
}

impl<const N: usize> FixedStr<N> {
	pub(crate) const fn new() -> Self {
		Self { buf: [0; N], len: 0 }
	}

	/// Copies `bytes`, cutting on a UTF-8 boundary when it does not fit.
	pub(crate) fn set(&mut self, bytes: &[u8]) {
		let mut len = bytes.len().min(N);
		if len < bytes.len() {
			while len > 0 && bytes[len] & 0b1100_0000 == 0b1000_0000 {
				len -= 1;
			}
		}
		self.buf[..len].copy_from_slice(&bytes[..len]);
		self.len = len;
	}

	pub(crate) fn clear(&mut self) {
		self.len = 0;
	}

	pub(crate) fn as_bytes(&self) -> &[u8] {
		&self.buf[..self.len]
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.len == 0
	}
}

#[derive(Clone, Copy)]
pub(crate) struct MemorySlot {
	pub(crate) address: u64,
	bytes: [u8; MEMORY_SAMPLE_BYTES],
	pub(crate) readable: bool,
}

impl MemorySlot {
	const EMPTY: Self = Self {
		address: 0,
		bytes: [0; MEMORY_SAMPLE_BYTES],
		readable: false,
	};

	pub(crate) fn bytes(&self) -> &[u8] {
		if self.readable {
			&self.bytes
		} else {
			&[]
		}
	}
}

/// One thread's record inside the context.
pub(crate) struct ThreadSlot {
	pub(crate) id: u64,
	pub(crate) name: FixedStr<THREAD_NAME_BYTES>,
	pub(crate) crashed: bool,
	pub(crate) current: bool,
	registers: [Register; MAX_REGISTERS],
	register_count: usize,
	pub(crate) registers_truncated: bool,
	frames: Box<[u64]>,
	frame_count: usize,
	pub(crate) frames_truncated: bool,
	memory: [MemorySlot; MEMORY_SAMPLES],
	memory_count: usize,
}

impl ThreadSlot {
	fn with_frame_capacity(max_frames: usize) -> Self {
		Self {
			id: 0,
			name: FixedStr::new(),
			crashed: false,
			current: false,
			registers: [NO_REGISTER; MAX_REGISTERS],
			register_count: 0,
			registers_truncated: false,
			frames: vec![0u64; max_frames].into_boxed_slice(),
			frame_count: 0,
			frames_truncated: false,
			memory: [MemorySlot::EMPTY; MEMORY_SAMPLES],
			memory_count: 0,
		}
	}

	pub(crate) fn clear(&mut self) {
		self.id = 0;
		self.name.clear();
		self.crashed = false;
		self.current = false;
		self.register_count = 0;
		self.registers_truncated = false;
		self.frame_count = 0;
		self.frames_truncated = false;
		self.memory_count = 0;
	}

	/// Reads the thread name from the OS when none was set.
	pub(crate) fn fill_name(&mut self) {
		if self.name.is_empty() && self.id != 0 {
			let mut buf = [0u8; THREAD_NAME_BYTES];
			let n = sys::thread_name(self.id, &mut buf);
			self.name.set(&buf[..n]);
		}
	}

	pub(crate) fn push_register(&mut self, register: Register) {
		if self.register_count == MAX_REGISTERS {
			self.registers_truncated = true;
			return;
		}
		self.registers[self.register_count] = register;
		self.register_count += 1;
	}

	/// Appends a return address. Returns false once the frame buffer is full.
	pub(crate) fn push_frame(&mut self, address: u64) -> bool {
		if self.frame_count == self.frames.len() {
			self.frames_truncated = true;
			return false;
		}
		self.frames[self.frame_count] = address;
		self.frame_count += 1;
		true
	}

	/// Copies memory around `address` through the fault-tolerant reader.
	pub(crate) fn sample_memory(&mut self, address: u64) {
		if address == 0 || self.memory_count == MEMORY_SAMPLES {
			return;
		}
		let start = address.saturating_sub(MEMORY_SAMPLE_BYTES as u64 / 2) & !0xf;
		if self.memory[..self.memory_count].iter().any(|m| m.address == start) {
			return;
		}
		let slot = &mut self.memory[self.memory_count];
		slot.address = start;
		slot.readable = sys::read_memory(start, &mut slot.bytes);
		self.memory_count += 1;
	}

	pub(crate) fn registers(&self) -> &[Register] {
		&self.registers[..self.register_count]
	}

	pub(crate) fn frames(&self) -> &[u64] {
		&self.frames[..self.frame_count]
	}

	pub(crate) fn memory(&self) -> &[MemorySlot] {
		&self.memory[..self.memory_count]
	}

	#[cfg(test)]
	pub(crate) fn register(&self, name: &str) -> Option<u64> {
		self.registers().iter().find(|r| r.name == name).map(|r| r.value)
	}
}

/// What fired, when and where.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TriggerInfo {
	pub(crate) monitor: MonitorType,
	pub(crate) signal: i32,
	pub(crate) signal_code: i32,
	pub(crate) fault_address: Option<u64>,
	pub(crate) timestamp_us: u64,
	pub(crate) thread_id: u64,
	pub(crate) on_main_thread: bool,
}

impl TriggerInfo {
	/// A trigger on the calling thread, stamped now.
	pub(crate) fn now(monitor: MonitorType) -> Self {
		let thread_id = sys::current_thread_id();
		Self {
			monitor,
			timestamp_us: sys::realtime_us(),
			thread_id,
			on_main_thread: thread_id == sys::process_id() as u64,
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
	pub max_threads: usize,
	pub max_frames: usize,
	pub introspect_memory: bool,
}

impl Default for CaptureLimits {
	fn default() -> Self {
		Self {
			max_threads: 128,
			max_frames: 128,
			introspect_memory: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CapturePhase {
	Idle,
	Capturing,
	Finalized,
}

pub(crate) struct CaptureContext {
	limits: CaptureLimits,
	phase: CapturePhase,
	trigger: TriggerInfo,
	slots: Box<[ThreadSlot]>,
	used: usize,
	threads_truncated: bool,
}

impl CaptureContext {
	/// Allocates every slot up front. Not async-signal-safe.
	pub(crate) fn new(limits: CaptureLimits) -> Self {
		let max_threads = limits.max_threads.max(1);
		let max_frames = limits.max_frames.max(1);
		let slots = (0..max_threads)
			.map(|_| ThreadSlot::with_frame_capacity(max_frames))
			.collect::<Vec<_>>()
			.into_boxed_slice();
		Self {
			limits,
			phase: CapturePhase::Idle,
			trigger: TriggerInfo::default(),
			slots,
			used: 0,
			threads_truncated: false,
		}
	}

	/// Starts a capture. Returns false if one is already active.
	pub(crate) fn begin_capture(&mut self, trigger: TriggerInfo) -> bool {
		if self.phase != CapturePhase::Idle {
			return false;
		}
		for slot in &mut self.slots[..self.used] {
			slot.clear();
		}
		self.used = 0;
		self.threads_truncated = false;
		self.trigger = trigger;
		self.phase = CapturePhase::Capturing;
		true
	}

	/// Takes the next free slot, or marks the thread list truncated.
	pub(crate) fn claim_slot(&mut self) -> Option<&mut ThreadSlot> {
		self.claim_slot_ptr().map(|slot| {
			// SAFETY: the pointer was just derived from `self.slots`.
			unsafe { &mut *slot }
		})
	}

	/// Raw form of [`claim_slot`](Self::claim_slot), for slots filled by
	/// another thread's signal handler during suspension.
	pub(crate) fn claim_slot_ptr(&mut self) -> Option<*mut ThreadSlot> {
		if self.phase != CapturePhase::Capturing {
			return None;
		}
		if self.used == self.slots.len() {
			self.threads_truncated = true;
			return None;
		}
		let index = self.used;
		self.used += 1;
		let slot = &mut self.slots[index];
		slot.clear();
		Some(slot as *mut ThreadSlot)
	}

	/// Appends one thread record from already-captured values.
	pub(crate) fn record_thread(
		&mut self,
		id: u64,
		registers: &[Register],
		frames: &[u64],
	) -> Result<(), CrashError> {
		let Some(slot) = self.claim_slot() else {
			return Err(CrashError::CaptureTruncation { field: "threads" });
		};
		slot.id = id;
		for register in registers {
			slot.push_register(*register);
		}
		for frame in frames {
			if !slot.push_frame(*frame) {
				break;
			}
		}
		slot.fill_name();
		Ok(())
	}

	/// Marks the context read-only. Returns false if no capture was active.
	pub(crate) fn finalize(&mut self) -> bool {
		if self.phase != CapturePhase::Capturing {
			return false;
		}
		self.phase = CapturePhase::Finalized;
		true
	}

	/// Returns to idle after a report was written, keeping the allocations.
	pub(crate) fn reset(&mut self) {
		self.phase = CapturePhase::Idle;
	}

	pub(crate) fn trigger(&self) -> &TriggerInfo {
		&self.trigger
	}

	pub(crate) fn threads(&self) -> &[ThreadSlot] {
		&self.slots[..self.used]
	}

	pub(crate) fn threads_truncated(&self) -> bool {
		self.threads_truncated
	}

	/// Flags the recorded thread `tid` as the crashed one.
	pub(crate) fn mark_crashed(&mut self, tid: u64) -> bool {
		match self.slots[..self.used].iter_mut().find(|t| t.id == tid) {
			Some(slot) => {
				slot.crashed = true;
				true
			}
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limits(max_threads: usize, max_frames: usize) -> CaptureLimits {
		CaptureLimits {
			max_threads,
			max_frames,
			introspect_memory: false,
		}
	}

	#[test]
	fn begin_capture_twice_is_rejected() {
		let mut ctx = CaptureContext::new(limits(2, 4));
		assert!(ctx.begin_capture(TriggerInfo::now(MonitorType::SIGNAL)));
		assert!(!ctx.begin_capture(TriggerInfo::now(MonitorType::SIGNAL)));
		assert!(ctx.finalize());
		assert!(!ctx.begin_capture(TriggerInfo::default()));
		ctx.reset();
		assert!(ctx.begin_capture(TriggerInfo::default()));
		assert!(ctx.threads().is_empty());
	}

	#[test]
	fn record_thread_keeps_values_in_order() {
		let mut ctx = CaptureContext::new(limits(4, 8));
		ctx.begin_capture(TriggerInfo::default());
		let regs = [Register::new("pc", 0x1000), Register::new("sp", 0x7f00)];
		ctx.record_thread(11, &regs, &[0x1000, 0x2000, 0x3000]).unwrap();
		ctx.record_thread(12, &regs[..1], &[0x4000]).unwrap();

		let threads = ctx.threads();
		assert_eq!(threads.len(), 2);
		assert_eq!(threads[0].id, 11);
		assert_eq!(threads[0].registers(), &regs);
		assert_eq!(threads[0].frames(), &[0x1000, 0x2000, 0x3000]);
		assert_eq!(threads[1].register("pc"), Some(0x1000));
		assert!(!threads[0].frames_truncated);
	}

	#[test]
	fn full_buffers_truncate_instead_of_failing() {
		let mut ctx = CaptureContext::new(limits(1, 2));
		ctx.begin_capture(TriggerInfo::default());
		let regs: Vec<Register> = (0..MAX_REGISTERS + 3)
			.map(|i| Register::new("r", i as u64))
			.collect();
		ctx.record_thread(1, &regs, &[1, 2, 3, 4]).unwrap();

		let slot = &ctx.threads()[0];
		assert_eq!(slot.frames(), &[1, 2]);
		assert!(slot.frames_truncated);
		assert_eq!(slot.registers().len(), MAX_REGISTERS);
		assert!(slot.registers_truncated);

		let err = ctx.record_thread(2, &[], &[]).unwrap_err();
		assert!(matches!(err, CrashError::CaptureTruncation { field: "threads" }));
		assert!(ctx.threads_truncated());
		assert_eq!(ctx.threads().len(), 1);
	}

	#[test]
	fn fixed_str_cuts_on_char_boundary() {
		let mut name = FixedStr::<5>::new();
		name.set("abcé".as_bytes());
		assert_eq!(name.as_bytes(), "abcé".as_bytes());
		name.set("abcdé".as_bytes());
		assert_eq!(name.as_bytes(), b"abcd");
	}

	#[test]
	fn memory_sample_of_unmapped_address_is_unreadable() {
		let mut ctx = CaptureContext::new(limits(1, 1));
		ctx.begin_capture(TriggerInfo::default());
		let slot = ctx.claim_slot().unwrap();
		slot.sample_memory(0x10);
		slot.sample_memory(0x10);
		assert_eq!(slot.memory().len(), 1);
		assert!(!slot.memory()[0].readable);
		assert!(slot.memory()[0].bytes().is_empty());
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn memory_sample_of_live_stack_is_readable() {
		let local = [0xabu8; 128];
		let mut ctx = CaptureContext::new(limits(1, 1));
		ctx.begin_capture(TriggerInfo::default());
		let slot = ctx.claim_slot().unwrap();
		slot.sample_memory(local.as_ptr() as u64 + 64);
		assert!(slot.memory()[0].readable);
		assert!(slot.memory()[0].bytes().iter().all(|b| *b == 0xab));
	}

	#[test]
	fn claim_outside_capture_returns_none() {
		let mut ctx = CaptureContext::new(limits(1, 1));
		assert!(ctx.claim_slot().is_none());
		assert!(!ctx.finalize());
	}
}
