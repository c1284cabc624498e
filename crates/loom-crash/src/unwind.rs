// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Register capture and frame-pointer stack walking.
//!
//! Walks read the stack through [`sys::read_word`], so a corrupt chain ends
//! the walk instead of faulting again. The workspace builds with
//! `force-frame-pointers`, which keeps the chain intact for Rust frames.

use std::ffi::c_void;

use crate::context::{Register, ThreadSlot};
use crate::sys;

/// The registers a walk starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MachineState {
	pub(crate) pc: u64,
	pub(crate) sp: u64,
	pub(crate) fp: u64,
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod arch {
	use super::*;

	// Indices into mcontext_t.gregs.
	const GREGS: [(&str, usize); 18] = [
		("rax", 13),
		("rbx", 11),
		("rcx", 14),
		("rdx", 12),
		("rsi", 9),
		("rdi", 8),
		("rbp", 10),
		("rsp", 15),
		("r8", 0),
		("r9", 1),
		("r10", 2),
		("r11", 3),
		("r12", 4),
		("r13", 5),
		("r14", 6),
		("r15", 7),
		("rip", 16),
		("rflags", 17),
	];
	const REG_RBP: usize = 10;
	const REG_RSP: usize = 15;
	const REG_RIP: usize = 16;
	const REG_CR2: usize = 22;

	/// # Safety
	///
	/// `uc` must point at the `ucontext_t` passed to a signal handler.
	pub(super) unsafe fn read(uc: *const c_void, slot: &mut ThreadSlot) -> MachineState {
		// SAFETY: per the function contract.
		let gregs = unsafe { &(*(uc as *const libc::ucontext_t)).uc_mcontext.gregs };
		for (name, index) in GREGS {
			slot.push_register(Register::new(name, gregs[index] as u64));
		}
		slot.push_register(Register::new("cr2", gregs[REG_CR2] as u64));
		MachineState {
			pc: gregs[REG_RIP] as u64,
			sp: gregs[REG_RSP] as u64,
			fp: gregs[REG_RBP] as u64,
		}
	}
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod arch {
	use super::*;

	const X_NAMES: [&str; 31] = [
		"x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
		"x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
		"x28", "fp", "lr",
	];

	/// # Safety
	///
	/// `uc` must point at the `ucontext_t` passed to a signal handler.
	pub(super) unsafe fn read(uc: *const c_void, slot: &mut ThreadSlot) -> MachineState {
		// SAFETY: per the function contract.
		let mc = unsafe { &(*(uc as *const libc::ucontext_t)).uc_mcontext };
		for (name, value) in X_NAMES.iter().zip(mc.regs.iter()) {
			slot.push_register(Register::new(name, *value));
		}
		slot.push_register(Register::new("sp", mc.sp));
		slot.push_register(Register::new("pc", mc.pc));
		slot.push_register(Register::new("pstate", mc.pstate));
		MachineState {
			pc: mc.pc,
			sp: mc.sp,
			fp: mc.regs[29],
		}
	}
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
mod arch {
	use super::*;

	pub(super) unsafe fn read(_uc: *const c_void, _slot: &mut ThreadSlot) -> MachineState {
		MachineState::default()
	}
}

/// Follows the frame-pointer chain from `fp`, appending return addresses.
///
/// Each frame stores the caller's frame pointer at `fp` and the return
/// address at `fp + 8`. Stops on a null, misaligned or non-increasing frame
/// pointer, an unreadable word, or a full frame buffer.
pub(crate) fn walk_frame_pointers(slot: &mut ThreadSlot, mut fp: u64) {
	let mut prev = 0u64;
	while fp != 0 {
		if fp % std::mem::align_of::<usize>() as u64 != 0 {
			break;
		}
		if prev != 0 && fp <= prev {
			break;
		}
		let (Some(next), Some(ret)) = (sys::read_word(fp), sys::read_word(fp + 8)) else {
			break;
		};
		if ret == 0 || !slot.push_frame(ret) {
			break;
		}
		prev = fp;
		fp = next;
	}
}

/// Records registers, frames and memory samples from a signal context.
///
/// # Safety
///
/// `uc` must point at the `ucontext_t` passed to a signal handler, or be null.
pub(crate) unsafe fn record_from_ucontext(
	slot: &mut ThreadSlot,
	uc: *const c_void,
	fault_address: Option<u64>,
	introspect_memory: bool,
) {
	if uc.is_null() {
		return;
	}
	// SAFETY: per the function contract.
	let state = unsafe { arch::read(uc, slot) };
	if state.pc != 0 {
		slot.push_frame(state.pc);
	}
	walk_frame_pointers(slot, state.fp);
	if introspect_memory {
		slot.sample_memory(state.sp);
		if let Some(address) = fault_address {
			slot.sample_memory(address);
		}
	}
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn current_state() -> MachineState {
	let (pc, sp, fp): (u64, u64, u64);
	// SAFETY: reads registers only.
	unsafe {
		core::arch::asm!(
			"lea {pc}, [rip]",
			"mov {sp}, rsp",
			"mov {fp}, rbp",
			pc = out(reg) pc,
			sp = out(reg) sp,
			fp = out(reg) fp,
			options(nomem, nostack, preserves_flags)
		);
	}
	MachineState { pc, sp, fp }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn current_state() -> MachineState {
	let (pc, sp, fp): (u64, u64, u64);
	// SAFETY: reads registers only.
	unsafe {
		core::arch::asm!(
			"adr {pc}, .",
			"mov {sp}, sp",
			"mov {fp}, x29",
			pc = out(reg) pc,
			sp = out(reg) sp,
			fp = out(reg) fp,
			options(nomem, nostack, preserves_flags)
		);
	}
	MachineState { pc, sp, fp }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn current_state() -> MachineState {
	MachineState::default()
}

/// Records the calling thread. Async-signal-safe; used by handlers that
/// have no machine context for the thread they run on.
#[inline(never)]
pub(crate) fn record_current_raw(slot: &mut ThreadSlot, introspect_memory: bool) {
	let state = current_state();
	slot.push_register(Register::new("pc", state.pc));
	slot.push_register(Register::new("sp", state.sp));
	slot.push_register(Register::new("fp", state.fp));
	walk_frame_pointers(slot, state.fp);
	if introspect_memory {
		slot.sample_memory(state.sp);
	}
}

/// Records the calling thread using the `backtrace` unwinder.
///
/// Handles frames built without frame pointers, but takes the unwinder's
/// lock and may allocate, so it is for normal threads only.
#[inline(never)]
pub(crate) fn record_current(slot: &mut ThreadSlot, introspect_memory: bool) {
	let state = current_state();
	slot.push_register(Register::new("pc", state.pc));
	slot.push_register(Register::new("sp", state.sp));
	slot.push_register(Register::new("fp", state.fp));
	backtrace::trace(|frame| slot.push_frame(frame.ip() as u64));
	if introspect_memory {
		slot.sample_memory(state.sp);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::{CaptureContext, CaptureLimits, TriggerInfo};

	fn context(max_frames: usize) -> CaptureContext {
		let mut ctx = CaptureContext::new(CaptureLimits {
			max_threads: 1,
			max_frames,
			introspect_memory: true,
		});
		ctx.begin_capture(TriggerInfo::default());
		ctx
	}

	#[test]
	fn walk_follows_a_synthetic_chain() {
		// Three frames laid out at increasing addresses, like a real stack.
		let mut stack = [0u64; 6];
		let base = stack.as_ptr() as u64;
		stack[0] = base + 16;
		stack[1] = 0xaaa;
		stack[2] = base + 32;
		stack[3] = 0xbbb;
		stack[4] = 0;
		stack[5] = 0xccc;

		let mut ctx = context(8);
		let slot = ctx.claim_slot().unwrap();
		walk_frame_pointers(slot, base);
		if cfg!(target_os = "linux") {
			assert_eq!(slot.frames(), &[0xaaa, 0xbbb, 0xccc]);
		}
	}

	#[test]
	fn walk_stops_on_loops_and_misalignment() {
		let mut stack = [0u64; 2];
		let base = stack.as_ptr() as u64;
		stack[0] = base;
		stack[1] = 0xaaa;

		let mut ctx = context(8);
		let slot = ctx.claim_slot().unwrap();
		walk_frame_pointers(slot, base);
		assert!(slot.frames().len() <= 1);

		let mut ctx = context(8);
		let slot = ctx.claim_slot().unwrap();
		walk_frame_pointers(slot, base + 3);
		assert!(slot.frames().is_empty());
	}

	#[test]
	fn walk_respects_frame_capacity() {
		let mut stack = [0u64; 8];
		let base = stack.as_ptr() as u64;
		for i in 0..4 {
			stack[i * 2] = base + (i as u64 + 1) * 16;
			stack[i * 2 + 1] = 0x100 + i as u64;
		}
		stack[6] = 0;

		let mut ctx = context(2);
		let slot = ctx.claim_slot().unwrap();
		walk_frame_pointers(slot, base);
		if cfg!(target_os = "linux") {
			assert_eq!(slot.frames(), &[0x100, 0x101]);
			assert!(slot.frames_truncated);
		}
	}

	#[test]
	fn record_current_captures_this_stack() {
		let mut ctx = context(64);
		let slot = ctx.claim_slot().unwrap();
		record_current(slot, true);
		assert!(slot.register("sp").is_some());
		assert!(slot.frames().len() >= 2);
	}

	#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
	#[test]
	fn raw_walk_finds_frames_with_frame_pointers() {
		let mut ctx = context(64);
		let slot = ctx.claim_slot().unwrap();
		record_current_raw(slot, false);
		assert!(!slot.frames().is_empty());
	}
}
