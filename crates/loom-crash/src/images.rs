// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Loaded binary images.
//!
//! Enumerated with `dl_iterate_phdr` on normal threads only; the loader's
//! lock makes this unusable from a signal handler.

use loom_crash_core::BinaryImage;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod platform {
	use std::ffi::{c_void, CStr};

	use super::BinaryImage;

	const NT_GNU_BUILD_ID: u32 = 3;

	fn align4(n: usize) -> usize {
		(n + 3) & !3
	}

	/// Finds the GNU build-id inside one PT_NOTE segment.
	pub(super) fn find_build_id(notes: &[u8]) -> Option<String> {
		let mut offset = 0usize;
		while offset + 12 <= notes.len() {
			let word = |at: usize| {
				u32::from_ne_bytes([notes[at], notes[at + 1], notes[at + 2], notes[at + 3]])
			};
			let namesz = word(offset) as usize;
			let descsz = word(offset + 4) as usize;
			let kind = word(offset + 8);
			let name_start = offset + 12;
			let desc_start = name_start + align4(namesz);
			let desc_end = desc_start + descsz;
			if desc_end > notes.len() {
				return None;
			}
			if kind == NT_GNU_BUILD_ID && &notes[name_start..name_start + namesz] == b"GNU\0" {
				return Some(hex::encode(&notes[desc_start..desc_end]));
			}
			offset = desc_start + align4(descsz);
		}
		None
	}

	unsafe extern "C" fn collect(
		info: *mut libc::dl_phdr_info,
		_size: libc::size_t,
		data: *mut c_void,
	) -> libc::c_int {
		// SAFETY: dl_iterate_phdr passes a valid info struct and our Vec.
		let (info, images) = unsafe { (&*info, &mut *(data as *mut Vec<BinaryImage>)) };
		let base = info.dlpi_addr as u64;

		let mut low = u64::MAX;
		let mut high = 0u64;
		let mut uuid = None;
		// SAFETY: dlpi_phdr points at dlpi_phnum program headers.
		let headers = unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
		for header in headers {
			match header.p_type {
				libc::PT_LOAD => {
					low = low.min(header.p_vaddr as u64);
					high = high.max(header.p_vaddr as u64 + header.p_memsz as u64);
				}
				libc::PT_NOTE if uuid.is_none() => {
					let start = (base + header.p_vaddr as u64) as *const u8;
					// SAFETY: note segments are mapped for the life of the image.
					let notes = unsafe { std::slice::from_raw_parts(start, header.p_memsz as usize) };
					uuid = find_build_id(notes);
				}
				_ => {}
			}
		}
		if high == 0 {
			return 0;
		}

		let name = if info.dlpi_name.is_null() {
			String::new()
		} else {
			// SAFETY: dlpi_name is a NUL-terminated string owned by the loader.
			unsafe { CStr::from_ptr(info.dlpi_name) }.to_string_lossy().into_owned()
		};
		let path = if name.is_empty() && images.is_empty() {
			std::env::current_exe()
				.map(|p| p.display().to_string())
				.unwrap_or_default()
		} else {
			name
		};

		images.push(BinaryImage {
			path,
			load_address: base + low,
			size: high - low,
			uuid,
		});
		0
	}

	pub(super) fn enumerate() -> Vec<BinaryImage> {
		let mut images: Vec<BinaryImage> = Vec::new();
		// SAFETY: the callback only touches `images` through `data`.
		unsafe {
			libc::dl_iterate_phdr(Some(collect), &mut images as *mut Vec<BinaryImage> as *mut c_void);
		}
		images
	}

	unsafe extern "C" fn generation(
		info: *mut libc::dl_phdr_info,
		_size: libc::size_t,
		data: *mut c_void,
	) -> libc::c_int {
		// SAFETY: dl_iterate_phdr passes a valid info struct and our u64.
		unsafe {
			*(data as *mut u64) = ((*info).dlpi_adds as u64).wrapping_add((*info).dlpi_subs as u64);
		}
		1
	}

	pub(super) fn loader_generation() -> u64 {
		let mut value = 0u64;
		// SAFETY: the callback writes one u64 through `data`.
		unsafe {
			libc::dl_iterate_phdr(Some(generation), &mut value as *mut u64 as *mut c_void);
		}
		value
	}
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod platform {
	use super::BinaryImage;

	pub(super) fn enumerate() -> Vec<BinaryImage> {
		Vec::new()
	}

	pub(super) fn loader_generation() -> u64 {
		0
	}
}

/// Every image currently mapped into the process.
pub(crate) fn enumerate() -> Vec<BinaryImage> {
	platform::enumerate()
}

/// Changes whenever the loader adds or removes an image.
pub(crate) fn loader_generation() -> u64 {
	platform::loader_generation()
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
	use super::*;

	#[test]
	fn main_executable_is_first_and_contains_code() {
		let images = enumerate();
		assert!(!images.is_empty());
		let exe = &images[0];
		assert!(!exe.path.is_empty());
		let here = main_executable_is_first_and_contains_code as *const () as u64;
		assert!(images.iter().any(|img| img.contains(here)));
	}

	#[test]
	fn generation_is_stable_without_dlopen() {
		assert_eq!(loader_generation(), loader_generation());
	}

	#[test]
	fn build_id_note_is_parsed() {
		let mut note = Vec::new();
		note.extend_from_slice(&4u32.to_ne_bytes());
		note.extend_from_slice(&4u32.to_ne_bytes());
		note.extend_from_slice(&3u32.to_ne_bytes());
		note.extend_from_slice(b"GNU\0");
		note.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
		let id = platform::find_build_id(&note);
		assert_eq!(id.as_deref(), Some("deadbeef"));
	}
}
