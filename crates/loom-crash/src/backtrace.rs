// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Symbolized backtraces for panics and language-level exceptions.

use loom_crash_core::Frame;
use rustc_demangle::demangle;

/// Capture and symbolize the calling thread's stack.
///
/// Allocates and resolves symbols, so it must never run in a signal handler.
pub fn capture_backtrace() -> Vec<Frame> {
	let backtrace = backtrace::Backtrace::new();
	let mut frames = Vec::new();

	for frame in backtrace.frames() {
		let ip = frame.ip() as u64;
		let symbols = frame.symbols();
		if symbols.is_empty() {
			frames.push(Frame {
				instruction_addr: Some(ip),
				..Default::default()
			});
			continue;
		}
		// Inlined functions share one instruction pointer.
		for symbol in symbols {
			let mut parsed = symbol
				.name()
				.map(|name| frame_from_symbol(&format!("{name:#}")))
				.unwrap_or_default();
			parsed.filename = symbol.filename().map(|p| p.display().to_string());
			parsed.lineno = symbol.lineno();
			parsed.colno = symbol.colno();
			parsed.instruction_addr = Some(ip);
			frames.push(parsed);
		}
	}

	frames
}

/// Parse one line of a textual stack trace into a Frame.
///
/// Accepts `"  5: my_app::main"` as well as a bare symbol, mangled or not.
/// Returns `None` for blank lines and `at file:line` location lines.
pub fn parse_frame_line(line: &str) -> Option<Frame> {
	let line = line.trim();
	if line.is_empty() || line.starts_with("at ") {
		return None;
	}

	let function_part = match line.split_once(':') {
		Some((prefix, rest)) if prefix.trim().parse::<u32>().is_ok() => rest.trim(),
		_ => line,
	};
	if function_part.is_empty() {
		return None;
	}

	Some(frame_from_symbol(function_part))
}

fn frame_from_symbol(symbol: &str) -> Frame {
	let demangled = format!("{:#}", demangle(symbol));
	let module = demangled.rfind("::").map(|idx| demangled[..idx].to_string());
	let in_app = is_in_app_frame(&demangled);

	Frame {
		function: Some(demangled),
		module,
		in_app,
		..Default::default()
	}
}

/// Determine if a frame is from user application code vs standard library.
pub fn is_in_app_frame(function: &str) -> bool {
	// System/std library prefixes to exclude
	const SYSTEM_PREFIXES: &[&str] = &[
		"std::",
		"core::",
		"alloc::",
		"<std::",
		"<core::",
		"<alloc::",
		"tokio::",
		"<tokio::",
		"futures::",
		"<futures::",
		"async_trait::",
		"tracing::",
		"<tracing::",
		"backtrace::",
		"<backtrace::",
		"loom_crash::",
		"<loom_crash::",
		"panic_unwind::",
		"<panic_unwind::",
		"rust_begin_unwind",
		"rust_panic",
		"__rust_",
		"_rust_",
		"__libc_start",
		"_start",
		"__clone",
		"start_thread",
	];

	// Also exclude common runtime functions
	const SYSTEM_CONTAINS: &[&str] = &[
		"::panic::",
		"::panicking::",
		"::thread::",
		"::rt::",
		"::runtime::",
		"::sys_common::",
	];

	if SYSTEM_PREFIXES.iter().any(|prefix| function.starts_with(prefix)) {
		return false;
	}
	!SYSTEM_CONTAINS.iter().any(|needle| function.contains(needle))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_is_in_app_frame_excludes_std() {
		assert!(!is_in_app_frame("std::panic::panic_any"));
		assert!(!is_in_app_frame("core::panicking::panic"));
		assert!(!is_in_app_frame("alloc::vec::Vec::push"));
		assert!(!is_in_app_frame("tokio::runtime::Runtime::block_on"));
		assert!(!is_in_app_frame("loom_crash::monitors::panic::report"));
	}

	#[test]
	fn test_is_in_app_frame_includes_user_code() {
		assert!(is_in_app_frame("my_app::main"));
		assert!(is_in_app_frame("foo::bar::baz"));
	}

	#[test]
	fn test_parse_frame_line_demangled() {
		let frame = parse_frame_line("my_app::handlers::process").unwrap();
		assert_eq!(frame.function, Some("my_app::handlers::process".to_string()));
		assert_eq!(frame.module, Some("my_app::handlers".to_string()));
		assert!(frame.in_app);
	}

	#[test]
	fn test_parse_frame_line_with_number() {
		let frame = parse_frame_line("  5: my_app::main").unwrap();
		assert_eq!(frame.function, Some("my_app::main".to_string()));
	}

	#[test]
	fn test_parse_frame_line_mangled() {
		let frame = parse_frame_line("_ZN6my_app4main17h0123456789abcdefE").unwrap();
		assert_eq!(frame.function, Some("my_app::main".to_string()));
		assert_eq!(frame.module, Some("my_app".to_string()));
	}

	#[test]
	fn test_parse_frame_line_skips_locations() {
		assert!(parse_frame_line("      at ./src/main.rs:3:5").is_none());
		assert!(parse_frame_line("   ").is_none());
	}

	#[test]
	fn test_capture_backtrace_has_addresses() {
		let frames = capture_backtrace();
		assert!(!frames.is_empty());
		assert!(frames.iter().all(|f| f.instruction_addr.is_some()));
	}
}
