// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fingerprinting for grouping similar crash reports.

use sha2::{Digest, Sha256};

use crate::report::CrashReport;

/// Frames that contribute to the fingerprint.
const FINGERPRINT_FRAMES: usize = 5;

/// Compute a fingerprint for a crash report to group similar crashes.
///
/// The fingerprint is a SHA256 hash based on:
/// 1. Error kind plus exception name or signal number
/// 2. Top N in-app language frames (function + module)
/// 3. If no language frames, the crashed thread's top native frames as
///    image-relative offsets, so ASLR does not split groups
pub fn compute_fingerprint(report: &CrashReport) -> String {
	let mut hasher = Sha256::new();

	if let Some(crash) = &report.crash {
		hasher.update(crash.error.kind.as_str().as_bytes());
		hasher.update(b"|");
		if let Some(exc) = &crash.error.exception {
			hasher.update(exc.name.as_bytes());
		} else if let Some(sig) = &crash.error.signal {
			hasher.update(sig.signo.to_string().as_bytes());
		}
		hasher.update(b"|");
	}

	let stack = report.exception().map(|e| e.stack.as_slice()).unwrap_or(&[]);
	let in_app: Vec<_> = stack.iter().filter(|f| f.in_app).take(FINGERPRINT_FRAMES).collect();
	let chosen: Vec<_> = if in_app.is_empty() {
		stack.iter().take(FINGERPRINT_FRAMES).collect()
	} else {
		in_app
	};

	for frame in &chosen {
		if let Some(func) = &frame.function {
			hasher.update(func.as_bytes());
		}
		hasher.update(b"@");
		if let Some(module) = &frame.module {
			hasher.update(module.as_bytes());
		}
		hasher.update(b"|");
	}

	if chosen.is_empty() {
		if let Some(thread) = report.crashed_thread() {
			for addr in thread.frames.iter().take(FINGERPRINT_FRAMES) {
				match report.image_for(*addr) {
					Some(image) => {
						hasher.update(image.file_name().as_bytes());
						hasher.update(format!("+{:x}", addr - image.load_address).as_bytes());
					}
					None => hasher.update(format!("{addr:x}").as_bytes()),
				}
				hasher.update(b"|");
			}
		}
	}

	hex::encode(hasher.finalize())
}

/// Find the culprit function (top in-app frame).
pub fn find_culprit(report: &CrashReport) -> Option<String> {
	report
		.exception()?
		.stack
		.iter()
		.find(|f| f.in_app)
		.and_then(|f| f.function.clone())
}

/// Truncate a string to a maximum length with ellipsis.
pub fn truncate(s: &str, max_len: usize) -> String {
	if s.len() <= max_len {
		return s.to_string();
	}
	let mut end = max_len.saturating_sub(3);
	while end > 0 && !s.is_char_boundary(end) {
		end -= 1;
	}
	format!("{}...", &s[..end])
}
