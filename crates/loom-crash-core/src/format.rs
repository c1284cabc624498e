// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! On-disk report format.
//!
//! ```text
//! LOOMCRASH 1\n
//! <tag> <len:10 digits> <compact json, len bytes>\n
//! ...
//! END\n
//! ```
//!
//! The capture path streams each record body before it knows the length, so it
//! writes `##########` as the length and patches the digits once the body is
//! complete. Bodies are compact JSON except `console_log`, which carries the
//! raw tail of the application's log. A reader stops at the first record
//! whose length is still the placeholder, whose body is short, or which is
//! otherwise malformed; every record before that point is kept. Only the
//! `END` marker makes a report complete.

use serde::Serialize;

use crate::error::Result;
use crate::report::{BinaryImage, CrashInfo, CrashReport, ReportHeader, ThreadRecord};
use crate::ReportId;

pub const MAGIC: &[u8] = b"LOOMCRASH 1\n";
pub const END_MARKER: &[u8] = b"END\n";
pub const FORMAT_VERSION: u32 = 1;
pub const LENGTH_WIDTH: usize = 10;
pub const LENGTH_PLACEHOLDER: &[u8; LENGTH_WIDTH] = b"##########";

/// Longest accepted record tag.
const MAX_TAG_LEN: usize = 16;

/// Record tags, in write order.
pub mod tag {
	pub const HEADER: &str = "header";
	pub const SYSTEM: &str = "system";
	pub const THREAD: &str = "thread";
	pub const IMAGE: &str = "image";
	pub const USER: &str = "user";
	pub const CRASH: &str = "crash";
	pub const CONSOLE_LOG: &str = "console_log";
}

/// Formats a record length as the fixed-width decimal field.
pub fn length_field(len: usize) -> [u8; LENGTH_WIDTH] {
	let mut out = [b'0'; LENGTH_WIDTH];
	let mut value = len;
	for slot in out.iter_mut().rev() {
		*slot = b'0' + (value % 10) as u8;
		value /= 10;
	}
	out
}

/// Appends one complete record.
pub fn push_record(out: &mut Vec<u8>, tag: &str, body: &[u8]) {
	out.extend_from_slice(tag.as_bytes());
	out.push(b' ');
	out.extend_from_slice(&length_field(body.len()));
	out.push(b' ');
	out.extend_from_slice(body);
	out.push(b'\n');
}

fn push_json<T: Serialize>(out: &mut Vec<u8>, tag: &str, value: &T) -> Result<()> {
	let body = serde_json::to_vec(value)?;
	push_record(out, tag, &body);
	Ok(())
}

/// Encodes a finished document.
///
/// Used on normal threads (store finalize, tooling). The output always carries
/// the end marker: encoding a document finalizes it.
pub fn encode_report(report: &CrashReport) -> Result<Vec<u8>> {
	let mut out = Vec::with_capacity(4096);
	out.extend_from_slice(MAGIC);
	if let Some(header) = &report.header {
		push_json(&mut out, tag::HEADER, header)?;
	}
	if let Some(system) = &report.system {
		push_json(&mut out, tag::SYSTEM, system)?;
	}
	for thread in &report.threads {
		push_json(&mut out, tag::THREAD, thread)?;
	}
	for image in &report.binary_images {
		push_json(&mut out, tag::IMAGE, image)?;
	}
	if let Some(user) = &report.user {
		push_json(&mut out, tag::USER, user)?;
	}
	if let Some(crash) = &report.crash {
		push_json(&mut out, tag::CRASH, crash)?;
	}
	if let Some(log) = &report.console_log {
		push_record(&mut out, tag::CONSOLE_LOG, log.as_bytes());
	}
	out.extend_from_slice(END_MARKER);
	Ok(out)
}

/// Splits the next record off `input`.
///
/// Returns `None` when the record is truncated or malformed; the caller treats
/// that as the end of the readable prefix.
fn next_record(input: &[u8]) -> Option<(&str, &[u8], &[u8])> {
	let search = &input[..input.len().min(MAX_TAG_LEN + 1)];
	let space = search.iter().position(|b| *b == b' ')?;
	let tag = std::str::from_utf8(&input[..space]).ok()?;
	if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
		return None;
	}

	let rest = &input[space + 1..];
	if rest.len() <= LENGTH_WIDTH {
		return None;
	}
	let len: usize = std::str::from_utf8(&rest[..LENGTH_WIDTH]).ok()?.parse().ok()?;
	if rest[LENGTH_WIDTH] != b' ' {
		return None;
	}

	let body_start = LENGTH_WIDTH + 1;
	let body_end = body_start.checked_add(len)?;
	if rest.len() <= body_end || rest[body_end] != b'\n' {
		return None;
	}
	Some((tag, &rest[body_start..body_end], &rest[body_end + 1..]))
}

fn apply_record(report: &mut CrashReport, tag: &str, body: &[u8]) {
	let parsed = match tag {
		tag::HEADER => serde_json::from_slice::<ReportHeader>(body).map(|h| report.header = Some(h)),
		tag::SYSTEM => serde_json::from_slice(body).map(|v| report.system = Some(v)),
		tag::THREAD => serde_json::from_slice::<ThreadRecord>(body).map(|t| report.threads.push(t)),
		tag::IMAGE => serde_json::from_slice::<BinaryImage>(body).map(|i| report.binary_images.push(i)),
		tag::USER => serde_json::from_slice(body).map(|v| report.user = Some(v)),
		tag::CRASH => serde_json::from_slice::<CrashInfo>(body).map(|c| report.crash = Some(c)),
		tag::CONSOLE_LOG => {
			report.console_log = Some(String::from_utf8_lossy(body).into_owned());
			Ok(())
		}
		_ => Ok(()),
	};
	if parsed.is_err() {
		report.damaged_sections += 1;
	}
}

/// Decodes a report file.
///
/// Never fails: whatever prefix is intact is returned, with `complete` telling
/// whether the writer reached the end marker.
pub fn decode_report(id: ReportId, bytes: &[u8]) -> CrashReport {
	let mut report = CrashReport::empty(id);
	let Some(mut rest) = bytes.strip_prefix(MAGIC) else {
		if !bytes.is_empty() {
			report.damaged_sections = 1;
		}
		return report;
	};

	while !rest.is_empty() {
		if rest.starts_with(END_MARKER) {
			report.complete = true;
			break;
		}
		match next_record(rest) {
			Some((tag, body, remaining)) => {
				apply_record(&mut report, tag, body);
				rest = remaining;
			}
			None => break,
		}
	}
	report
}
