// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Async-signal-safe report writer.
//!
//! Streams a [`CaptureContext`] to an already-open descriptor in the record
//! format decoded by `loom_crash_core::format`. The writer uses a fixed
//! buffer and raw `write`/`pwrite`; it never allocates, locks or fails
//! loudly. A write error stops output and leaves the prefix on disk.

use std::io;
use std::os::fd::RawFd;

use loom_crash_core::format::{length_field, tag, END_MARKER, FORMAT_VERSION, LENGTH_PLACEHOLDER, MAGIC};
use loom_crash_core::{ErrorKind, ExceptionInfo, MonitorType};

use crate::app_state::AppStateTracker;
use crate::console_log;
use crate::context::{CaptureContext, ThreadSlot};
use crate::sys;

pub(crate) const BUFFER_SIZE: usize = 4096;
const MAX_DEPTH: usize = 16;

/// Staging buffer for one report, allocated ahead of any capture.
pub(crate) type WriteBuffer = [u8; BUFFER_SIZE];

pub(crate) fn write_buffer() -> Box<WriteBuffer> {
	Box::new([0; BUFFER_SIZE])
}

/// Buffered output over a raw file descriptor.
///
/// The buffer is borrowed so the fatal path keeps it off the handler stack.
pub(crate) struct FdOutput<'b> {
	fd: RawFd,
	buf: &'b mut [u8],
	len: usize,
	/// File offset of `buf[0]`.
	base: u64,
	failed: bool,
}

impl<'b> FdOutput<'b> {
	pub(crate) fn new(fd: RawFd, buf: &'b mut [u8]) -> Self {
		// SAFETY: lseek on any descriptor is harmless; failure yields -1.
		let base = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
		Self {
			fd,
			buf,
			len: 0,
			base: base.max(0) as u64,
			failed: base < 0,
		}
	}

	pub(crate) fn put(&mut self, mut bytes: &[u8]) {
		let capacity = self.buf.len();
		while !bytes.is_empty() && !self.failed {
			if self.len == capacity {
				self.flush_buffer();
				continue;
			}
			let take = bytes.len().min(capacity - self.len);
			self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
			self.len += take;
			bytes = &bytes[take..];
		}
	}

	pub(crate) fn position(&self) -> u64 {
		self.base + self.len as u64
	}

	pub(crate) fn flush_buffer(&mut self) {
		if self.failed || self.len == 0 {
			return;
		}
		if sys::write_fd(self.fd, &self.buf[..self.len]) {
			self.base += self.len as u64;
			self.len = 0;
		} else {
			self.failed = true;
		}
	}

	/// Overwrites already-emitted bytes at absolute offset `at`.
	pub(crate) fn patch(&mut self, at: u64, bytes: &[u8]) {
		if self.failed {
			return;
		}
		if at >= self.base {
			let start = (at - self.base) as usize;
			if start + bytes.len() <= self.len {
				self.buf[start..start + bytes.len()].copy_from_slice(bytes);
				return;
			}
		}
		self.flush_buffer();
		if self.failed {
			return;
		}
		// SAFETY: the pointer and length describe `bytes`.
		let n = unsafe {
			libc::pwrite(
				self.fd,
				bytes.as_ptr() as *const libc::c_void,
				bytes.len(),
				at as libc::off_t,
			)
		};
		if n != bytes.len() as isize {
			self.failed = true;
		}
	}

	pub(crate) fn failed(&self) -> bool {
		self.failed
	}
}

impl io::Write for FdOutput<'_> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.put(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		self.flush_buffer();
		Ok(())
	}
}

/// Minimal streaming JSON emitter that never allocates.
pub(crate) struct JsonWriter<'a, W: io::Write> {
	out: &'a mut W,
	first: [bool; MAX_DEPTH],
	depth: usize,
}

impl<'a, W: io::Write> JsonWriter<'a, W> {
	pub(crate) fn new(out: &'a mut W) -> Self {
		Self {
			out,
			first: [true; MAX_DEPTH],
			depth: 0,
		}
	}

	fn raw(&mut self, bytes: &[u8]) {
		let _ = self.out.write_all(bytes);
	}

	fn separator(&mut self) {
		let level = self.depth.min(MAX_DEPTH - 1);
		if !self.first[level] {
			self.raw(b",");
		}
		self.first[level] = false;
	}

	fn key(&mut self, key: Option<&str>) {
		self.separator();
		if let Some(key) = key {
			self.string(key.as_bytes());
			self.raw(b":");
		}
	}

	fn open(&mut self, key: Option<&str>, bracket: &[u8]) {
		self.key(key);
		self.raw(bracket);
		self.depth += 1;
		if self.depth < MAX_DEPTH {
			self.first[self.depth] = true;
		}
	}

	fn close(&mut self, bracket: &[u8]) {
		self.depth = self.depth.saturating_sub(1);
		self.raw(bracket);
	}

	pub(crate) fn begin_object(&mut self, key: Option<&str>) {
		self.open(key, b"{");
	}

	pub(crate) fn end_object(&mut self) {
		self.close(b"}");
	}

	pub(crate) fn begin_array(&mut self, key: Option<&str>) {
		self.open(key, b"[");
	}

	pub(crate) fn end_array(&mut self) {
		self.close(b"]");
	}

	/// Writes a quoted string. Invalid UTF-8 becomes U+FFFD.
	fn string(&mut self, bytes: &[u8]) {
		const HEX: &[u8; 16] = b"0123456789abcdef";
		self.raw(b"\"");
		for chunk in bytes.utf8_chunks() {
			let valid = chunk.valid().as_bytes();
			let mut start = 0;
			for (i, &b) in valid.iter().enumerate() {
				let escape: Option<&[u8]> = match b {
					b'"' => Some(&b"\\\""[..]),
					b'\\' => Some(&b"\\\\"[..]),
					b'\n' => Some(&b"\\n"[..]),
					b'\r' => Some(&b"\\r"[..]),
					b'\t' => Some(&b"\\t"[..]),
					0..=0x1f => None,
					_ => continue,
				};
				self.raw(&valid[start..i]);
				match escape {
					Some(seq) => self.raw(seq),
					None => self.raw(&[b'\\', b'u', b'0', b'0', HEX[(b >> 4) as usize], HEX[(b & 0xf) as usize]]),
				}
				start = i + 1;
			}
			self.raw(&valid[start..]);
			if !chunk.invalid().is_empty() {
				self.raw("\u{fffd}".as_bytes());
			}
		}
		self.raw(b"\"");
	}

	pub(crate) fn field_str(&mut self, key: &str, value: &[u8]) {
		self.key(Some(key));
		self.string(value);
	}

	pub(crate) fn field_u64(&mut self, key: &str, value: u64) {
		self.key(Some(key));
		self.u64(value);
	}

	pub(crate) fn field_i64(&mut self, key: &str, value: i64) {
		self.key(Some(key));
		if value < 0 {
			self.raw(b"-");
		}
		self.u64(value.unsigned_abs());
	}

	pub(crate) fn field_bool(&mut self, key: &str, value: bool) {
		self.key(Some(key));
		self.raw(if value { b"true" } else { b"false" });
	}

	/// Writes pre-encoded JSON as a field value.
	pub(crate) fn field_raw(&mut self, key: &str, json: &[u8]) {
		self.key(Some(key));
		self.raw(json);
	}

	pub(crate) fn field_null(&mut self, key: &str) {
		self.field_raw(key, b"null");
	}

	pub(crate) fn field_hex(&mut self, key: &str, bytes: &[u8]) {
		const HEX: &[u8; 16] = b"0123456789abcdef";
		self.key(Some(key));
		self.raw(b"\"");
		for b in bytes {
			self.raw(&[HEX[(b >> 4) as usize], HEX[(b & 0xf) as usize]]);
		}
		self.raw(b"\"");
	}

	/// Monitor set in its string form, without allocating.
	pub(crate) fn field_monitor(&mut self, key: &str, monitor: MonitorType) {
		self.key(Some(key));
		self.raw(b"\"");
		if monitor.is_empty() {
			self.raw(b"none");
		}
		let mut first = true;
		for kind in monitor.iter() {
			if !first {
				self.raw(b"|");
			}
			first = false;
			self.raw(kind.name().unwrap_or("unknown").as_bytes());
		}
		self.raw(b"\"");
	}

	/// Serializes with serde. Allocates, so normal context only.
	pub(crate) fn field_serde<T: serde::Serialize>(&mut self, key: &str, value: &T) {
		self.key(Some(key));
		if serde_json::to_writer(&mut *self.out, value).is_err() {
			self.raw(b"null");
		}
	}

	pub(crate) fn value_u64(&mut self, value: u64) {
		self.separator();
		self.u64(value);
	}

	fn u64(&mut self, value: u64) {
		let mut digits = [0u8; 20];
		let text = sys::fmt_u64(value, &mut digits);
		let _ = self.out.write_all(text);
	}
}

/// Identity fields for the header record.
pub(crate) struct ReportMeta<'a> {
	pub(crate) report_id: u64,
	pub(crate) uuid: &'a str,
	pub(crate) session_id: &'a str,
	pub(crate) app_name: &'a str,
	pub(crate) pid: i32,
}

/// Language-level detail supplied by normal-context callers.
#[derive(Clone, Copy)]
pub(crate) struct ErrorDetail<'a> {
	pub(crate) kind: ErrorKind,
	pub(crate) exception: Option<&'a ExceptionInfo>,
	pub(crate) deadlock_interval_ms: Option<u64>,
}

impl ErrorDetail<'_> {
	pub(crate) fn of_kind(kind: ErrorKind) -> Self {
		Self {
			kind,
			exception: None,
			deadlock_interval_ms: None,
		}
	}
}

/// Sections prepared ahead of time on normal threads.
#[derive(Default, Clone, Copy)]
pub(crate) struct PreparedView<'a> {
	pub(crate) system: Option<&'a [u8]>,
	/// Complete `image` records, concatenated.
	pub(crate) images: Option<&'a [u8]>,
	pub(crate) user: Option<&'a [u8]>,
	pub(crate) zombie: Option<&'a [u8]>,
	/// Read side of the console log.
	pub(crate) console_log: Option<RawFd>,
}

pub(crate) struct ReportWriter<'a> {
	out: FdOutput<'a>,
	meta: ReportMeta<'a>,
}

impl<'a> ReportWriter<'a> {
	pub(crate) fn new(fd: RawFd, buf: &'a mut WriteBuffer, meta: ReportMeta<'a>) -> Self {
		Self {
			out: FdOutput::new(fd, buf),
			meta,
		}
	}

	/// Writes the whole document, ending with the end marker.
	///
	/// Returns false if any write failed; the prefix already written stays.
	pub(crate) fn write(
		mut self,
		ctx: &CaptureContext,
		detail: ErrorDetail<'_>,
		prepared: PreparedView<'_>,
		app_state: Option<&AppStateTracker>,
	) -> bool {
		self.write_magic();
		self.write_header(ctx);
		self.write_system(prepared.system, app_state);
		for (index, thread) in ctx.threads().iter().enumerate() {
			self.write_thread(index, thread);
		}
		if let Some(images) = prepared.images {
			self.out.put(images);
		}
		if let Some(user) = prepared.user {
			self.record(tag::USER, |json| json.raw(user));
		}
		self.write_crash(ctx, detail, prepared.zombie);
		if let Some(fd) = prepared.console_log {
			self.raw_record(tag::CONSOLE_LOG, |out| console_log::copy_tail(fd, out));
		}
		self.finish()
	}

	pub(crate) fn write_magic(&mut self) {
		self.out.put(MAGIC);
	}

	/// Emits one JSON record.
	fn record(&mut self, name: &str, body: impl FnOnce(&mut JsonWriter<'_, FdOutput<'a>>)) {
		self.raw_record(name, |out| body(&mut JsonWriter::new(out)));
	}

	/// Emits one record, patching its length once the body is known.
	fn raw_record(&mut self, name: &str, body: impl FnOnce(&mut FdOutput<'a>)) {
		self.out.put(name.as_bytes());
		self.out.put(b" ");
		let length_at = self.out.position();
		self.out.put(LENGTH_PLACEHOLDER);
		self.out.put(b" ");
		let body_start = self.out.position();
		body(&mut self.out);
		let body_len = self.out.position() - body_start;
		self.out.put(b"\n");
		self.out.patch(length_at, &length_field(body_len as usize));
	}

	pub(crate) fn write_header(&mut self, ctx: &CaptureContext) {
		let trigger = *ctx.trigger();
		let meta = &self.meta;
		let (report_id, uuid, session, app, pid) =
			(meta.report_id, meta.uuid, meta.session_id, meta.app_name, meta.pid);
		self.record(tag::HEADER, |json| {
			json.begin_object(None);
			json.field_u64("format_version", FORMAT_VERSION as u64);
			json.field_u64("report_id", report_id);
			json.field_str("uuid", uuid.as_bytes());
			json.field_str("session_id", session.as_bytes());
			json.field_str("app_name", app.as_bytes());
			json.field_i64("pid", pid as i64);
			json.field_monitor("monitor", trigger.monitor);
			json.field_u64("timestamp_us", trigger.timestamp_us);
			json.field_u64("crashed_thread_id", trigger.thread_id);
			json.field_bool("on_main_thread", trigger.on_main_thread);
			json.end_object();
		});
	}

	fn write_system(&mut self, system: Option<&[u8]>, app_state: Option<&AppStateTracker>) {
		self.record(tag::SYSTEM, |json| {
			json.begin_object(None);
			match system {
				Some(info) => json.field_raw("info", info),
				None => json.field_null("info"),
			}
			if let Some(tracker) = app_state {
				json.begin_object(Some("application_state"));
				tracker.write_live(json);
				json.end_object();
			}
			json.end_object();
		});
	}

	pub(crate) fn write_thread(&mut self, index: usize, thread: &ThreadSlot) {
		self.record(tag::THREAD, |json| {
			json.begin_object(None);
			json.field_u64("index", index as u64);
			json.field_u64("id", thread.id);
			if !thread.name.is_empty() {
				json.field_str("name", thread.name.as_bytes());
			}
			json.field_bool("crashed", thread.crashed);
			json.field_bool("current", thread.current);
			json.begin_object(Some("registers"));
			for register in thread.registers() {
				json.field_u64(register.name, register.value);
			}
			json.end_object();
			json.field_bool("registers_truncated", thread.registers_truncated);
			json.begin_array(Some("frames"));
			for frame in thread.frames() {
				json.value_u64(*frame);
			}
			json.end_array();
			json.field_bool("frames_truncated", thread.frames_truncated);
			if !thread.memory().is_empty() {
				json.begin_array(Some("memory"));
				for sample in thread.memory() {
					json.begin_object(None);
					json.field_u64("address", sample.address);
					json.field_hex("bytes", sample.bytes());
					json.field_bool("readable", sample.readable);
					json.end_object();
				}
				json.end_array();
			}
			json.end_object();
		});
	}

	fn write_crash(&mut self, ctx: &CaptureContext, detail: ErrorDetail<'_>, zombie: Option<&[u8]>) {
		let trigger = *ctx.trigger();
		let thread_count = ctx.threads().len() as u64;
		let threads_truncated = ctx.threads_truncated();
		self.record(tag::CRASH, |json| {
			json.begin_object(None);
			json.field_monitor("monitor", trigger.monitor);
			json.begin_object(Some("error"));
			json.field_str("kind", detail.kind.as_str().as_bytes());
			if trigger.signal != 0 {
				json.begin_object(Some("signal"));
				json.field_i64("signo", trigger.signal as i64);
				json.field_i64("code", trigger.signal_code as i64);
				if let Some(name) = sys::signal_name(trigger.signal) {
					json.field_str("name", name.as_bytes());
				}
				if let Some(code) = sys::signal_code_name(trigger.signal, trigger.signal_code) {
					json.field_str("code_name", code.as_bytes());
				}
				json.end_object();
			}
			if let Some(address) = trigger.fault_address {
				json.field_u64("address", address);
			}
			if let Some(exception) = detail.exception {
				json.field_serde("exception", exception);
			}
			if let Some(interval) = detail.deadlock_interval_ms {
				json.field_u64("deadlock_interval_ms", interval);
			}
			json.end_object();
			json.field_u64("thread_count", thread_count);
			json.field_bool("threads_truncated", threads_truncated);
			if let Some(zombie) = zombie {
				json.field_raw("zombie", zombie);
			}
			json.end_object();
		});
	}

	/// Writes the end marker and flushes.
	pub(crate) fn finish(mut self) -> bool {
		self.out.put(END_MARKER);
		self.out.flush_buffer();
		// SAFETY: fsync on an open descriptor.
		unsafe { libc::fsync(self.out.fd) };
		!self.out.failed()
	}

	/// Flushes without the end marker.
	#[cfg(test)]
	fn abandon(mut self) {
		self.out.flush_buffer();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::{CaptureLimits, Register, TriggerInfo};
	use loom_crash_core::{decode_report, ReportId};
	use proptest::prelude::*;
	use std::io::Read;
	use std::os::fd::AsRawFd;

	fn meta() -> ReportMeta<'static> {
		ReportMeta {
			report_id: 3,
			uuid: "6f1c7a5e-2b43-4e0e-9d59-0ad6a1b2c3d4",
			session_id: "session-1",
			app_name: "demo",
			pid: 42,
		}
	}

	fn context(threads: u64) -> CaptureContext {
		let mut ctx = CaptureContext::new(CaptureLimits {
			max_threads: 8,
			max_frames: 16,
			introspect_memory: false,
		});
		let mut trigger = TriggerInfo::now(MonitorType::SIGNAL);
		trigger.signal = libc::SIGSEGV;
		trigger.signal_code = 1;
		trigger.fault_address = Some(0xdead);
		ctx.begin_capture(trigger);
		for i in 0..threads {
			let regs = [Register::new("pc", 0x1000 + i), Register::new("sp", 0x7000 - i)];
			ctx.record_thread(100 + i, &regs, &[0x1000 + i, 0x2000, 0x3000]).unwrap();
		}
		ctx.finalize();
		ctx
	}

	fn read_back(file: &mut std::fs::File) -> Vec<u8> {
		let mut bytes = Vec::new();
		use std::io::Seek;
		file.seek(std::io::SeekFrom::Start(0)).unwrap();
		file.read_to_end(&mut bytes).unwrap();
		bytes
	}

	fn json_of(write: impl FnOnce(&mut JsonWriter<'_, Vec<u8>>)) -> serde_json::Value {
		let mut out = Vec::new();
		write(&mut JsonWriter::new(&mut out));
		serde_json::from_slice(&out).unwrap()
	}

	#[test]
	fn complete_report_decodes_with_all_threads() {
		let mut file = tempfile::tempfile().unwrap();
		let mut buf = write_buffer();
		let ctx = context(3);
		let exception = ExceptionInfo {
			name: "Boom".to_string(),
			reason: Some("bad \"quote\"\n".to_string()),
			..Default::default()
		};
		let prepared = PreparedView {
			system: Some(br#"{"os":"linux"}"#),
			user: Some(br#"{"user_id":"u1"}"#),
			..Default::default()
		};
		let detail = ErrorDetail {
			kind: ErrorKind::Signal,
			exception: Some(&exception),
			deadlock_interval_ms: None,
		};
		assert!(ReportWriter::new(file.as_raw_fd(), &mut buf, meta()).write(&ctx, detail, prepared, None));

		let report = decode_report(ReportId(3), &read_back(&mut file));
		assert!(report.complete);
		assert_eq!(report.damaged_sections, 0);
		assert_eq!(report.threads.len(), 3);
		assert_eq!(report.threads[1].registers["pc"], 0x1001);
		assert_eq!(report.threads[1].frames, vec![0x1001, 0x2000, 0x3000]);

		let header = report.header.unwrap();
		assert_eq!(header.report_id, 3);
		assert_eq!(header.app_name, "demo");
		assert_eq!(header.monitor, MonitorType::SIGNAL);

		let crash = report.crash.unwrap();
		assert_eq!(crash.thread_count, 3);
		let signal = crash.error.signal.unwrap();
		assert_eq!(signal.name.as_deref(), Some("SIGSEGV"));
		assert_eq!(signal.code_name.as_deref(), Some("SEGV_MAPERR"));
		assert_eq!(crash.error.address, Some(0xdead));
		assert_eq!(crash.error.exception.unwrap().reason.as_deref(), Some("bad \"quote\"\n"));
		assert_eq!(report.user.unwrap()["user_id"], "u1");
		assert_eq!(report.system.unwrap()["info"]["os"], "linux");
	}

	#[test]
	fn console_log_tail_is_the_last_record() {
		let dir = tempfile::TempDir::new().unwrap();
		let mut log = crate::console_log::ConsoleLog::create(dir.path().join("console.log")).unwrap();
		{
			use std::io::Write;
			writeln!(log, "INFO loading config").unwrap();
			writeln!(log, "WARN cache \"cold\"").unwrap();
		}
		let mut file = tempfile::tempfile().unwrap();
		let mut buf = write_buffer();
		let prepared = PreparedView {
			console_log: Some(log.read_fd()),
			..Default::default()
		};
		assert!(ReportWriter::new(file.as_raw_fd(), &mut buf, meta()).write(
			&context(1),
			ErrorDetail::of_kind(ErrorKind::Signal),
			prepared,
			None
		));

		let bytes = read_back(&mut file);
		assert!(bytes.ends_with(b"INFO loading config\nWARN cache \"cold\"\n\nEND\n"));
		let report = decode_report(ReportId(3), &bytes);
		assert!(report.complete);
		assert_eq!(report.damaged_sections, 0);
		assert!(report.crash.is_some());
		assert_eq!(
			report.console_log.as_deref(),
			Some("INFO loading config\nWARN cache \"cold\"\n")
		);
	}

	#[test]
	fn interrupted_after_first_thread_keeps_header_and_thread() {
		let mut file = tempfile::tempfile().unwrap();
		let mut buf = write_buffer();
		let ctx = context(2);
		let mut writer = ReportWriter::new(file.as_raw_fd(), &mut buf, meta());
		writer.write_magic();
		writer.write_header(&ctx);
		writer.write_thread(0, &ctx.threads()[0]);
		writer.abandon();

		let report = decode_report(ReportId(3), &read_back(&mut file));
		assert!(!report.complete);
		assert_eq!(report.header.unwrap().report_id, 3);
		assert_eq!(report.threads.len(), 1);
		assert_eq!(report.threads[0].registers["sp"], 0x7000);
		assert_eq!(report.threads[0].frames, vec![0x1000, 0x2000, 0x3000]);
	}

	#[test]
	fn unpatched_record_ends_the_readable_prefix() {
		let mut file = tempfile::tempfile().unwrap();
		let mut buf = write_buffer();
		let ctx = context(1);
		let mut writer = ReportWriter::new(file.as_raw_fd(), &mut buf, meta());
		writer.write_magic();
		writer.write_header(&ctx);
		writer.out.put(b"thread ");
		writer.out.put(LENGTH_PLACEHOLDER);
		writer.out.put(br#" {"index":0,"id":1"#);
		writer.abandon();

		let report = decode_report(ReportId(3), &read_back(&mut file));
		assert!(!report.complete);
		assert!(report.header.is_some());
		assert!(report.threads.is_empty());
	}

	#[test]
	fn large_records_span_buffer_flushes() {
		let mut file = tempfile::tempfile().unwrap();
		let mut buf = write_buffer();
		let mut ctx = CaptureContext::new(CaptureLimits {
			max_threads: 64,
			max_frames: 128,
			introspect_memory: false,
		});
		ctx.begin_capture(TriggerInfo::now(MonitorType::USER_REPORTED));
		let frames: Vec<u64> = (0..128).map(|i| 0x5555_0000_0000 + i).collect();
		for i in 0..64 {
			ctx.record_thread(i, &[], &frames).unwrap();
		}
		let ok = ReportWriter::new(file.as_raw_fd(), &mut buf, meta()).write(
			&ctx,
			ErrorDetail::of_kind(ErrorKind::User),
			PreparedView::default(),
			None,
		);
		assert!(ok);
		let report = decode_report(ReportId(3), &read_back(&mut file));
		assert!(report.complete);
		assert_eq!(report.threads.len(), 64);
		assert!(report.threads.iter().all(|t| t.frames == frames));
	}

	#[test]
	fn json_writer_nests_and_separates() {
		let value = json_of(|json| {
			json.begin_object(None);
			json.field_u64("a", 1);
			json.begin_array(Some("b"));
			json.value_u64(2);
			json.value_u64(3);
			json.end_array();
			json.begin_object(Some("c"));
			json.field_bool("d", true);
			json.field_i64("e", -5);
			json.end_object();
			json.field_hex("f", &[0xde, 0xad]);
			json.field_monitor("g", MonitorType::SIGNAL | MonitorType::USER_REPORTED);
			json.end_object();
		});
		assert_eq!(
			value,
			serde_json::json!({
				"a": 1, "b": [2, 3], "c": {"d": true, "e": -5}, "f": "dead",
				"g": "signal|user_reported"
			})
		);
	}

	#[test]
	fn invalid_utf8_is_replaced() {
		let value = json_of(|json| {
			json.begin_object(None);
			json.field_str("name", b"ok\xffend");
			json.end_object();
		});
		assert_eq!(value["name"], "ok\u{fffd}end");
	}

	proptest! {
		#[test]
		fn escaped_strings_parse_back(s in any::<String>()) {
			let value = json_of(|json| {
				json.begin_object(None);
				json.field_str("s", s.as_bytes());
				json.end_object();
			});
			prop_assert_eq!(value["s"].as_str(), Some(s.as_str()));
		}
	}
}
