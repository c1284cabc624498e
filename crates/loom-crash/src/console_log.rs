// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Console log whose tail rides along in crash reports.
//!
//! The reporter keeps one log file per app beside its reports and starts it
//! empty on every run. Point a `tracing_subscriber::fmt` layer at a
//! [`ConsoleLog`] and each crash report ends with the last [`TAIL_BYTES`] of
//! what it wrote.
//!
//! ```no_run
//! use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};
//!
//! # fn example(reporter: &loom_crash::CrashReporter) {
//! if let Some(log) = reporter.console_log() {
//!     tracing_subscriber::registry()
//!         .with(fmt::layer().with_ansi(false).with_writer(log.clone()))
//!         .init();
//! }
//! # }
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use tracing_subscriber::fmt::MakeWriter;

use crate::sys;
use crate::writer::FdOutput;

/// Most log bytes copied into one report.
pub const TAIL_BYTES: u64 = 16 * 1024;

const CHUNK: usize = 512;

#[derive(Debug)]
struct Inner {
	path: PathBuf,
	/// Opened for append; shared by every writer.
	file: File,
	/// Read side for the capture path.
	reader: File,
}

/// Append-only log file captured into crash reports.
///
/// Clones share one file. Every write is a single `write(2)` on an
/// `O_APPEND` descriptor, so lines from different threads do not interleave.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
	inner: Arc<Inner>,
}

impl ConsoleLog {
	/// Starts a fresh log at `path`, discarding what the previous run wrote.
	pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
		let path = path.into();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		File::create(&path)?;
		let file = OpenOptions::new().append(true).open(&path)?;
		let reader = File::open(&path)?;
		debug!(path = %path.display(), "Opened console log");
		Ok(Self {
			inner: Arc::new(Inner { path, file, reader }),
		})
	}

	pub fn path(&self) -> &Path {
		&self.inner.path
	}

	pub(crate) fn read_fd(&self) -> RawFd {
		self.inner.reader.as_raw_fd()
	}

	/// Copies the log left at `path` by the previous run to `out`, framed by
	/// marker lines. Returns false when there was nothing to print.
	pub fn print_previous(path: &Path, out: &mut impl Write) -> io::Result<bool> {
		let contents = match std::fs::read(path) {
			Ok(contents) => contents,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
			Err(e) => return Err(e),
		};
		if contents.is_empty() {
			return Ok(false);
		}
		writeln!(out, "--- previous run log: {} ---", path.display())?;
		out.write_all(&contents)?;
		if !contents.ends_with(b"\n") {
			writeln!(out)?;
		}
		writeln!(out, "--- end of previous run log ---")?;
		Ok(true)
	}
}

impl Write for ConsoleLog {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		(&self.inner.file).write(buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		(&self.inner.file).flush()
	}
}

impl<'a> MakeWriter<'a> for ConsoleLog {
	type Writer = &'a File;

	fn make_writer(&'a self) -> Self::Writer {
		&self.inner.file
	}
}

/// Streams the last [`TAIL_BYTES`] of the log behind `fd` to `out`.
///
/// A tail that starts mid-line skips ahead to the next line. Async-signal-safe.
pub(crate) fn copy_tail(fd: RawFd, out: &mut FdOutput<'_>) {
	let size = sys::file_size(fd);
	let mut offset = size.saturating_sub(TAIL_BYTES);
	let mut at_line_start = offset == 0;
	let mut chunk = [0u8; CHUNK];
	while offset < size && !out.failed() {
		let want = ((size - offset) as usize).min(CHUNK);
		let n = sys::pread_fd(fd, &mut chunk[..want], offset);
		if n == 0 {
			break;
		}
		let mut bytes = &chunk[..n];
		if !at_line_start {
			if let Some(newline) = bytes.iter().position(|b| *b == b'\n') {
				bytes = &bytes[newline + 1..];
			}
			at_line_start = true;
		}
		out.put(bytes);
		offset += n as u64;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::writer::write_buffer;
	use tempfile::TempDir;

	fn tail_of(log: &ConsoleLog, dir: &TempDir) -> Vec<u8> {
		let target = dir.path().join("tail");
		let file = File::create(&target).unwrap();
		let mut buf = write_buffer();
		let mut out = FdOutput::new(file.as_raw_fd(), &mut buf[..]);
		copy_tail(log.read_fd(), &mut out);
		out.flush_buffer();
		std::fs::read(target).unwrap()
	}

	#[test]
	fn starts_empty_and_appends() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("logs/app-console.log");
		std::fs::create_dir_all(path.parent().unwrap()).unwrap();
		std::fs::write(&path, "from the last run\n").unwrap();

		let mut log = ConsoleLog::create(&path).unwrap();
		let mut clone = log.clone();
		writeln!(log, "first").unwrap();
		writeln!(clone, "second").unwrap();
		assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
		assert_eq!(tail_of(&log, &dir), b"first\nsecond\n");
	}

	#[test]
	fn long_log_keeps_whole_lines_from_the_end() {
		let dir = TempDir::new().unwrap();
		let log = ConsoleLog::create(dir.path().join("app-console.log")).unwrap();
		let mut writer = log.make_writer();
		for i in 0..2_000 {
			writeln!(writer, "line {i:05} of the console log").unwrap();
		}

		let tail = tail_of(&log, &dir);
		assert!(tail.len() as u64 <= TAIL_BYTES);
		assert!(tail.starts_with(b"line "));
		assert!(tail.ends_with(b"line 01999 of the console log\n"));
	}

	#[test]
	fn previous_log_is_framed() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("app-console.log");
		let mut out = Vec::new();
		assert!(!ConsoleLog::print_previous(&path, &mut out).unwrap());

		std::fs::write(&path, "boot\nno newline").unwrap();
		assert!(ConsoleLog::print_previous(&path, &mut out).unwrap());
		let printed = String::from_utf8(out).unwrap();
		assert!(printed.starts_with("--- previous run log: "));
		assert!(printed.contains("boot\nno newline\n--- end of previous run log ---\n"));
	}
}
