// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! On-disk report store.
//!
//! Reports live in one directory as `<app>-report-<id:016x>.crash`. A report
//! being written is `<…>.crash.tmp` and becomes visible only through an atomic
//! rename, so readers never observe a report mid-write.
//!
//! The armed temp file is held under an exclusive advisory lock for as long
//! as its process lives. Recovery leaves locked temp files alone, so opening
//! the store from a second process (the CLI, say) never touches a live slot.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use loom_crash_core::{decode_report, encode_report, CrashReport, ReportId};
use tracing::{debug, info, warn};

use crate::cell::SignalSafeCell;
use crate::error::StoreError;

const COUNTER_FILE: &str = "next-report-id";
const REPORT_SUFFIX: &str = ".crash";
const TEMP_SUFFIX: &str = ".crash.tmp";

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persisted reports, addressed by ID.
pub trait ReportStore: Send + Sync {
	/// IDs of published reports, newest first.
	fn list(&self) -> Result<Vec<ReportId>>;

	fn read(&self, id: ReportId) -> Result<CrashReport>;

	/// The report file's bytes, as written.
	fn read_raw(&self, id: ReportId) -> Result<Vec<u8>>;

	/// Removes a report. Deleting a missing report is not an error.
	fn delete(&self, id: ReportId) -> Result<()>;
}

/// A pre-opened report file waiting for a crash.
///
/// Everything the fatal path needs is prepared here on a normal thread:
/// the descriptor, both paths as C strings and the reports to evict when this
/// one is published.
pub(crate) struct ArmedSlot {
	id: ReportId,
	uuid: String,
	file: File,
	temp_path: PathBuf,
	temp_c: CString,
	final_c: CString,
	victims: SignalSafeCell<Vec<CString>>,
	consumed: AtomicBool,
}

impl ArmedSlot {
	pub(crate) fn id(&self) -> ReportId {
		self.id
	}

	pub(crate) fn uuid(&self) -> &str {
		&self.uuid
	}

	pub(crate) fn fd(&self) -> RawFd {
		self.file.as_raw_fd()
	}

	/// Claims the slot for one report. Async-signal-safe.
	pub(crate) fn try_consume(&self) -> bool {
		!self.consumed.swap(true, Ordering::AcqRel)
	}

	pub(crate) fn is_consumed(&self) -> bool {
		self.consumed.load(Ordering::Acquire)
	}

	/// Renames the temp file into place and unlinks the precomputed victims.
	/// Async-signal-safe.
	pub(crate) fn publish_in_handler(&self) -> bool {
		// SAFETY: both paths are NUL-terminated strings owned by this slot.
		let renamed = unsafe { libc::rename(self.temp_c.as_ptr(), self.final_c.as_ptr()) } == 0;
		if renamed {
			// SAFETY: the victims list is only replaced on normal threads, and
			// a replaced list is leaked while this thread holds the guard.
			if let Some(victims) = unsafe { self.victims.load() } {
				for victim in victims {
					// SAFETY: NUL-terminated path owned by the list.
					unsafe { libc::unlink(victim.as_ptr()) };
				}
			}
		}
		renamed
	}

	fn set_victims(&self, victims: Vec<CString>) {
		self.victims.publish(victims);
	}
}

/// Takes an exclusive lock on `file` without blocking. Returns false when
/// another open file holds it.
fn try_lock(file: &File) -> io::Result<bool> {
	match FileExt::try_lock_exclusive(file) {
		Ok(()) => Ok(true),
		Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
		Err(e) => Err(e),
	}
}

fn c_path(path: &Path) -> Result<CString> {
	CString::new(path.as_os_str().as_bytes()).map_err(|_| StoreError::InvalidPath(path.to_path_buf()))
}

/// Directory-backed [`ReportStore`] with a persisted ID counter and retention.
pub struct FileReportStore {
	dir: PathBuf,
	app_name: String,
	max_report_count: AtomicUsize,
	/// Held around the ID counter and every mutation of the directory.
	lock: Mutex<()>,
	armed: Mutex<Option<Arc<ArmedSlot>>>,
	/// The same slot, for crash handlers.
	armed_cell: SignalSafeCell<Arc<ArmedSlot>>,
}

impl FileReportStore {
	/// Opens (creating if needed) the store, recovers temp files a previous
	/// run left behind, then enforces retention.
	pub fn open(
		dir: impl Into<PathBuf>,
		app_name: impl Into<String>,
		max_report_count: usize,
	) -> Result<Self> {
		let store = Self {
			dir: dir.into(),
			app_name: app_name.into(),
			max_report_count: AtomicUsize::new(max_report_count.max(1)),
			lock: Mutex::new(()),
			armed: Mutex::new(None),
			armed_cell: SignalSafeCell::empty(),
		};
		std::fs::create_dir_all(&store.dir)?;
		{
			let _guard = store.lock()?;
			store.recover_orphans()?;
			store.enforce_retention_locked()?;
		}
		info!(
			dir = %store.dir.display(),
			app_name = %store.app_name,
			max_report_count = max_report_count,
			"Opened crash report store"
		);
		Ok(store)
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn app_name(&self) -> &str {
		&self.app_name
	}

	pub fn max_report_count(&self) -> usize {
		self.max_report_count.load(Ordering::Acquire)
	}

	pub fn set_max_report_count(&self, max: usize) -> Result<()> {
		self.max_report_count.store(max.max(1), Ordering::Release);
		let _guard = self.lock()?;
		self.enforce_retention_locked()?;
		self.refresh_victims()
	}

	fn lock(&self) -> Result<MutexGuard<'_, ()>> {
		self.lock.lock().map_err(|_| StoreError::LockError)
	}

	fn file_name(&self, id: ReportId, suffix: &str) -> String {
		format!("{}-report-{:016x}{suffix}", self.app_name, id.0)
	}

	/// Where the published report with this ID lives (whether or not it exists).
	pub fn report_path(&self, id: ReportId) -> PathBuf {
		self.dir.join(self.file_name(id, REPORT_SUFFIX))
	}

	fn temp_path(&self, id: ReportId) -> PathBuf {
		self.dir.join(self.file_name(id, TEMP_SUFFIX))
	}

	fn parse_name(&self, name: &str) -> Option<(ReportId, bool)> {
		let rest = name.strip_prefix(&self.app_name)?.strip_prefix("-report-")?;
		let (hex, temp) = match rest.strip_suffix(TEMP_SUFFIX) {
			Some(hex) => (hex, true),
			None => (rest.strip_suffix(REPORT_SUFFIX)?, false),
		};
		if hex.len() != 16 {
			return None;
		}
		u64::from_str_radix(hex, 16).ok().map(|id| (ReportId(id), temp))
	}

	/// Every report file in the directory, published and in progress.
	fn scan(&self) -> Result<Vec<(ReportId, bool)>> {
		let mut found = Vec::new();
		for entry in std::fs::read_dir(&self.dir)? {
			let entry = entry?;
			if let Some(parsed) = entry.file_name().to_str().and_then(|n| self.parse_name(n)) {
				found.push(parsed);
			}
		}
		Ok(found)
	}

	fn read_counter(&self) -> u64 {
		std::fs::read_to_string(self.dir.join(COUNTER_FILE))
			.ok()
			.and_then(|s| s.trim().parse().ok())
			.unwrap_or(0)
	}

	fn write_counter(&self, next: u64) -> Result<()> {
		let path = self.dir.join(COUNTER_FILE);
		let tmp = self.dir.join(format!("{COUNTER_FILE}.tmp"));
		std::fs::write(&tmp, next.to_string())?;
		std::fs::rename(&tmp, &path)?;
		Ok(())
	}

	/// Allocates the next report ID and persists the counter.
	///
	/// IDs are never reused: the result is above every ID still on disk even
	/// when the counter file was lost. An unused armed slot is moved to a
	/// newer ID so a later crash still sorts after this report.
	pub fn allocate_id(&self) -> Result<ReportId> {
		let _guard = self.lock()?;
		let id = self.allocate_id_locked()?;
		let pending = self
			.armed
			.lock()
			.map_err(|_| StoreError::LockError)?
			.as_ref()
			.is_some_and(|slot| !slot.is_consumed());
		if pending {
			self.arm_locked()?;
		}
		Ok(id)
	}

	fn allocate_id_locked(&self) -> Result<ReportId> {
		let highest = self.scan()?.into_iter().map(|(id, _)| id.0).max();
		let id = self
			.read_counter()
			.max(highest.map_or(0, |h| h.saturating_add(1)))
			.max(1);
		self.write_counter(id.saturating_add(1))?;
		debug!(report_id = id, "Allocated report id");
		Ok(ReportId(id))
	}

	/// Writes a complete document under `id` and publishes it atomically.
	pub fn finalize(&self, id: ReportId, report: &CrashReport) -> Result<PathBuf> {
		let bytes = encode_report(report)?;
		let temp = self.temp_path(id);
		let path = self.report_path(id);
		{
			let mut file = File::create(&temp)?;
			file.write_all(&bytes)?;
			file.sync_all()?;
		}
		std::fs::rename(&temp, &path)?;
		debug!(report_id = %id, path = %path.display(), "Finalized report");

		let _guard = self.lock()?;
		self.enforce_retention_locked()?;
		self.refresh_victims()?;
		Ok(path)
	}

	/// Deletes the oldest published reports beyond the configured maximum.
	pub fn enforce_retention(&self) -> Result<usize> {
		let _guard = self.lock()?;
		let evicted = self.enforce_retention_locked()?;
		self.refresh_victims()?;
		Ok(evicted)
	}

	fn enforce_retention_locked(&self) -> Result<usize> {
		let max = self.max_report_count();
		let ids = self.list()?;
		let mut evicted = 0;
		for id in ids.iter().skip(max) {
			self.remove(*id)?;
			info!(report_id = %id, max_report_count = max, "Evicted report beyond retention");
			evicted += 1;
		}
		Ok(evicted)
	}

	/// Publishes non-empty temp files left by a crashed run and removes
	/// empty ones. Temp files still locked by a live process are skipped.
	fn recover_orphans(&self) -> Result<()> {
		let armed = self.armed_id();
		for (id, temp) in self.scan()? {
			if !temp || Some(id) == armed {
				continue;
			}
			let temp_path = self.temp_path(id);
			let file = match File::open(&temp_path) {
				Ok(file) => file,
				Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
				Err(e) => return Err(StoreError::Io(e)),
			};
			if !try_lock(&file)? {
				debug!(report_id = %id, "Skipping report slot armed by a running process");
				continue;
			}
			let len = file.metadata().map(|m| m.len()).unwrap_or(0);
			if len == 0 {
				std::fs::remove_file(&temp_path).or_else(ignore_not_found)?;
				debug!(report_id = %id, "Removed empty report temp file");
			} else {
				std::fs::rename(&temp_path, self.report_path(id))?;
				warn!(report_id = %id, bytes = len, "Recovered report left in progress by a previous run");
			}
		}
		Ok(())
	}

	fn remove(&self, id: ReportId) -> Result<()> {
		std::fs::remove_file(self.report_path(id)).or_else(ignore_not_found)?;
		Ok(())
	}

	pub fn delete_all(&self) -> Result<usize> {
		let _guard = self.lock()?;
		let ids = self.list()?;
		for id in &ids {
			self.remove(*id)?;
		}
		self.refresh_victims()?;
		info!(count = ids.len(), "Deleted all reports");
		Ok(ids.len())
	}

	pub fn report_count(&self) -> Result<usize> {
		Ok(self.list()?.len())
	}

	fn armed_id(&self) -> Option<ReportId> {
		self.armed
			.lock()
			.ok()
			.and_then(|armed| armed.as_ref().map(|slot| slot.id))
	}

	/// Reports that must go when one more report is published.
	fn victims(&self) -> Result<Vec<CString>> {
		let keep = self.max_report_count().saturating_sub(1);
		self.list()?
			.into_iter()
			.skip(keep)
			.map(|id| c_path(&self.report_path(id)))
			.collect()
	}

	fn refresh_victims(&self) -> Result<()> {
		let armed = self.armed.lock().map_err(|_| StoreError::LockError)?;
		if let Some(slot) = armed.as_ref() {
			slot.set_victims(self.victims()?);
		}
		Ok(())
	}

	/// Allocates the next ID and pre-opens its temp file for the fatal path.
	///
	/// A previously armed slot that was never used is discarded once the new
	/// one is published.
	pub(crate) fn arm(&self) -> Result<Arc<ArmedSlot>> {
		let _guard = self.lock()?;
		self.arm_locked()
	}

	fn arm_locked(&self) -> Result<Arc<ArmedSlot>> {
		let id = self.allocate_id_locked()?;
		let temp_path = self.temp_path(id);
		let file = OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&temp_path)?;
		if !try_lock(&file)? {
			warn!(report_id = %id, "Fresh report slot is locked by another process");
		}
		let slot = Arc::new(ArmedSlot {
			id,
			uuid: uuid::Uuid::new_v4().to_string(),
			file,
			temp_c: c_path(&temp_path)?,
			final_c: c_path(&self.report_path(id))?,
			temp_path,
			victims: SignalSafeCell::new(self.victims()?),
			consumed: AtomicBool::new(false),
		});
		let previous = self
			.armed
			.lock()
			.map_err(|_| StoreError::LockError)?
			.replace(Arc::clone(&slot));
		self.armed_cell.publish(Arc::clone(&slot));
		if let Some(previous) = previous {
			discard(&previous)?;
		}
		debug!(report_id = %id, "Armed report slot");
		Ok(slot)
	}

	/// The armed slot, for crash handlers.
	///
	/// # Safety
	///
	/// The caller must hold the capture guard while using the reference.
	pub(crate) unsafe fn armed_in_handler(&self) -> Option<&Arc<ArmedSlot>> {
		// SAFETY: forwarded to the caller.
		unsafe { self.armed_cell.load() }
	}

	/// Drops the armed slot, removing its temp file if no report used it.
	pub(crate) fn disarm(&self) -> Result<()> {
		let _guard = self.lock()?;
		self.armed_cell.clear();
		let previous = self.armed.lock().map_err(|_| StoreError::LockError)?.take();
		match previous {
			Some(slot) => discard(&slot),
			None => Ok(()),
		}
	}

	/// Publishes a slot written on a normal thread, then applies retention.
	pub(crate) fn publish_armed(&self, slot: &ArmedSlot) -> Result<ReportId> {
		let _guard = self.lock()?;
		if !slot.publish_in_handler() {
			return Err(StoreError::Io(io::Error::last_os_error()));
		}
		let mut armed = self.armed.lock().map_err(|_| StoreError::LockError)?;
		if armed.as_ref().is_some_and(|a| a.id == slot.id) {
			*armed = None;
		}
		drop(armed);
		self.enforce_retention_locked()?;
		info!(report_id = %slot.id, "Published crash report");
		Ok(slot.id)
	}
}

/// Removes a slot's temp file unless a capture already claimed it.
fn discard(slot: &ArmedSlot) -> Result<()> {
	if slot.try_consume() {
		std::fs::remove_file(&slot.temp_path).or_else(ignore_not_found)?;
	}
	Ok(())
}

fn ignore_not_found(e: io::Error) -> io::Result<()> {
	if e.kind() == io::ErrorKind::NotFound {
		Ok(())
	} else {
		Err(e)
	}
}

impl ReportStore for FileReportStore {
	fn list(&self) -> Result<Vec<ReportId>> {
		let mut ids: Vec<ReportId> = self
			.scan()?
			.into_iter()
			.filter(|(_, temp)| !temp)
			.map(|(id, _)| id)
			.collect();
		ids.sort_unstable_by(|a, b| b.cmp(a));
		Ok(ids)
	}

	fn read(&self, id: ReportId) -> Result<CrashReport> {
		let bytes = self.read_raw(id)?;
		Ok(decode_report(id, &bytes))
	}

	fn read_raw(&self, id: ReportId) -> Result<Vec<u8>> {
		match std::fs::read(self.report_path(id)) {
			Ok(bytes) => Ok(bytes),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
			Err(e) => Err(StoreError::Io(e)),
		}
	}

	fn delete(&self, id: ReportId) -> Result<()> {
		let _guard = self.lock()?;
		self.remove(id)?;
		self.refresh_victims()?;
		debug!(report_id = %id, "Deleted report");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_crash_core::{CrashInfo, ErrorInfo, ErrorKind, ExceptionInfo, MonitorType, ThreadRecord};
	use std::collections::BTreeMap;
	use tempfile::TempDir;

	fn report(reason: &str, threads: u32) -> CrashReport {
		let mut report = CrashReport::empty(ReportId(0));
		report.threads = (0..threads)
			.map(|index| {
				let mut registers = BTreeMap::new();
				registers.insert("pc".to_string(), 0x1000 + index as u64);
				ThreadRecord {
					index,
					id: 10 + index as u64,
					registers,
					frames: vec![0x1000, 0x2000 + index as u64],
					..Default::default()
				}
			})
			.collect();
		report.crash = Some(CrashInfo {
			monitor: MonitorType::USER_REPORTED,
			error: ErrorInfo {
				kind: ErrorKind::User,
				exception: Some(ExceptionInfo {
					name: "test".to_string(),
					reason: Some(reason.to_string()),
					..Default::default()
				}),
				..Default::default()
			},
			thread_count: threads,
			..Default::default()
		});
		report
	}

	fn open(dir: &TempDir, max: usize) -> FileReportStore {
		FileReportStore::open(dir.path(), "app", max).unwrap()
	}

	#[test]
	fn finalize_then_read_keeps_threads() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 5);
		let id = store.allocate_id().unwrap();
		let original = report("boom", 3);
		store.finalize(id, &original).unwrap();

		let read = store.read(id).unwrap();
		assert!(read.complete);
		assert_eq!(read.threads.len(), 3);
		for (a, b) in read.threads.iter().zip(&original.threads) {
			assert_eq!(a.registers, b.registers);
			assert_eq!(a.frames, b.frames);
		}
	}

	#[test]
	fn ids_are_monotonic_and_survive_counter_loss() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 5);
		let first = store.allocate_id().unwrap();
		let second = store.allocate_id().unwrap();
		assert!(second > first);
		store.finalize(second, &report("x", 1)).unwrap();

		std::fs::remove_file(dir.path().join(COUNTER_FILE)).unwrap();
		let third = store.allocate_id().unwrap();
		assert!(third > second);
	}

	#[test]
	fn retention_keeps_the_newest() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 2);
		let mut ids = Vec::new();
		for reason in ["a", "b", "c"] {
			let id = store.allocate_id().unwrap();
			store.finalize(id, &report(reason, 1)).unwrap();
			ids.push(id);
		}
		assert_eq!(store.list().unwrap(), vec![ids[2], ids[1]]);
		assert!(matches!(store.read(ids[0]), Err(StoreError::NotFound(_))));
	}

	#[test]
	fn delete_is_idempotent() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 5);
		let id = store.allocate_id().unwrap();
		store.finalize(id, &report("x", 1)).unwrap();
		store.delete(id).unwrap();
		let once = store.list().unwrap();
		store.delete(id).unwrap();
		assert_eq!(store.list().unwrap(), once);
		assert!(once.is_empty());
	}

	#[test]
	fn orphans_are_recovered_at_open() {
		let dir = TempDir::new().unwrap();
		{
			let store = open(&dir, 5);
			let partial = store.temp_path(ReportId(7));
			std::fs::write(&partial, b"LOOMCRASH 1\nheader ##########").unwrap();
			std::fs::write(store.temp_path(ReportId(8)), b"").unwrap();
		}
		let store = open(&dir, 5);
		assert_eq!(store.list().unwrap(), vec![ReportId(7)]);
		let report = store.read(ReportId(7)).unwrap();
		assert!(!report.complete);
		assert!(!store.temp_path(ReportId(8)).exists());
	}

	#[test]
	fn retention_runs_at_open() {
		let dir = TempDir::new().unwrap();
		{
			let store = open(&dir, 10);
			for _ in 0..4 {
				let id = store.allocate_id().unwrap();
				store.finalize(id, &report("x", 1)).unwrap();
			}
		}
		let store = open(&dir, 2);
		assert_eq!(store.report_count().unwrap(), 2);
	}

	#[test]
	fn armed_slot_publishes_and_evicts_victims() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 2);
		for _ in 0..2 {
			let id = store.allocate_id().unwrap();
			store.finalize(id, &report("old", 1)).unwrap();
		}
		let oldest = *store.list().unwrap().last().unwrap();

		let slot = store.arm().unwrap();
		assert!(slot.try_consume());
		assert!(!slot.try_consume());
		crate::sys::write_fd(slot.fd(), b"LOOMCRASH 1\nEND\n");
		assert!(slot.publish_in_handler());

		let ids = store.list().unwrap();
		assert_eq!(ids.len(), 2);
		assert_eq!(ids[0], slot.id());
		assert!(!ids.contains(&oldest));
		assert!(store.read(slot.id()).unwrap().complete);
	}

	#[test]
	fn victims_follow_deletes() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 1);
		let id = store.allocate_id().unwrap();
		store.finalize(id, &report("x", 1)).unwrap();
		let slot = store.arm().unwrap();
		store.delete(id).unwrap();
		let later = store.allocate_id().unwrap();
		store.finalize(later, &report("y", 1)).unwrap();

		assert!(slot.try_consume());
		assert!(slot.publish_in_handler());
		assert_eq!(store.list().unwrap(), vec![slot.id()]);
	}

	#[test]
	fn disarm_removes_unused_temp_file() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 2);
		let slot = store.arm().unwrap();
		let temp = store.temp_path(slot.id());
		assert!(temp.exists());
		store.disarm().unwrap();
		assert!(!temp.exists());
		assert!(slot.is_consumed());
	}

	#[test]
	fn second_open_leaves_a_live_slot_alone() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 5);
		let slot = store.arm().unwrap();
		crate::sys::write_fd(slot.fd(), b"LOOMCRASH 1\n");

		let other = open(&dir, 5);
		assert!(store.temp_path(slot.id()).exists());
		assert!(other.list().unwrap().is_empty());

		assert!(slot.try_consume());
		assert!(slot.publish_in_handler());
		assert_eq!(other.list().unwrap(), vec![slot.id()]);
	}

	#[test]
	fn outside_reports_sort_before_the_armed_slot() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 5);
		let first = store.arm().unwrap();
		let id = store.allocate_id().unwrap();
		store.finalize(id, &report("handled", 1)).unwrap();

		let armed = store.armed_id().unwrap();
		assert!(armed > id);
		assert!(first.is_consumed());
		assert!(!store.temp_path(first.id()).exists());

		// SAFETY: no capture runs in this test.
		let slot = Arc::clone(unsafe { store.armed_in_handler() }.unwrap());
		assert_eq!(slot.id(), armed);
		assert!(slot.try_consume());
		assert!(slot.publish_in_handler());
		assert_eq!(store.list().unwrap()[0], armed);
	}

	#[test]
	fn delete_all_and_raw_access() {
		let dir = TempDir::new().unwrap();
		let store = open(&dir, 5);
		let id = store.allocate_id().unwrap();
		store.finalize(id, &report("x", 1)).unwrap();
		assert!(store.read_raw(id).unwrap().starts_with(b"LOOMCRASH 1\n"));
		assert_eq!(store.report_path(id).file_name().unwrap(), "app-report-0000000000000001.crash");
		assert_eq!(store.delete_all().unwrap(), 1);
		assert_eq!(store.report_count().unwrap(), 0);
	}
}
