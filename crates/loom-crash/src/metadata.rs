// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Metadata prepared ahead of a crash.
//!
//! System info, binary images, user info and the zombie record are gathered
//! and serialized on normal threads. The encoded bytes are published through
//! a [`SignalSafeCell`] so the crash path only copies them.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use loom_crash_core::format::{push_record, tag};
use loom_crash_core::{BinaryImage, ZombieRecord};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cell::SignalSafeCell;
use crate::error::{CrashSdkError, Result};
use crate::images;
use crate::writer::PreparedView;

/// Key/value fields contributed by [`ContextProvider`]s.
///
/// Providers may add or update keys. There is no removal.
#[derive(Debug, Default, Clone)]
pub struct ContextFields {
	map: Map<String, Value>,
}

impl ContextFields {
	pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
		self.map.insert(key.into(), value.into());
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.map.get(key)
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}
}

/// Supplies extra fields for the system section.
///
/// Called on every metadata refresh, on a normal thread.
pub trait ContextProvider: Send + Sync {
	fn name(&self) -> &str;

	fn provide(&self, fields: &mut ContextFields);
}

/// The `system.info` section.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemInfo {
	pub os: String,
	pub cpu_arch: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system_name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system_version: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub kernel_version: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub machine: Option<String>,
	pub process_name: String,
	pub process_id: i32,
	pub parent_process_id: i32,
	pub uid: u32,
	pub executable_path: String,
	pub cpu_count: usize,
	pub page_size: u64,
	pub physical_memory: u64,
	pub build_type: &'static str,
	pub app_name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub app_version: Option<String>,
	pub session_id: String,
	pub process_start_time: DateTime<Utc>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

fn field_to_string(field: &[libc::c_char]) -> Option<String> {
	let bytes: Vec<u8> = field
		.iter()
		.take_while(|c| **c != 0)
		.map(|c| *c as u8)
		.collect();
	if bytes.is_empty() {
		None
	} else {
		Some(String::from_utf8_lossy(&bytes).into_owned())
	}
}

impl SystemInfo {
	/// Collects the process and host fields.
	pub fn collect(
		app_name: &str,
		app_version: Option<&str>,
		session_id: &str,
		start_time: DateTime<Utc>,
	) -> Self {
		// SAFETY: utsname is plain data; uname fills it.
		let uts = unsafe {
			let mut uts: libc::utsname = std::mem::zeroed();
			(libc::uname(&mut uts) == 0).then_some(uts)
		};
		// SAFETY: sysconf and the id getters have no preconditions.
		let (page_size, phys_pages, pid, ppid, uid) = unsafe {
			(
				libc::sysconf(libc::_SC_PAGESIZE),
				libc::sysconf(libc::_SC_PHYS_PAGES),
				libc::getpid(),
				libc::getppid(),
				libc::getuid(),
			)
		};
		let page_size = page_size.max(0) as u64;
		let executable_path = std::env::current_exe()
			.map(|p| p.display().to_string())
			.unwrap_or_default();
		let process_name = executable_path
			.rsplit('/')
			.next()
			.unwrap_or_default()
			.to_string();

		Self {
			os: std::env::consts::OS.to_string(),
			cpu_arch: std::env::consts::ARCH.to_string(),
			system_name: uts.as_ref().and_then(|u| field_to_string(&u.sysname)),
			system_version: uts.as_ref().and_then(|u| field_to_string(&u.release)),
			kernel_version: uts.as_ref().and_then(|u| field_to_string(&u.version)),
			machine: uts.as_ref().and_then(|u| field_to_string(&u.machine)),
			process_name,
			process_id: pid,
			parent_process_id: ppid,
			uid,
			executable_path,
			cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
			page_size,
			physical_memory: (phys_pages.max(0) as u64).saturating_mul(page_size),
			build_type: if cfg!(debug_assertions) { "debug" } else { "release" },
			app_name: app_name.to_string(),
			app_version: app_version.map(str::to_string),
			session_id: session_id.to_string(),
			process_start_time: start_time,
			extra: Map::new(),
		}
	}
}

/// Encoded sections the crash path copies verbatim.
#[derive(Default)]
pub(crate) struct PreparedSections {
	system: Option<Arc<[u8]>>,
	images: Option<Arc<[u8]>>,
	user: Option<Arc<[u8]>>,
	zombie: Option<Arc<[u8]>>,
}

impl PreparedSections {
	pub(crate) fn view(&self) -> PreparedView<'_> {
		PreparedView {
			system: self.system.as_deref(),
			images: self.images.as_deref(),
			user: self.user.as_deref(),
			zombie: self.zombie.as_deref(),
			console_log: None,
		}
	}
}

struct MetadataState {
	app_name: String,
	app_version: Option<String>,
	session_id: String,
	start_time: DateTime<Utc>,
	providers: Vec<Arc<dyn ContextProvider>>,
	fields: ContextFields,
	system_enabled: bool,
	zombie_enabled: bool,
	system: Option<Arc<[u8]>>,
	images: Vec<BinaryImage>,
	image_records: Option<Arc<[u8]>>,
	loader_generation: Option<u64>,
	user: Option<Value>,
	user_bytes: Option<Arc<[u8]>>,
	zombie: Option<ZombieRecord>,
	zombie_bytes: Option<Arc<[u8]>>,
}

pub(crate) struct MetadataHub {
	state: Mutex<MetadataState>,
	prepared: SignalSafeCell<PreparedSections>,
}

impl MetadataHub {
	pub(crate) fn new(app_name: &str, app_version: Option<&str>, session_id: &str) -> Self {
		Self {
			state: Mutex::new(MetadataState {
				app_name: app_name.to_string(),
				app_version: app_version.map(str::to_string),
				session_id: session_id.to_string(),
				start_time: Utc::now(),
				providers: Vec::new(),
				fields: ContextFields::default(),
				system_enabled: false,
				zombie_enabled: false,
				system: None,
				images: Vec::new(),
				image_records: None,
				loader_generation: None,
				user: None,
				user_bytes: None,
				zombie: None,
				zombie_bytes: None,
			}),
			prepared: SignalSafeCell::new(PreparedSections::default()),
		}
	}

	fn lock(&self) -> Result<MutexGuard<'_, MetadataState>> {
		self.state.lock().map_err(|_| CrashSdkError::LockError)
	}

	fn publish(&self, state: &MetadataState) {
		self.prepared.publish(PreparedSections {
			system: state.system.clone(),
			images: state.image_records.clone(),
			user: state.user_bytes.clone(),
			zombie: state.zombie_bytes.clone(),
		});
	}

	pub(crate) fn add_provider(&self, provider: Arc<dyn ContextProvider>) -> Result<()> {
		self.lock()?.providers.push(provider);
		Ok(())
	}

	/// Turns the system section on or off, refreshing it when on.
	pub(crate) fn set_system_enabled(&self, enabled: bool) -> Result<()> {
		self.lock()?.system_enabled = enabled;
		self.refresh_system()
	}

	/// Re-collects system info and re-runs the context providers.
	pub(crate) fn refresh_system(&self) -> Result<()> {
		let mut state = self.lock()?;
		if !state.system_enabled {
			state.system = None;
			self.publish(&state);
			return Ok(());
		}

		let mut info = SystemInfo::collect(
			&state.app_name,
			state.app_version.as_deref(),
			&state.session_id,
			state.start_time,
		);
		let providers = state.providers.clone();
		for provider in &providers {
			debug!(provider = provider.name(), "running context provider");
			provider.provide(&mut state.fields);
		}
		for (key, value) in &state.fields.map {
			info.extra.entry(key.clone()).or_insert_with(|| value.clone());
		}

		state.system = Some(Arc::from(serde_json::to_vec(&info)?));
		self.publish(&state);
		Ok(())
	}

	/// Re-enumerates binary images when the loader changed, or when forced.
	///
	/// Returns true if the image list was rebuilt.
	pub(crate) fn refresh_images(&self, force: bool) -> Result<bool> {
		let generation = images::loader_generation();
		let mut state = self.lock()?;
		if !force && state.loader_generation == Some(generation) {
			return Ok(false);
		}

		let images = images::enumerate();
		let mut records = Vec::with_capacity(images.len() * 128);
		for image in &images {
			push_record(&mut records, tag::IMAGE, &serde_json::to_vec(image)?);
		}
		debug!(count = images.len(), generation, "binary images refreshed");
		state.images = images;
		state.image_records = Some(Arc::from(records));
		state.loader_generation = Some(generation);
		self.publish(&state);
		Ok(true)
	}

	pub(crate) fn binary_images(&self) -> Result<Vec<BinaryImage>> {
		Ok(self.lock()?.images.clone())
	}

	/// Replaces the user section. Only JSON objects (or `None`) are accepted.
	pub(crate) fn set_user_info(&self, info: Option<Value>) -> Result<()> {
		let bytes = match &info {
			None => None,
			Some(Value::Object(_)) => Some(Arc::from(serde_json::to_vec(&info)?)),
			Some(other) => {
				return Err(CrashSdkError::InvalidUserInfo(format!(
					"expected a JSON object, got {}",
					json_type_name(other)
				)));
			}
		};
		let mut state = self.lock()?;
		state.user = info;
		state.user_bytes = bytes;
		self.publish(&state);
		Ok(())
	}

	pub(crate) fn user_info(&self) -> Result<Option<Value>> {
		Ok(self.lock()?.user.clone())
	}

	pub(crate) fn set_zombie_enabled(&self, enabled: bool) -> Result<()> {
		let mut state = self.lock()?;
		state.zombie_enabled = enabled;
		if !enabled {
			state.zombie = None;
			state.zombie_bytes = None;
		}
		self.publish(&state);
		Ok(())
	}

	/// Stores the last bad access. Ignored while the zombie monitor is off.
	pub(crate) fn record_zombie(&self, record: ZombieRecord) -> Result<bool> {
		let mut state = self.lock()?;
		if !state.zombie_enabled {
			return Ok(false);
		}
		state.zombie_bytes = Some(Arc::from(serde_json::to_vec(&record)?));
		state.zombie = Some(record);
		self.publish(&state);
		Ok(true)
	}

	pub(crate) fn last_zombie(&self) -> Result<Option<ZombieRecord>> {
		Ok(self.lock()?.zombie.clone())
	}

	/// Prepared sections for the crash path.
	///
	/// # Safety
	///
	/// The caller must hold the capture guard while using the result.
	pub(crate) unsafe fn prepared(&self) -> Option<&PreparedSections> {
		// SAFETY: forwarded to the caller.
		unsafe { self.prepared.load() }
	}
}

fn json_type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use serial_test::serial;

	struct StaticProvider(&'static str, Value);

	impl ContextProvider for StaticProvider {
		fn name(&self) -> &str {
			"static"
		}

		fn provide(&self, fields: &mut ContextFields) {
			fields.set(self.0, self.1.clone());
		}
	}

	fn prepared_system(hub: &MetadataHub) -> Option<Value> {
		// SAFETY: no capture runs in these tests.
		let prepared = unsafe { hub.prepared() }?;
		prepared.system.as_ref().map(|b| serde_json::from_slice(b).unwrap())
	}

	#[test]
	#[serial(capture_guard)]
	fn system_section_includes_provider_fields() {
		let hub = MetadataHub::new("demo", Some("1.2.3"), "session-1");
		hub.add_provider(Arc::new(StaticProvider("region", json!("eu-west"))))
			.unwrap();
		hub.set_system_enabled(true).unwrap();

		let system = prepared_system(&hub).unwrap();
		assert_eq!(system["app_name"], "demo");
		assert_eq!(system["app_version"], "1.2.3");
		assert_eq!(system["region"], "eu-west");
		assert!(system["cpu_count"].as_u64().unwrap() >= 1);
	}

	#[test]
	#[serial(capture_guard)]
	fn provider_cannot_override_collected_fields() {
		let hub = MetadataHub::new("demo", None, "s");
		hub.add_provider(Arc::new(StaticProvider("app_name", json!("spoofed"))))
			.unwrap();
		hub.set_system_enabled(true).unwrap();
		assert_eq!(prepared_system(&hub).unwrap()["app_name"], "demo");
	}

	#[test]
	#[serial(capture_guard)]
	fn disabled_system_section_is_absent() {
		let hub = MetadataHub::new("demo", None, "s");
		hub.set_system_enabled(true).unwrap();
		hub.set_system_enabled(false).unwrap();
		assert!(prepared_system(&hub).is_none());
	}

	#[test]
	#[serial(capture_guard)]
	fn user_info_must_be_an_object() {
		let hub = MetadataHub::new("demo", None, "s");
		assert!(matches!(
			hub.set_user_info(Some(json!([1, 2]))),
			Err(CrashSdkError::InvalidUserInfo(_))
		));
		hub.set_user_info(Some(json!({"user_id": "u1"}))).unwrap();
		assert_eq!(hub.user_info().unwrap(), Some(json!({"user_id": "u1"})));
		hub.set_user_info(None).unwrap();
		assert_eq!(hub.user_info().unwrap(), None);
	}

	#[test]
	#[serial(capture_guard)]
	fn zombie_records_need_the_monitor() {
		let hub = MetadataHub::new("demo", None, "s");
		let record = ZombieRecord {
			address: 0x1000,
			class_name: Some("Widget".to_string()),
			reason: None,
		};
		assert!(!hub.record_zombie(record.clone()).unwrap());
		hub.set_zombie_enabled(true).unwrap();
		assert!(hub.record_zombie(record.clone()).unwrap());
		assert_eq!(hub.last_zombie().unwrap(), Some(record));
		hub.set_zombie_enabled(false).unwrap();
		assert_eq!(hub.last_zombie().unwrap(), None);
	}

	#[cfg(target_os = "linux")]
	#[test]
	#[serial(capture_guard)]
	fn image_refresh_is_skipped_when_loader_is_unchanged() {
		let hub = MetadataHub::new("demo", None, "s");
		assert!(hub.refresh_images(false).unwrap());
		assert!(!hub.refresh_images(false).unwrap());
		assert!(hub.refresh_images(true).unwrap());
		assert!(!hub.binary_images().unwrap().is_empty());
	}
}
