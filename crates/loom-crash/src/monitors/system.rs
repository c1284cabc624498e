// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Metadata monitors: system info, application state and zombie records.
//!
//! None of these detect anything. Installing one turns on a section that the
//! other monitors' reports carry.

use std::sync::Arc;

use loom_crash_core::{CrashError, MonitorType, ZombieRecord};
use tracing::{debug, warn};

use super::Monitor;
use crate::metadata::MetadataHub;
use crate::runtime::CrashRuntime;

pub(crate) struct SystemMonitor {
	metadata: Arc<MetadataHub>,
	enabled: bool,
}

impl SystemMonitor {
	pub(crate) fn new(metadata: Arc<MetadataHub>) -> Self {
		Self {
			metadata,
			enabled: false,
		}
	}
}

impl Monitor for SystemMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::SYSTEM
	}

	fn install(&mut self) -> Result<(), CrashError> {
		self.metadata
			.set_system_enabled(true)
			.map_err(|e| CrashError::install("system", e.to_string()))?;
		let rebuilt = self
			.metadata
			.refresh_images(true)
			.map_err(|e| CrashError::install("system", e.to_string()))?;
		debug!(images_rebuilt = rebuilt, "System metadata collected");
		self.enabled = true;
		Ok(())
	}

	fn uninstall(&mut self) {
		if let Err(e) = self.metadata.set_system_enabled(false) {
			warn!(error = %e, "Failed to clear system metadata");
		}
		self.enabled = false;
	}

	fn is_enabled(&self) -> bool {
		self.enabled
	}
}

pub(crate) struct ApplicationStateMonitor {
	runtime: Arc<CrashRuntime>,
	enabled: bool,
}

impl ApplicationStateMonitor {
	pub(crate) fn new(runtime: Arc<CrashRuntime>) -> Self {
		Self {
			runtime,
			enabled: false,
		}
	}
}

impl Monitor for ApplicationStateMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::APPLICATION_STATE
	}

	fn install(&mut self) -> Result<(), CrashError> {
		self.runtime.set_app_state_enabled(true);
		self.enabled = true;
		Ok(())
	}

	fn uninstall(&mut self) {
		self.runtime.set_app_state_enabled(false);
		self.enabled = false;
	}

	fn is_enabled(&self) -> bool {
		self.enabled
	}
}

pub(crate) struct ZombieMonitor {
	metadata: Arc<MetadataHub>,
	enabled: bool,
}

impl ZombieMonitor {
	pub(crate) fn new(metadata: Arc<MetadataHub>) -> Self {
		Self {
			metadata,
			enabled: false,
		}
	}
}

impl Monitor for ZombieMonitor {
	fn monitor_type(&self) -> MonitorType {
		MonitorType::ZOMBIE
	}

	fn install(&mut self) -> Result<(), CrashError> {
		self.metadata
			.set_zombie_enabled(true)
			.map_err(|e| CrashError::install("zombie", e.to_string()))?;
		self.enabled = true;
		Ok(())
	}

	fn uninstall(&mut self) {
		if let Err(e) = self.metadata.set_zombie_enabled(false) {
			warn!(error = %e, "Failed to disable zombie tracking");
		}
		self.enabled = false;
	}

	fn is_enabled(&self) -> bool {
		self.enabled
	}
}

/// Handle for an object-lifecycle tracker to report the last bad access.
///
/// The most recent record is embedded in the next crash report.
#[derive(Clone)]
pub struct ZombieRecorder {
	metadata: Arc<MetadataHub>,
}

impl ZombieRecorder {
	pub(crate) fn new(metadata: Arc<MetadataHub>) -> Self {
		Self { metadata }
	}

	/// Returns false while the zombie monitor is not installed.
	pub fn record(
		&self,
		address: u64,
		class_name: Option<&str>,
		reason: Option<&str>,
	) -> bool {
		let record = ZombieRecord {
			address,
			class_name: class_name.map(str::to_string),
			reason: reason.map(str::to_string),
		};
		match self.metadata.record_zombie(record) {
			Ok(recorded) => recorded,
			Err(e) => {
				warn!(error = %e, address, "Failed to record zombie access");
				false
			}
		}
	}

	pub fn last(&self) -> Option<ZombieRecord> {
		self.metadata.last_zombie().ok().flatten()
	}
}
