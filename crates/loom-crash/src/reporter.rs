// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The crash reporter: one object that owns the store, the monitors and the
//! send pipeline.
//!
//! ```no_run
//! use loom_crash::{CrashReporter, DirectorySink, MonitorType, UserException};
//!
//! # async fn example() -> loom_crash::Result<()> {
//! let reporter = CrashReporter::builder()
//!     .app_name("my-app")
//!     .app_version("1.2.3")
//!     .report_dir("/var/lib/my-app/crashes")
//!     .sink(DirectorySink::new("/var/lib/my-app/outbox"))
//!     .build()?;
//! let installed = reporter.install()?;
//! assert!(installed.contains(MonitorType::USER_REPORTED));
//!
//! reporter.report_user_exception(&UserException::new("ConfigError").reason("missing key"))?;
//! let summary = reporter.send_all_reports().await?;
//! println!("{} sent", summary.sent());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use loom_crash_core::{BinaryImage, CrashReport, MonitorState, MonitorType, ReportId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app_state::{AppStateSnapshot, AppStateTracker};
use crate::config::CrashConfig;
use crate::console_log::ConsoleLog;
use crate::controller::MonitorController;
use crate::error::{CrashSdkError, Result};
use crate::filter::{FilterChain, ReportFilter};
use crate::metadata::{ContextProvider, MetadataHub};
use crate::monitors::deadlock::DeadlockMonitor;
use crate::monitors::foreign::ForeignExceptionMonitor;
use crate::monitors::kernel::KernelExceptionMonitor;
use crate::monitors::panic::PanicMonitor;
use crate::monitors::signal::SignalMonitor;
use crate::monitors::system::{ApplicationStateMonitor, SystemMonitor, ZombieMonitor};
use crate::monitors::user::{self, UserReportedMonitor};
use crate::monitors::{MainThreadExecutor, Monitor, UserException, ZombieRecorder, STATES};
use crate::pipeline::{SendPipeline, SendSummary};
use crate::runtime::{CrashCallback, CrashRuntime, RuntimeOptions};
use crate::sink::ReportSink;
use crate::store::{FileReportStore, ReportStore};

/// Builder for constructing a [`CrashReporter`].
#[derive(Default)]
pub struct CrashReporterBuilder {
	config: Option<CrashConfig>,
	report_dir: Option<PathBuf>,
	app_name: Option<String>,
	app_version: Option<String>,
	console_log: Option<bool>,
	print_previous_log: Option<bool>,
	sink: Option<Arc<dyn ReportSink>>,
	filters: FilterChain,
	providers: Vec<Arc<dyn ContextProvider>>,
	executor: Option<Arc<dyn MainThreadExecutor>>,
	on_crash: Option<CrashCallback>,
}

impl CrashReporterBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Base configuration. Explicit builder settings take precedence.
	pub fn config(mut self, config: CrashConfig) -> Self {
		self.config = Some(config);
		self
	}

	pub fn report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.report_dir = Some(dir.into());
		self
	}

	pub fn app_name(mut self, name: impl Into<String>) -> Self {
		self.app_name = Some(name.into());
		self
	}

	pub fn app_version(mut self, version: impl Into<String>) -> Self {
		self.app_version = Some(version.into());
		self
	}

	/// Keeps a console log whose tail is copied into every report.
	/// See [`CrashReporter::console_log`].
	pub fn console_log(mut self, enabled: bool) -> Self {
		self.console_log = Some(enabled);
		self
	}

	/// Prints the previous run's console log to stderr at build time.
	pub fn print_previous_log(mut self, enabled: bool) -> Self {
		self.print_previous_log = Some(enabled);
		self
	}

	pub fn sink(mut self, sink: impl ReportSink + 'static) -> Self {
		self.sink = Some(Arc::new(sink));
		self
	}

	pub fn shared_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
		self.sink = Some(sink);
		self
	}

	/// Appends a filter to the send chain.
	pub fn filter(mut self, filter: impl ReportFilter + 'static) -> Self {
		self.filters.push(Arc::new(filter));
		self
	}

	pub fn context_provider(mut self, provider: impl ContextProvider + 'static) -> Self {
		self.providers.push(Arc::new(provider));
		self
	}

	/// Required for the main-thread deadlock monitor.
	pub fn main_thread_executor(mut self, executor: Arc<dyn MainThreadExecutor>) -> Self {
		self.executor = Some(executor);
		self
	}

	/// Runs on the triggering thread after a non-fatal report is published.
	pub fn on_crash(mut self, callback: impl Fn(ReportId) + Send + Sync + 'static) -> Self {
		self.on_crash = Some(Arc::new(callback));
		self
	}

	/// Opens the store and prepares metadata. Nothing is installed yet.
	pub fn build(self) -> Result<CrashReporter> {
		let mut config = self.config.unwrap_or_default();
		if let Some(dir) = self.report_dir {
			config.report_dir = dir;
		}
		if let Some(name) = self.app_name {
			config.app_name = name;
		}
		if let Some(enabled) = self.console_log {
			config.console_log = enabled;
		}
		if let Some(enabled) = self.print_previous_log {
			config.print_previous_log = enabled;
		}
		config.validate()?;

		let store = Arc::new(FileReportStore::open(
			&config.report_dir,
			&config.app_name,
			config.max_report_count,
		)?);
		let session_id = uuid::Uuid::new_v4().to_string();
		let metadata = Arc::new(MetadataHub::new(
			&config.app_name,
			self.app_version.as_deref(),
			&session_id,
		));
		for provider in self.providers {
			metadata.add_provider(provider)?;
		}
		let state_path = config
			.report_dir
			.join(format!("{}-state.json", config.app_name));
		let app_state = Arc::new(AppStateTracker::open(state_path)?);

		let log_path = config.console_log_path();
		if config.print_previous_log {
			if let Err(e) = ConsoleLog::print_previous(&log_path, &mut std::io::stderr().lock()) {
				warn!(error = %e, path = %log_path.display(), "Failed to print previous console log");
			}
		}
		let console_log = if config.console_log {
			Some(ConsoleLog::create(&log_path)?)
		} else {
			None
		};

		let options = RuntimeOptions {
			app_name: config.app_name.clone(),
			session_id: session_id.clone(),
			limits: config.capture_limits(),
			snapshot_all_threads: config.snapshot_all_threads,
			console_log: console_log.clone(),
		};
		let runtime = Arc::new(CrashRuntime::new(
			options,
			Arc::clone(&store),
			Arc::clone(&metadata),
			Arc::clone(&app_state),
			self.on_crash,
		));

		info!(
			app_name = %config.app_name,
			session_id = %session_id,
			report_dir = %config.report_dir.display(),
			"Crash reporter created"
		);
		Ok(CrashReporter {
			config,
			runtime,
			store,
			metadata,
			app_state,
			console_log,
			sink: self.sink,
			filters: self.filters,
			executor: self.executor,
			controller: Mutex::new(None),
			registered: AtomicBool::new(false),
		})
	}
}

/// Process crash reporter.
///
/// At most one reporter may be installed per process. Dropping an installed
/// reporter uninstalls it.
pub struct CrashReporter {
	config: CrashConfig,
	runtime: Arc<CrashRuntime>,
	store: Arc<FileReportStore>,
	metadata: Arc<MetadataHub>,
	app_state: Arc<AppStateTracker>,
	console_log: Option<ConsoleLog>,
	sink: Option<Arc<dyn ReportSink>>,
	filters: FilterChain,
	executor: Option<Arc<dyn MainThreadExecutor>>,
	controller: Mutex<Option<MonitorController>>,
	registered: AtomicBool,
}

impl CrashReporter {
	pub fn builder() -> CrashReporterBuilder {
		CrashReporterBuilder::new()
	}

	pub fn config(&self) -> &CrashConfig {
		&self.config
	}

	fn controller(&self) -> Result<MutexGuard<'_, Option<MonitorController>>> {
		self.controller.lock().map_err(|_| CrashSdkError::LockError)
	}

	fn build_monitors(&self) -> Vec<Box<dyn Monitor>> {
		vec![
			Box::new(SystemMonitor::new(Arc::clone(&self.metadata))),
			Box::new(ApplicationStateMonitor::new(Arc::clone(&self.runtime))),
			Box::new(ZombieMonitor::new(Arc::clone(&self.metadata))),
			Box::new(KernelExceptionMonitor::default()),
			Box::new(SignalMonitor::default()),
			Box::new(PanicMonitor::default()),
			Box::new(ForeignExceptionMonitor::default()),
			Box::new(UserReportedMonitor::default()),
			Box::new(DeadlockMonitor::new(
				self.executor.clone(),
				Duration::from_millis(self.config.deadlock_interval_ms),
				self.config.terminate_on_deadlock,
			)),
		]
	}

	/// Installs the configured monitors. Returns the set that installed.
	pub fn install(&self) -> Result<MonitorType> {
		self.set_monitors(self.config.monitors)
	}

	/// Replaces the active monitor set, installing the reporter first if
	/// needed. Returns the set that installed.
	pub fn set_monitors(&self, monitors: MonitorType) -> Result<MonitorType> {
		let mut controller = self.controller()?;
		if !self.registered.load(Ordering::Acquire) {
			CrashRuntime::register(Arc::clone(&self.runtime))?;
			self.registered.store(true, Ordering::Release);
		}
		let controller =
			controller.get_or_insert_with(|| MonitorController::new(self.build_monitors(), &STATES));
		let installed = controller.set_active(monitors);
		if installed != monitors {
			warn!(
				requested = %monitors,
				installed = %installed,
				"Some monitors were not installed"
			);
		}
		Ok(installed)
	}

	pub fn active_monitors(&self) -> MonitorType {
		self.controller()
			.ok()
			.and_then(|c| c.as_ref().map(MonitorController::active))
			.unwrap_or(MonitorType::NONE)
	}

	pub fn monitor_state(&self, kind: MonitorType) -> MonitorState {
		STATES.get(kind)
	}

	pub fn is_installed(&self) -> bool {
		self.registered.load(Ordering::Acquire)
	}

	/// Removes every monitor and releases the process-wide handlers.
	pub fn uninstall(&self) -> Result<()> {
		let mut controller = self.controller()?;
		if let Some(mut active) = controller.take() {
			active.uninstall_all();
		}
		if self.registered.swap(false, Ordering::AcqRel) {
			CrashRuntime::unregister()?;
			info!(app_name = %self.config.app_name, "Crash reporter uninstalled");
		}
		Ok(())
	}

	/// Replaces the user section of future reports. Must be a JSON object.
	pub fn set_user_info(&self, info: Option<Value>) -> Result<()> {
		self.metadata.set_user_info(info)
	}

	pub fn user_info(&self) -> Result<Option<Value>> {
		self.metadata.user_info()
	}

	/// Writes a report for an application-level error.
	pub fn report_user_exception(&self, exception: &UserException) -> Result<ReportId> {
		if !self.is_installed() {
			return Err(CrashSdkError::NotInstalled);
		}
		user::report(&self.runtime, exception)
	}

	/// Published report IDs, newest first.
	pub fn report_ids(&self) -> Result<Vec<ReportId>> {
		Ok(self.store.list()?)
	}

	pub fn report(&self, id: ReportId) -> Result<CrashReport> {
		Ok(self.store.read(id)?)
	}

	pub fn report_raw(&self, id: ReportId) -> Result<Vec<u8>> {
		Ok(self.store.read_raw(id)?)
	}

	pub fn delete_report(&self, id: ReportId) -> Result<()> {
		Ok(self.store.delete(id)?)
	}

	pub fn delete_all_reports(&self) -> Result<usize> {
		Ok(self.store.delete_all()?)
	}

	pub fn report_count(&self) -> Result<usize> {
		Ok(self.store.report_count()?)
	}

	fn pipeline(&self) -> Result<SendPipeline> {
		let sink = self.sink.clone().ok_or(CrashSdkError::NoSink)?;
		let store: Arc<dyn ReportStore> = self.store.clone();
		Ok(SendPipeline::new(store, sink, self.config.send_config()).with_filters(self.filters.clone()))
	}

	/// Sends every stored report through the filters to the sink.
	pub async fn send_all_reports(&self) -> Result<SendSummary> {
		self.pipeline()?.send_all().await
	}

	pub async fn send_all_reports_with_cancel(&self, cancel: CancellationToken) -> Result<SendSummary> {
		self.pipeline()?.send_all_with_cancel(cancel).await
	}

	pub fn app_state(&self) -> AppStateSnapshot {
		self.app_state.snapshot()
	}

	pub fn notify_app_active(&self, active: bool) -> Result<()> {
		self.app_state.notify_active(active)
	}

	pub fn notify_app_foreground(&self, foreground: bool) -> Result<()> {
		self.app_state.notify_foreground(foreground)
	}

	pub fn notify_app_terminate(&self) -> Result<()> {
		self.app_state.notify_terminate()
	}

	pub fn zombie_recorder(&self) -> ZombieRecorder {
		ZombieRecorder::new(Arc::clone(&self.metadata))
	}

	/// Re-runs context providers and picks up newly loaded libraries.
	pub fn refresh_metadata(&self) -> Result<()> {
		self.metadata.refresh_system()?;
		self.metadata.refresh_images(false)?;
		Ok(())
	}

	/// Loaded images as of the last refresh.
	pub fn binary_images(&self) -> Result<Vec<BinaryImage>> {
		self.metadata.binary_images()
	}

	pub fn store(&self) -> &Arc<FileReportStore> {
		&self.store
	}

	/// The console log, when enabled. Hand a clone to a
	/// `tracing_subscriber::fmt` layer as its writer.
	pub fn console_log(&self) -> Option<&ConsoleLog> {
		self.console_log.as_ref()
	}
}

impl Drop for CrashReporter {
	fn drop(&mut self) {
		if let Err(e) = self.uninstall() {
			warn!(error = %e, "Failed to uninstall crash reporter");
		}
	}
}
