// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process crash capture for Rust applications.
//!
//! This crate records fatal signals, hardware faults, panics, foreign runtime
//! exceptions, main-thread deadlocks and user-reported errors into crash
//! reports on disk, then delivers them through a filter chain to a sink.
//!
//! # Quick Start
//!
//! ```ignore
//! use loom_crash::{CrashConfig, CrashReporter, FingerprintFilter, HttpSink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CrashConfig::load()?;
//!     let reporter = CrashReporter::builder()
//!         .config(config)
//!         .app_version(env!("CARGO_PKG_VERSION"))
//!         .filter(FingerprintFilter)
//!         .sink(HttpSink::new("https://loom.ghuntley.com")?.auth_token("token"))
//!         .build()?;
//!
//!     // Reports from the previous run.
//!     reporter.send_all_reports().await?;
//!
//!     let installed = reporter.install()?;
//!     tracing::info!(monitors = %installed, "crash reporting active");
//!
//!     // Your application code here...
//!
//!     reporter.uninstall()?;
//!     Ok(())
//! }
//! ```
//!
//! # Capture path
//!
//! Fatal monitors write from inside a signal handler. Everything they need
//! (the report file, metadata sections, eviction victims) is prepared ahead
//! of time on normal threads, and the writer itself never allocates or locks.
//! A report interrupted mid-write is still readable up to its last intact
//! record and is marked incomplete.

mod app_state;
mod backtrace;
mod cell;
mod config;
mod console_log;
mod context;
mod controller;
mod error;
mod filter;
mod guard;
mod images;
mod metadata;
mod monitors;
mod pipeline;
mod reporter;
mod runtime;
mod sink;
mod snapshot;
mod store;
mod sys;
mod unwind;
mod writer;

pub use app_state::AppStateSnapshot;
pub use config::{
	default_config_path, default_report_dir, ConfigSource, CrashConfig, CrashConfigLayer,
	DefaultsSource, EnvSource, Precedence, TomlSource,
};
pub use console_log::ConsoleLog;
pub use error::{ConfigError, CrashSdkError, FilterError, Result, SinkError, StoreError};
pub use filter::{AnnotateFilter, DemangleFilter, FilterChain, FingerprintFilter, ReportFilter};
pub use metadata::{ContextFields, ContextProvider, SystemInfo};
pub use monitors::foreign::ForeignExceptionHandler;
pub use monitors::{
	report_foreign_exception, set_foreign_exception_handler, ForeignException,
	MainThreadExecutor, MainThreadQueue, UserException, ZombieRecorder,
};
pub use pipeline::{ReportOutcome, SendConfig, SendOrder, SendPipeline, SendStatus, SendSummary};
pub use reporter::{CrashReporter, CrashReporterBuilder};
pub use sink::{DirectorySink, HttpSink, ReportSink};
pub use store::{FileReportStore, ReportStore};

// Re-export core types for convenience
pub use loom_crash_core::{
	BinaryImage, CrashReport, DeleteBehavior, ErrorKind, ExceptionInfo, Frame, MonitorState,
	MonitorType, ReportId, ThreadRecord,
};
