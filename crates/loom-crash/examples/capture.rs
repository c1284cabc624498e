// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: install the crash reporter, record a few events, then deliver
//! them to an outbox directory.
//!
//! Run with:
//!   cargo run --example capture -p loom-crash
//!   cargo run --example capture -p loom-crash -- segv
//!
//! The `segv` and `abort` modes kill the process; run the example again
//! without arguments to deliver the report they left behind.

use std::sync::Arc;

use loom_crash::{
	CrashConfig, CrashReporter, DemangleFilter, DirectorySink, FingerprintFilter, MonitorType,
	UserException,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let base = std::env::temp_dir().join("loom-crash-example");
	let config = CrashConfig {
		report_dir: base.join("reports"),
		app_name: "capture-example".to_string(),
		monitors: MonitorType::PRODUCTION_SAFE_MINIMAL,
		..Default::default()
	};

	println!("Report directory: {}", config.report_dir.display());
	let reporter = Arc::new(
		CrashReporter::builder()
			.config(config)
			.app_version(env!("CARGO_PKG_VERSION"))
			.filter(DemangleFilter)
			.filter(FingerprintFilter)
			.sink(DirectorySink::new(base.join("outbox")))
			.on_crash(|id| println!("  report {id} written"))
			.build()?,
	);

	let state = reporter.app_state();
	println!(
		"Launches since last crash: {}, crashed last launch: {}",
		state.launches_since_last_crash, state.crashed_last_launch
	);

	let installed = reporter.install()?;
	println!("Installed monitors: {installed}");

	reporter.set_user_info(Some(json!({ "user_id": "user_example_123" })))?;

	match std::env::args().nth(1).as_deref() {
		Some("segv") => {
			println!("Dereferencing a null pointer...");
			// SAFETY: deliberately invalid; the crash is the point.
			unsafe { std::ptr::null_mut::<u64>().write_volatile(1) };
		}
		Some("abort") => {
			println!("Aborting...");
			std::process::abort();
		}
		_ => {}
	}

	println!("Recording a user-reported exception...");
	reporter.report_user_exception(
		&UserException::new("ExampleError")
			.reason("something went wrong")
			.language("rust"),
	)?;

	println!("Recording a caught panic...");
	let _ = std::panic::catch_unwind(|| panic!("example panic"));

	println!("Sending {} report(s)...", reporter.report_count()?);
	let summary = reporter.send_all_reports().await?;
	for outcome in &summary.outcomes {
		println!("  report {}: {} (deleted: {})", outcome.id, outcome.status, outcome.deleted);
	}

	reporter.uninstall()?;
	println!("Done!");
	Ok(())
}
