// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Operator CLI over a crash report directory.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loom_crash::{
	CrashConfig, DemangleFilter, DirectorySink, FileReportStore, FilterChain, FingerprintFilter,
	HttpSink, ReportSink, ReportStore, SendOrder, SendPipeline,
};
use loom_crash_core::{DeleteBehavior, ReportId};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "loom-crash", version, about, long_about = None)]
struct Args {
	/// Path to a crash configuration file
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Report directory (overrides config)
	#[arg(short, long)]
	dir: Option<PathBuf>,

	/// Application name the reports were written under (overrides config)
	#[arg(short, long)]
	app: Option<String>,

	/// Output logs as JSON
	#[arg(long)]
	json_logs: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// List stored reports, newest first
	List,

	/// Print one report
	Show {
		id: ReportId,

		/// Print the file bytes as written instead of the decoded document
		#[arg(long)]
		raw: bool,
	},

	/// Delete one report
	Delete { id: ReportId },

	/// Delete every stored report
	Purge {
		/// Do not ask for confirmation
		#[arg(short, long)]
		yes: bool,
	},

	/// Deliver stored reports to a collector or an outbox directory
	Send {
		/// Collector base URL (overrides config)
		#[arg(long, conflicts_with = "outbox")]
		url: Option<String>,

		/// Bearer token for the collector
		#[arg(long, env = "LOOM_CRASH_TOKEN")]
		token: Option<String>,

		/// Write filtered reports as JSON files into this directory
		#[arg(long)]
		outbox: Option<PathBuf>,

		/// When to delete a report after the attempt (overrides config)
		#[arg(long)]
		delete: Option<DeleteBehavior>,

		/// Send order (overrides config)
		#[arg(long)]
		order: Option<SendOrder>,
	},
}

fn init_tracing(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	if json {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().json().with_writer(std::io::stderr))
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().compact().with_writer(std::io::stderr))
			.init();
	}
}

fn resolve_config(args: &Args) -> Result<CrashConfig> {
	let mut config = match &args.config {
		Some(path) => CrashConfig::load_from(path)
			.with_context(|| format!("failed to load config from {}", path.display()))?,
		None => CrashConfig::load().context("failed to load crash config")?,
	};
	if let Some(dir) = &args.dir {
		config.report_dir = dir.clone();
	}
	if let Some(app) = &args.app {
		config.app_name = app.clone();
	}
	config.validate()?;
	Ok(config)
}

fn open_store(config: &CrashConfig) -> Result<Arc<FileReportStore>> {
	let store = FileReportStore::open(&config.report_dir, &config.app_name, config.max_report_count)
		.with_context(|| format!("failed to open {}", config.report_dir.display()))?;
	Ok(Arc::new(store))
}

fn list(store: &FileReportStore) -> Result<()> {
	let ids = store.list()?;
	if ids.is_empty() {
		println!("No reports in {}", store.dir().display());
		return Ok(());
	}
	for id in ids {
		match store.read(id) {
			Ok(report) => {
				let when = report
					.header
					.as_ref()
					.and_then(|h| h.timestamp())
					.map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
					.unwrap_or_else(|| "-".to_string());
				let marker = if report.complete { "" } else { " (incomplete)" };
				println!("{id:>6}  {when}  {}{marker}", report.summary());
			}
			Err(e) => println!("{id:>6}  unreadable: {e}"),
		}
	}
	Ok(())
}

fn show(store: &FileReportStore, id: ReportId, raw: bool) -> Result<()> {
	if raw {
		let bytes = store.read_raw(id)?;
		std::io::stdout().write_all(&bytes)?;
		return Ok(());
	}
	let report = store.read(id)?;
	println!("{}", serde_json::to_string_pretty(&report)?);
	Ok(())
}

fn purge(store: &FileReportStore, yes: bool) -> Result<()> {
	let count = store.report_count()?;
	if count == 0 {
		println!("Nothing to purge");
		return Ok(());
	}
	if !yes {
		print!("Delete {count} report(s) from {}? [y/N] ", store.dir().display());
		std::io::stdout().flush()?;
		let mut answer = String::new();
		std::io::stdin().read_line(&mut answer)?;
		if !matches!(answer.trim(), "y" | "Y" | "yes") {
			println!("Aborted");
			return Ok(());
		}
	}
	let deleted = store.delete_all()?;
	println!("Deleted {deleted} report(s)");
	Ok(())
}

fn build_sink(
	config: &CrashConfig,
	url: Option<String>,
	token: Option<String>,
	outbox: Option<PathBuf>,
) -> Result<Arc<dyn ReportSink>> {
	if let Some(dir) = outbox {
		return Ok(Arc::new(DirectorySink::new(dir)));
	}
	let Some(url) = url.or_else(|| config.send_url.clone()) else {
		bail!("no destination: pass --url, --outbox or set send_url in the config");
	};
	let mut sink = HttpSink::with_timeout(&url, config.send_config().report_timeout)?;
	if let Some(token) = token {
		sink = sink.auth_token(token);
	}
	Ok(Arc::new(sink))
}

async fn send(
	config: &CrashConfig,
	store: Arc<FileReportStore>,
	sink: Arc<dyn ReportSink>,
	delete: Option<DeleteBehavior>,
	order: Option<SendOrder>,
) -> Result<bool> {
	let mut send_config = config.send_config();
	if let Some(delete) = delete {
		send_config.delete_behavior = delete;
	}
	if let Some(order) = order {
		send_config.order = order;
	}

	let filters = FilterChain::new().with(DemangleFilter).with(FingerprintFilter);
	let pipeline = SendPipeline::new(store, sink, send_config).with_filters(filters);

	let cancel = CancellationToken::new();
	let on_interrupt = cancel.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("interrupted, canceling remaining sends");
			on_interrupt.cancel();
		}
	});

	let summary = pipeline.send_all_with_cancel(cancel).await?;
	for outcome in &summary.outcomes {
		match &outcome.error {
			Some(error) => println!(
				"{:>6}  {}  deleted={}  {error}",
				outcome.id, outcome.status, outcome.deleted
			),
			None => println!("{:>6}  {}  deleted={}", outcome.id, outcome.status, outcome.deleted),
		}
	}
	info!(
		sent = summary.sent(),
		failed = summary.failed(),
		total = summary.outcomes.len(),
		"send finished"
	);
	Ok(summary.is_success())
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	init_tracing(args.json_logs);

	let config = resolve_config(&args)?;
	let store = open_store(&config)?;

	match args.command {
		Command::List => list(&store)?,
		Command::Show { id, raw } => show(&store, id, raw)?,
		Command::Delete { id } => {
			store.delete(id)?;
			println!("Deleted report {id}");
		}
		Command::Purge { yes } => purge(&store, yes)?,
		Command::Send {
			url,
			token,
			outbox,
			delete,
			order,
		} => {
			let sink = build_sink(&config, url, token, outbox)?;
			if !send(&config, store, sink, delete, order).await? {
				std::process::exit(1);
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_global_options_and_show() {
		let args =
			Args::try_parse_from(["loom-crash", "--dir", "/tmp/r", "--app", "demo", "show", "7", "--raw"])
				.unwrap();
		assert_eq!(args.dir, Some(PathBuf::from("/tmp/r")));
		assert_eq!(args.app.as_deref(), Some("demo"));
		match args.command {
			Command::Show { id, raw } => {
				assert_eq!(id, ReportId(7));
				assert!(raw);
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn send_parses_policy_and_order() {
		let args = Args::try_parse_from([
			"loom-crash",
			"send",
			"--outbox",
			"/tmp/out",
			"--delete",
			"on-success",
			"--order",
			"newest_first",
		])
		.unwrap();
		match args.command {
			Command::Send {
				outbox,
				delete,
				order,
				url,
				..
			} => {
				assert_eq!(outbox, Some(PathBuf::from("/tmp/out")));
				assert_eq!(delete, Some(DeleteBehavior::OnSuccess));
				assert_eq!(order, Some(SendOrder::NewestFirst));
				assert!(url.is_none());
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn url_and_outbox_conflict() {
		let result = Args::try_parse_from([
			"loom-crash",
			"send",
			"--url",
			"http://localhost:8080",
			"--outbox",
			"/tmp/out",
		]);
		assert!(result.is_err());
	}

	#[test]
	fn rejects_non_numeric_report_id() {
		assert!(Args::try_parse_from(["loom-crash", "delete", "abc"]).is_err());
	}

	#[test]
	fn sink_requires_a_destination() {
		let config = CrashConfig::default();
		assert!(build_sink(&config, None, None, None).is_err());
		assert!(build_sink(&config, None, None, Some(PathBuf::from("/tmp/out"))).is_ok());

		let with_url = CrashConfig {
			send_url: Some("http://localhost:8080".to_string()),
			..Default::default()
		};
		assert!(build_sink(&with_url, None, Some("token".to_string()), None).is_ok());
	}

	#[test]
	fn list_and_purge_on_empty_store() {
		let dir = tempfile::TempDir::new().unwrap();
		let config = CrashConfig {
			report_dir: dir.path().to_path_buf(),
			app_name: "cli".to_string(),
			..Default::default()
		};
		let store = open_store(&config).unwrap();
		list(&store).unwrap();
		purge(&store, true).unwrap();
		assert_eq!(store.report_count().unwrap(), 0);
	}
}
