// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery targets for filtered reports.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use loom_crash_core::CrashReport;
use reqwest::Client;
use tracing::{debug, info};

use crate::error::SinkError;

/// SDK version sent with every report.
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Accepts one report at a time.
///
/// Implementations must tolerate concurrent calls when the pipeline runs
/// with a concurrency above one.
#[async_trait]
pub trait ReportSink: Send + Sync {
	fn name(&self) -> &str;

	async fn send(&self, report: &CrashReport) -> Result<(), SinkError>;
}

/// Posts reports as JSON to a crash collector.
pub struct HttpSink {
	client: Client,
	base_url: String,
	auth_token: Option<String>,
}

impl HttpSink {
	pub fn new(base_url: impl Into<String>) -> Result<Self, SinkError> {
		Self::with_timeout(base_url, Duration::from_secs(30))
	}

	pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
		let client = Client::builder()
			.timeout(timeout)
			.user_agent(format!("loom-crash/{SDK_VERSION}"))
			.build()?;
		Ok(Self {
			client,
			base_url: base_url.into().trim_end_matches('/').to_string(),
			auth_token: None,
		})
	}

	/// Sets the bearer token.
	pub fn auth_token(mut self, token: impl Into<String>) -> Self {
		self.auth_token = Some(token.into());
		self
	}

	fn endpoint(&self) -> String {
		format!("{}/api/crash/reports", self.base_url)
	}
}

#[async_trait]
impl ReportSink for HttpSink {
	fn name(&self) -> &str {
		"http"
	}

	async fn send(&self, report: &CrashReport) -> Result<(), SinkError> {
		let url = self.endpoint();
		debug!(url = %url, report_id = %report.id, "Sending crash report");

		let mut request = self.client.post(&url).json(report);
		if let Some(token) = &self.auth_token {
			request = request.header("Authorization", format!("Bearer {token}"));
		}
		let response = request.send().await?;

		if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
			let retry_after = response
				.headers()
				.get("Retry-After")
				.and_then(|v| v.to_str().ok())
				.and_then(|s| s.parse().ok());
			return Err(SinkError::RateLimited {
				retry_after_secs: retry_after,
			});
		}

		if !response.status().is_success() {
			let status = response.status().as_u16();
			let message = response.text().await.unwrap_or_default();
			return Err(SinkError::Rejected { status, message });
		}

		info!(report_id = %report.id, "Crash report delivered");
		Ok(())
	}
}

/// Writes each report as `<id>.json` into an outbox directory.
pub struct DirectorySink {
	dir: PathBuf,
}

impl DirectorySink {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}
}

#[async_trait]
impl ReportSink for DirectorySink {
	fn name(&self) -> &str {
		"directory"
	}

	async fn send(&self, report: &CrashReport) -> Result<(), SinkError> {
		tokio::fs::create_dir_all(&self.dir).await?;
		let json = serde_json::to_vec_pretty(report)?;

		let final_path = self.dir.join(format!("{}.json", report.id));
		let temp_path = self.dir.join(format!("{}.json.tmp", report.id));
		tokio::fs::write(&temp_path, &json).await?;
		tokio::fs::rename(&temp_path, &final_path).await?;

		debug!(report_id = %report.id, path = %final_path.display(), "Report written to outbox");
		Ok(())
	}
}
