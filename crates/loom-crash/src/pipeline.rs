// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Send pipeline: store → filters → sink → delete policy.
//!
//! Every pending report resolves to exactly one [`ReportOutcome`]. A failure
//! in one report never stops the batch. Canceled and timed-out reports are
//! left in the store untouched.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use loom_crash_core::{CrashReport, DeleteBehavior, ReportId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CrashSdkError, Result};
use crate::filter::{FilterChain, ReportFilter};
use crate::sink::ReportSink;
use crate::store::ReportStore;

/// The order pending reports are sent in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOrder {
	#[default]
	OldestFirst,
	NewestFirst,
}

impl fmt::Display for SendOrder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::OldestFirst => f.write_str("oldest_first"),
			Self::NewestFirst => f.write_str("newest_first"),
		}
	}
}

impl FromStr for SendOrder {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
			"oldest_first" | "oldest" => Ok(Self::OldestFirst),
			"newest_first" | "newest" => Ok(Self::NewestFirst),
			other => Err(format!("unknown send order: {other}")),
		}
	}
}

#[derive(Debug, Clone)]
pub struct SendConfig {
	pub delete_behavior: DeleteBehavior,
	pub order: SendOrder,
	/// Time limit for one report: read, filters and sink together.
	pub report_timeout: Duration,
	/// Reports in flight at once. 1 sends sequentially.
	pub concurrency: usize,
}

impl Default for SendConfig {
	fn default() -> Self {
		Self {
			delete_behavior: DeleteBehavior::Always,
			order: SendOrder::OldestFirst,
			report_timeout: Duration::from_secs(30),
			concurrency: 1,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
	Sent,
	FilterFailed,
	SinkFailed,
	ReadFailed,
	Canceled,
	TimedOut,
}

impl SendStatus {
	pub fn is_success(self) -> bool {
		self == Self::Sent
	}

	fn should_delete(self, behavior: DeleteBehavior) -> bool {
		match self {
			Self::Canceled | Self::TimedOut => false,
			Self::Sent => behavior.should_delete(true),
			Self::FilterFailed | Self::SinkFailed | Self::ReadFailed => behavior.should_delete(false),
		}
	}
}

impl fmt::Display for SendStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Sent => "sent",
			Self::FilterFailed => "filter_failed",
			Self::SinkFailed => "sink_failed",
			Self::ReadFailed => "read_failed",
			Self::Canceled => "canceled",
			Self::TimedOut => "timed_out",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOutcome {
	pub id: ReportId,
	pub status: SendStatus,
	pub deleted: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// Result of one batch, in send order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSummary {
	pub outcomes: Vec<ReportOutcome>,
}

impl SendSummary {
	/// True when every report was sent. An empty batch is a success.
	pub fn is_success(&self) -> bool {
		self.outcomes.iter().all(|o| o.status.is_success())
	}

	pub fn sent(&self) -> usize {
		self.count(SendStatus::Sent)
	}

	pub fn failed(&self) -> usize {
		self.outcomes.len() - self.sent()
	}

	pub fn count(&self, status: SendStatus) -> usize {
		self.outcomes.iter().filter(|o| o.status == status).count()
	}
}

pub struct SendPipeline {
	store: Arc<dyn ReportStore>,
	filters: FilterChain,
	sink: Arc<dyn ReportSink>,
	config: SendConfig,
}

impl SendPipeline {
	pub fn new(store: Arc<dyn ReportStore>, sink: Arc<dyn ReportSink>, config: SendConfig) -> Self {
		Self {
			store,
			filters: FilterChain::new(),
			sink,
			config,
		}
	}

	pub fn with_filters(mut self, filters: FilterChain) -> Self {
		self.filters = filters;
		self
	}

	pub fn config(&self) -> &SendConfig {
		&self.config
	}

	pub async fn send_all(&self) -> Result<SendSummary> {
		self.send_all_with_cancel(CancellationToken::new()).await
	}

	/// Sends every pending report. Reports not finished when `cancel` fires
	/// resolve as [`SendStatus::Canceled`].
	pub async fn send_all_with_cancel(&self, cancel: CancellationToken) -> Result<SendSummary> {
		let mut ids = self.blocking_store(|store| store.list()).await??;
		if self.config.order == SendOrder::OldestFirst {
			ids.reverse();
		}
		if ids.is_empty() {
			debug!("No pending crash reports");
			return Ok(SendSummary::default());
		}

		info!(
			count = ids.len(),
			sink = self.sink.name(),
			order = %self.config.order,
			"Sending crash reports"
		);
		let concurrency = self.config.concurrency.max(1);
		let outcomes: Vec<ReportOutcome> = stream::iter(ids)
			.map(|id| self.process(id, &cancel))
			.buffered(concurrency)
			.collect()
			.await;

		let summary = SendSummary { outcomes };
		info!(
			sent = summary.sent(),
			failed = summary.failed(),
			success = summary.is_success(),
			"Crash report batch finished"
		);
		Ok(summary)
	}

	async fn blocking_store<T, F>(&self, f: F) -> Result<T>
	where
		F: FnOnce(&dyn ReportStore) -> T + Send + 'static,
		T: Send + 'static,
	{
		let store = Arc::clone(&self.store);
		tokio::task::spawn_blocking(move || f(store.as_ref()))
			.await
			.map_err(|e| CrashSdkError::Io(std::io::Error::other(e)))
	}

	async fn process(&self, id: ReportId, cancel: &CancellationToken) -> ReportOutcome {
		let (status, error) = if cancel.is_cancelled() {
			(SendStatus::Canceled, None)
		} else {
			tokio::select! {
				_ = cancel.cancelled() => (SendStatus::Canceled, None),
				delivered = tokio::time::timeout(self.config.report_timeout, self.deliver(id)) => {
					match delivered {
						Ok(outcome) => outcome,
						Err(_) => (SendStatus::TimedOut, None),
					}
				}
			}
		};

		let mut deleted = false;
		if status.should_delete(self.config.delete_behavior) {
			match self.blocking_store(move |store| store.delete(id)).await {
				Ok(Ok(())) => deleted = true,
				Ok(Err(e)) => warn!(report_id = %id, error = %e, "Failed to delete report"),
				Err(e) => warn!(report_id = %id, error = %e, "Failed to delete report"),
			}
		}

		match &error {
			Some(message) => {
				warn!(report_id = %id, status = %status, deleted, error = %message, "Crash report not sent")
			}
			None => debug!(report_id = %id, status = %status, deleted, "Crash report resolved"),
		}
		ReportOutcome {
			id,
			status,
			deleted,
			error,
		}
	}

	async fn deliver(&self, id: ReportId) -> (SendStatus, Option<String>) {
		let report: CrashReport = match self.blocking_store(move |store| store.read(id)).await {
			Ok(Ok(report)) => report,
			Ok(Err(e)) => return (SendStatus::ReadFailed, Some(e.to_string())),
			Err(e) => return (SendStatus::ReadFailed, Some(e.to_string())),
		};
		let report = match self.filters.filter(report).await {
			Ok(report) => report,
			Err(e) => return (SendStatus::FilterFailed, Some(e.to_string())),
		};
		match self.sink.send(&report).await {
			Ok(()) => (SendStatus::Sent, None),
			Err(e) => (SendStatus::SinkFailed, Some(e.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::{FilterError, SinkError};
	use crate::filter::AnnotateFilter;
	use crate::store::FileReportStore;
	use async_trait::async_trait;
	use std::collections::HashSet;
	use std::sync::Mutex;
	use tempfile::TempDir;

	struct TestSink {
		fail: HashSet<ReportId>,
		delay: Duration,
		received: Mutex<Vec<CrashReport>>,
	}

	impl TestSink {
		fn new(fail: &[ReportId]) -> Arc<Self> {
			Arc::new(Self {
				fail: fail.iter().copied().collect(),
				delay: Duration::ZERO,
				received: Mutex::new(Vec::new()),
			})
		}

		fn slow(delay: Duration) -> Arc<Self> {
			Arc::new(Self {
				fail: HashSet::new(),
				delay,
				received: Mutex::new(Vec::new()),
			})
		}

		fn received_ids(&self) -> Vec<ReportId> {
			self.received.lock().unwrap().iter().map(|r| r.id).collect()
		}
	}

	#[async_trait]
	impl ReportSink for TestSink {
		fn name(&self) -> &str {
			"test"
		}

		async fn send(&self, report: &CrashReport) -> std::result::Result<(), SinkError> {
			if !self.delay.is_zero() {
				tokio::time::sleep(self.delay).await;
			}
			if self.fail.contains(&report.id) {
				return Err(SinkError::Rejected {
					status: 500,
					message: "boom".to_string(),
				});
			}
			self.received.lock().unwrap().push(report.clone());
			Ok(())
		}
	}

	struct RejectAll;

	#[async_trait]
	impl ReportFilter for RejectAll {
		fn name(&self) -> &str {
			"reject_all"
		}

		async fn filter(&self, _report: CrashReport) -> std::result::Result<CrashReport, FilterError> {
			Err(FilterError::Rejected {
				filter: "reject_all".to_string(),
				reason: "test".to_string(),
			})
		}
	}

	fn store_with(dir: &TempDir, count: usize) -> (Arc<FileReportStore>, Vec<ReportId>) {
		let store = Arc::new(FileReportStore::open(dir.path(), "test", 10).unwrap());
		let ids = (0..count)
			.map(|_| {
				let id = store.allocate_id().unwrap();
				let mut report = CrashReport::empty(id);
				report.complete = true;
				store.finalize(id, &report).unwrap();
				id
			})
			.collect();
		(store, ids)
	}

	fn config(delete_behavior: DeleteBehavior) -> SendConfig {
		SendConfig {
			delete_behavior,
			..Default::default()
		}
	}

	#[tokio::test]
	async fn on_success_keeps_only_failed_report() {
		let dir = TempDir::new().unwrap();
		let (store, ids) = store_with(&dir, 2);
		let sink = TestSink::new(&[ids[0]]);
		let pipeline = SendPipeline::new(
			store.clone(),
			sink.clone(),
			config(DeleteBehavior::OnSuccess),
		);

		let summary = pipeline.send_all().await.unwrap();
		assert!(!summary.is_success());
		assert_eq!(summary.outcomes[0].id, ids[0]);
		assert_eq!(summary.outcomes[0].status, SendStatus::SinkFailed);
		assert!(!summary.outcomes[0].deleted);
		assert_eq!(summary.outcomes[1].status, SendStatus::Sent);
		assert!(summary.outcomes[1].deleted);
		assert_eq!(store.list().unwrap(), vec![ids[0]]);
	}

	#[tokio::test]
	async fn always_deletes_failures_and_never_keeps_successes() {
		let dir = TempDir::new().unwrap();
		let (store, ids) = store_with(&dir, 2);
		let pipeline = SendPipeline::new(store.clone(), TestSink::new(&[ids[0]]), config(DeleteBehavior::Always));
		pipeline.send_all().await.unwrap();
		assert!(store.list().unwrap().is_empty());

		let (store, _) = store_with(&dir, 2);
		let pipeline = SendPipeline::new(store.clone(), TestSink::new(&[]), config(DeleteBehavior::Never));
		let summary = pipeline.send_all().await.unwrap();
		assert!(summary.is_success());
		assert_eq!(store.list().unwrap().len(), 2);
	}

	#[tokio::test]
	async fn order_and_filters_apply() {
		let dir = TempDir::new().unwrap();
		let (store, ids) = store_with(&dir, 3);
		let sink = TestSink::new(&[]);
		let pipeline = SendPipeline::new(
			store.clone(),
			sink.clone(),
			SendConfig {
				order: SendOrder::NewestFirst,
				..config(DeleteBehavior::Never)
			},
		)
		.with_filters(FilterChain::new().with(AnnotateFilter::new().annotation("release", "1.2.3")));

		pipeline.send_all().await.unwrap();
		assert_eq!(sink.received_ids(), vec![ids[2], ids[1], ids[0]]);
		let received = sink.received.lock().unwrap();
		assert!(received.iter().all(|r| r.annotations["release"] == "1.2.3"));
	}

	#[tokio::test]
	async fn filter_failure_is_per_report() {
		let dir = TempDir::new().unwrap();
		let (store, _) = store_with(&dir, 2);
		let pipeline = SendPipeline::new(store.clone(), TestSink::new(&[]), config(DeleteBehavior::OnSuccess))
			.with_filters(FilterChain::new().with(RejectAll));
		let summary = pipeline.send_all().await.unwrap();
		assert_eq!(summary.count(SendStatus::FilterFailed), 2);
		assert_eq!(store.list().unwrap().len(), 2);
	}

	#[tokio::test]
	async fn canceled_reports_stay_in_store() {
		let dir = TempDir::new().unwrap();
		let (store, _) = store_with(&dir, 2);
		let pipeline = SendPipeline::new(store.clone(), TestSink::new(&[]), config(DeleteBehavior::Always));
		let cancel = CancellationToken::new();
		cancel.cancel();
		let summary = pipeline.send_all_with_cancel(cancel).await.unwrap();
		assert_eq!(summary.count(SendStatus::Canceled), 2);
		assert!(summary.outcomes.iter().all(|o| !o.deleted));
		assert_eq!(store.list().unwrap().len(), 2);
	}

	#[tokio::test]
	async fn slow_sink_times_out_without_delete() {
		let dir = TempDir::new().unwrap();
		let (store, _) = store_with(&dir, 2);
		let pipeline = SendPipeline::new(
			store.clone(),
			TestSink::slow(Duration::from_secs(5)),
			SendConfig {
				report_timeout: Duration::from_millis(50),
				concurrency: 2,
				..config(DeleteBehavior::Always)
			},
		);
		let summary = pipeline.send_all().await.unwrap();
		assert_eq!(summary.count(SendStatus::TimedOut), 2);
		assert_eq!(store.list().unwrap().len(), 2);
	}

	#[tokio::test]
	async fn empty_store_is_success() {
		let dir = TempDir::new().unwrap();
		let (store, _) = store_with(&dir, 0);
		let pipeline = SendPipeline::new(store, TestSink::new(&[]), SendConfig::default());
		let summary = pipeline.send_all().await.unwrap();
		assert!(summary.is_success());
		assert!(summary.outcomes.is_empty());
	}

	#[test]
	fn send_order_parses() {
		assert_eq!("oldest-first".parse::<SendOrder>().unwrap(), SendOrder::OldestFirst);
		assert_eq!("NEWEST_FIRST".parse::<SendOrder>().unwrap(), SendOrder::NewestFirst);
		assert!("random".parse::<SendOrder>().is_err());
	}
}
