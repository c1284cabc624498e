// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Report filters applied before delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use loom_crash_core::{compute_fingerprint, find_culprit, CrashReport};
use rustc_demangle::try_demangle;
use serde_json::Value;

use crate::backtrace::is_in_app_frame;
use crate::error::FilterError;

/// One step of the send pipeline.
///
/// A filter takes ownership of a report and hands back the report to send,
/// possibly changed. An error stops delivery of that report only.
#[async_trait]
pub trait ReportFilter: Send + Sync {
	fn name(&self) -> &str;

	async fn filter(&self, report: CrashReport) -> Result<CrashReport, FilterError>;
}

/// Runs filters in order; the chain is itself a filter.
#[derive(Clone, Default)]
pub struct FilterChain {
	filters: Vec<Arc<dyn ReportFilter>>,
}

impl FilterChain {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(mut self, filter: impl ReportFilter + 'static) -> Self {
		self.filters.push(Arc::new(filter));
		self
	}

	pub fn push(&mut self, filter: Arc<dyn ReportFilter>) {
		self.filters.push(filter);
	}

	pub fn len(&self) -> usize {
		self.filters.len()
	}

	pub fn is_empty(&self) -> bool {
		self.filters.is_empty()
	}
}

#[async_trait]
impl ReportFilter for FilterChain {
	fn name(&self) -> &str {
		"chain"
	}

	async fn filter(&self, mut report: CrashReport) -> Result<CrashReport, FilterError> {
		for filter in &self.filters {
			report = filter.filter(report).await?;
		}
		Ok(report)
	}
}

/// Demangles Rust symbols in the exception stack and refreshes `in_app`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemangleFilter;

#[async_trait]
impl ReportFilter for DemangleFilter {
	fn name(&self) -> &str {
		"demangle"
	}

	async fn filter(&self, mut report: CrashReport) -> Result<CrashReport, FilterError> {
		let Some(exception) = report.crash.as_mut().and_then(|c| c.error.exception.as_mut()) else {
			return Ok(report);
		};
		for frame in &mut exception.stack {
			let Some(function) = &frame.function else {
				continue;
			};
			if let Ok(symbol) = try_demangle(function) {
				let demangled = format!("{symbol:#}");
				if frame.module.is_none() {
					frame.module = demangled.rfind("::").map(|idx| demangled[..idx].to_string());
				}
				frame.in_app = is_in_app_frame(&demangled);
				frame.function = Some(demangled);
			}
		}
		Ok(report)
	}
}

/// Adds fixed annotations. Existing keys are overwritten.
#[derive(Debug, Clone, Default)]
pub struct AnnotateFilter {
	annotations: BTreeMap<String, Value>,
}

impl AnnotateFilter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn annotation(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.annotations.insert(key.into(), value.into());
		self
	}
}

#[async_trait]
impl ReportFilter for AnnotateFilter {
	fn name(&self) -> &str {
		"annotate"
	}

	async fn filter(&self, mut report: CrashReport) -> Result<CrashReport, FilterError> {
		for (key, value) in &self.annotations {
			report.annotations.insert(key.clone(), value.clone());
		}
		Ok(report)
	}
}

/// Stores a grouping fingerprint in `annotations.fingerprint`, plus the
/// culprit frame when one is known.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintFilter;

#[async_trait]
impl ReportFilter for FingerprintFilter {
	fn name(&self) -> &str {
		"fingerprint"
	}

	async fn filter(&self, mut report: CrashReport) -> Result<CrashReport, FilterError> {
		let fingerprint = compute_fingerprint(&report);
		report
			.annotations
			.insert("fingerprint".to_string(), Value::String(fingerprint));
		if let Some(culprit) = find_culprit(&report) {
			report
				.annotations
				.insert("culprit".to_string(), Value::String(culprit));
		}
		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_crash_core::{CrashInfo, ErrorInfo, ErrorKind, ExceptionInfo, Frame, ReportId};

	fn report_with_stack(stack: Vec<Frame>) -> CrashReport {
		let mut report = CrashReport::empty(ReportId(1));
		report.complete = true;
		report.crash = Some(CrashInfo {
			error: ErrorInfo {
				kind: ErrorKind::Panic,
				exception: Some(ExceptionInfo {
					name: "panic".to_string(),
					stack,
					..Default::default()
				}),
				..Default::default()
			},
			..Default::default()
		});
		report
	}

	struct Reject;

	#[async_trait]
	impl ReportFilter for Reject {
		fn name(&self) -> &str {
			"reject"
		}

		async fn filter(&self, _report: CrashReport) -> Result<CrashReport, FilterError> {
			Err(FilterError::Rejected {
				filter: "reject".to_string(),
				reason: "test".to_string(),
			})
		}
	}

	#[tokio::test]
	async fn demangles_legacy_symbols() {
		let report = report_with_stack(vec![Frame::symbol("_ZN7my_app4main17h0123456789abcdefE")]);
		let report = DemangleFilter.filter(report).await.unwrap();
		let frame = &report.exception().unwrap().stack[0];
		assert_eq!(frame.function.as_deref(), Some("my_app::main"));
		assert_eq!(frame.module.as_deref(), Some("my_app"));
		assert!(frame.in_app);
	}

	#[tokio::test]
	async fn chain_runs_in_order_and_stops_on_error() {
		let chain = FilterChain::new()
			.with(AnnotateFilter::new().annotation("env", "prod"))
			.with(FingerprintFilter);
		assert_eq!(chain.len(), 2);
		let report = chain
			.filter(report_with_stack(vec![Frame::symbol("app::run")]))
			.await
			.unwrap();
		assert_eq!(report.annotations["env"], "prod");
		let fingerprint = report.annotations["fingerprint"].as_str().unwrap();
		assert_eq!(fingerprint.len(), 64);

		let failing = FilterChain::new().with(Reject).with(AnnotateFilter::new().annotation("x", 1));
		assert!(failing.filter(report_with_stack(Vec::new())).await.is_err());
	}

	#[tokio::test]
	async fn fingerprint_groups_identical_stacks() {
		let a = FingerprintFilter
			.filter(report_with_stack(vec![Frame::symbol("app::a")]))
			.await
			.unwrap();
		let mut other = report_with_stack(vec![Frame::symbol("app::a")]);
		other.id = ReportId(2);
		let b = FingerprintFilter.filter(other).await.unwrap();
		let c = FingerprintFilter
			.filter(report_with_stack(vec![Frame::symbol("app::b")]))
			.await
			.unwrap();
		assert_eq!(a.annotations["fingerprint"], b.annotations["fingerprint"]);
		assert_ne!(a.annotations["fingerprint"], c.annotations["fingerprint"]);
	}
}
