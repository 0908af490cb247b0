//! Compares a pre and a post state report.
//!
//! Every labeled metric is a hard check (PASS when equal). Ownership and
//! permission bits, application log findings and the storage listing diff
//! are soft: they are reported but do not fail validation. The healthy
//! service threshold is enforced separately by the caller.

use super::snapshot::Report;
use crate::config::Config;
use crate::fs::metadata::{audit_tree, resolve_owner};
use crate::utils::errors::Result;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pass,
    Fail,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pass => f.write_str("PASS"),
            Status::Fail => f.write_str("FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricResult {
    pub label: String,
    pub pre: Option<u64>,
    pub post: Option<u64>,
    pub status: Status,
}

impl MetricResult {
    fn describe(&self) -> String {
        format!(
            "{}: {}/{} {}",
            self.label,
            show(self.pre),
            show(self.post),
            self.status
        )
    }
}

fn show(value: Option<u64>) -> String {
    value.map_or_else(|| "missing".to_string(), |v| v.to_string())
}

/// Informational finding that never fails validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftFinding {
    pub check: &'static str,
    pub detail: String,
}

/// Paths present on one side only, or with a different size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingDiff {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    pub resized: Vec<String>,
}

impl ListingDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.resized.is_empty()
    }
}

/// Healthy service count against the configured minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHealth {
    pub healthy: usize,
    pub required: usize,
    pub total: usize,
}

impl ServiceHealth {
    pub fn ok(&self) -> bool {
        self.healthy >= self.required
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub metrics: Vec<MetricResult>,
    pub listing: ListingDiff,
    pub soft: Vec<SoftFinding>,
    pub services: Option<ServiceHealth>,
}

impl ValidationReport {
    pub fn metrics_passed(&self) -> bool {
        self.metrics.iter().all(|m| m.status == Status::Pass)
    }

    /// Hard metrics pass and the service threshold (if checked) is met.
    pub fn succeeded(&self) -> bool {
        self.metrics_passed() && self.services.map_or(true, |s| s.ok())
    }

    /// Itemised reasons for failure.
    pub fn failures(&self) -> Vec<String> {
        let mut failures: Vec<String> = self
            .metrics
            .iter()
            .filter(|m| m.status == Status::Fail)
            .map(MetricResult::describe)
            .collect();

        if let Some(services) = self.services.filter(|s| !s.ok()) {
            failures.push(format!(
                "Healthy services: {}/{} (minimum {})",
                services.healthy, services.total, services.required
            ));
        }
        failures
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for metric in &self.metrics {
            let _ = writeln!(out, "{}", metric.describe());
        }
        if let Some(services) = self.services {
            let _ = writeln!(
                out,
                "Healthy services: {}/{} (minimum {}) {}",
                services.healthy,
                services.total,
                services.required,
                if services.ok() { Status::Pass } else { Status::Fail }
            );
        }
        for path in &self.listing.missing {
            let _ = writeln!(out, "  missing after: {}", path);
        }
        for path in &self.listing.extra {
            let _ = writeln!(out, "  new after: {}", path);
        }
        for path in &self.listing.resized {
            let _ = writeln!(out, "  size changed: {}", path);
        }
        for finding in &self.soft {
            let _ = writeln!(out, "WARN [{}] {}", finding.check, finding.detail);
        }
        out
    }
}

/// Classify every metric found in either report.
pub fn compare(pre: &Report, post: &Report) -> ValidationReport {
    let mut labels: Vec<&str> = pre.metrics.iter().map(|(l, _)| l.as_str()).collect();
    for (label, _) in &post.metrics {
        if !labels.contains(&label.as_str()) {
            labels.push(label);
        }
    }

    let metrics = labels
        .into_iter()
        .map(|label| {
            let (pre_value, post_value) = (pre.metric(label), post.metric(label));
            let status = match (pre_value, post_value) {
                (Some(a), Some(b)) if a == b => Status::Pass,
                _ => Status::Fail,
            };
            MetricResult {
                label: label.to_string(),
                pre: pre_value,
                post: post_value,
                status,
            }
        })
        .collect();

    ValidationReport {
        metrics,
        listing: diff_listing(&pre.listing, &post.listing),
        soft: Vec::new(),
        services: None,
    }
}

fn diff_listing(pre: &[(String, u64)], post: &[(String, u64)]) -> ListingDiff {
    let before: BTreeMap<&str, u64> = pre.iter().map(|(p, s)| (p.as_str(), *s)).collect();
    let after: BTreeMap<&str, u64> = post.iter().map(|(p, s)| (p.as_str(), *s)).collect();

    let mut diff = ListingDiff::default();
    for (path, size) in &before {
        match after.get(path) {
            None => diff.missing.push(path.to_string()),
            Some(other) if other != size => diff.resized.push(path.to_string()),
            Some(_) => {}
        }
    }
    for path in after.keys() {
        if !before.contains_key(path) {
            diff.extra.push(path.to_string());
        }
    }
    diff
}

/// Ownership and permission bits of the storage tree against the allow-list.
pub fn permission_findings(config: &Config) -> Result<Vec<SoftFinding>> {
    let allowed = config.storage.allowed_mode_bits()?;
    let owner = match &config.storage.owner {
        Some(name) => Some(resolve_owner(name)?),
        None => None,
    };

    Ok(audit_tree(&config.storage.path, &allowed, owner)?
        .into_iter()
        .map(|d| SoftFinding {
            check: "permissions",
            detail: d.to_string(),
        })
        .collect())
}

/// Error-level lines in the tail of each configured application log.
pub fn log_findings(files: &[impl AsRef<Path>], tail: usize) -> Vec<SoftFinding> {
    let mut findings = Vec::new();

    for file in files {
        let path = file.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                findings.push(SoftFinding {
                    check: "logs",
                    detail: format!("{}: unreadable ({})", path.display(), e),
                });
                continue;
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(tail);
        let errors = lines[start..].iter().filter(|l| is_error_line(l)).count();
        if errors > 0 {
            findings.push(SoftFinding {
                check: "logs",
                detail: format!("{}: {} error line(s) in last {}", path.display(), errors, tail),
            });
        }
    }

    findings
}

fn is_error_line(line: &str) -> bool {
    line.split(|c: char| !c.is_ascii_alphabetic())
        .any(|word| matches!(word, "ERROR" | "CRITICAL" | "FATAL"))
}
