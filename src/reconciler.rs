//! # Service Reconciler
//!
//! Turns a processing outcome into service restarts/reloads.
//!
//! Planning and execution are separate stages. [`build_plan`] is a pure
//! function of the process result and the configured bindings: it selects
//! every binding whose dependency set intersects the changed keys,
//! deduplicates by unit name, and preserves binding declaration order so
//! plans are reproducible. [`reconcile`] then executes the plan strictly
//! sequentially with a bounded per-call timeout; failures are collected per
//! unit and never abort the remaining units.

use crate::config::{ServiceAction, SystemdIntegration};
use crate::error::{Diagnostic, Stage};
use crate::processor::ProcessResult;
use crate::systemd::ServiceManager;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{error, info};

/// One planned service control action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    /// Unit to act on
    pub unit: String,
    /// Action to perform
    pub action: ServiceAction,
}

/// A failed action with its per-unit reason
#[derive(Debug, Clone)]
pub struct FailedAction {
    pub unit: String,
    pub action: ServiceAction,
    pub reason: String,
}

/// Outcome of executing a plan; successes and failures are both reported
#[derive(Debug, Default)]
pub struct ReconciliationReport {
    pub succeeded: Vec<PlannedAction>,
    pub failed: Vec<FailedAction>,
}

impl ReconciliationReport {
    /// Whether every planned action succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Convert into a result, aggregating every failure into one error
    pub fn into_result(self) -> Result<Self, Diagnostic> {
        if self.is_success() {
            return Ok(self);
        }
        let mut summary = format!(
            "{} of {} service action(s) failed",
            self.failed.len(),
            self.failed.len() + self.succeeded.len()
        );
        for failure in &self.failed {
            let _ = write!(
                summary,
                "\n  {} {}: {}",
                failure.action, failure.unit, failure.reason
            );
        }
        Err(
            Diagnostic::new(Stage::Reconcile, "systemd integration", anyhow::anyhow!(summary))
                .with_suggestions([
                    "Check the failing units with: journalctl -u <service-name>",
                    "Verify systemctl permissions",
                    "Review the systemd integration configuration",
                ]),
        )
    }
}

/// Build the ordered, deduplicated action plan for a run
///
/// A unit referenced by several matching bindings is scheduled exactly
/// once; when the bindings disagree on the action, restart wins over
/// reload since a restart subsumes a reload.
#[must_use]
pub fn build_plan(result: &ProcessResult, integration: &SystemdIntegration) -> Vec<PlannedAction> {
    if !integration.enable {
        return Vec::new();
    }

    let changed = result.changed_keys();
    let mut plan: Vec<PlannedAction> = Vec::new();
    let mut planned_index: HashMap<&str, usize> = HashMap::new();

    for binding in &integration.services {
        let affected = binding
            .depends_on_keys
            .iter()
            .any(|key| changed.contains(key.as_str()));
        if !affected {
            continue;
        }

        match planned_index.get(binding.name.as_str()) {
            Some(&index) => {
                if plan[index].action == ServiceAction::Reload
                    && binding.action == ServiceAction::Restart
                {
                    plan[index].action = ServiceAction::Restart;
                }
            }
            None => {
                planned_index.insert(binding.name.as_str(), plan.len());
                plan.push(PlannedAction {
                    unit: binding.name.clone(),
                    action: binding.action,
                });
            }
        }
    }

    plan
}

/// Execute a plan sequentially, collecting per-unit failures
///
/// This phase is not fail-fast: a timeout or failure on one unit is
/// recorded and the remaining units are still acted on.
pub async fn reconcile(
    manager: &dyn ServiceManager,
    plan: &[PlannedAction],
    timeout: Duration,
) -> ReconciliationReport {
    let mut report = ReconciliationReport::default();

    for planned in plan {
        info!("Performing {} on {}", planned.action, planned.unit);
        match tokio::time::timeout(timeout, manager.perform(&planned.unit, planned.action)).await {
            Ok(Ok(())) => {
                info!("✅ {} {} succeeded", planned.action, planned.unit);
                report.succeeded.push(planned.clone());
            }
            Ok(Err(err)) => {
                error!("{} {} failed: {}", planned.action, planned.unit, err);
                report.failed.push(FailedAction {
                    unit: planned.unit.clone(),
                    action: planned.action,
                    reason: err.to_string(),
                });
            }
            Err(_elapsed) => {
                error!(
                    "{} {} timed out after {:?}",
                    planned.action, planned.unit, timeout
                );
                report.failed.push(FailedAction {
                    unit: planned.unit.clone(),
                    action: planned.action,
                    reason: format!("timed out after {}s", timeout.as_secs()),
                });
            }
        }
    }

    report
}
