//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Reaction to container changes made outside the control plane."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use serde::Serialize;
use tracing::{debug, warn};

use crate::deployment::DeploymentStatus;
use crate::error::Result;
use crate::reconciler::Reconciler;

/// What a drift pass found and changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftSummary {
    /// Containers known after the refresh.
    pub containers: usize,
    /// Drift events reported by the registry.
    pub events: usize,
    /// Deployments marked degraded by this pass.
    pub degraded: Vec<String>,
    /// Affected deployments skipped because an operation held them.
    pub busy: Vec<String>,
}

impl Reconciler {
    /// Refresh the registry and degrade every deployment that lost a member
    /// (vanished, or stopped without a request). Deployments with an
    /// operation in flight are left for the next pass.
    pub async fn reconcile_drift(&self) -> Result<DriftSummary> {
        let report = self.registry.refresh().await?;
        let lost = report.lost_ids();
        let mut summary = DriftSummary {
            containers: report.containers.len(),
            events: report.drift.len(),
            ..Default::default()
        };
        if lost.is_empty() {
            return Ok(summary);
        }

        for slot in self.slots() {
            let members = slot.members();
            if !members.iter().any(|m| lost.contains(m.as_str())) {
                continue;
            }
            let id = slot.id();
            let Some(_gate) = slot.try_acquire() else {
                debug!(deployment = %id, "deployment busy; drift left for next pass");
                summary.busy.push(id);
                continue;
            };
            if slot.is_retired() {
                continue;
            }
            let pruned = self.prune(&slot);
            slot.update(|d| d.status = DeploymentStatus::Degraded);
            warn!(
                deployment = %id,
                pruned,
                "members changed outside kormit; deployment degraded"
            );
            summary.degraded.push(id);
        }
        Ok(summary)
    }
}
