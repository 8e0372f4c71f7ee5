//! One-way reporting of per-call payment outcomes.

use ethers::types::U256;

use crate::types::{ChannelError, ChannelId};

/// Where a call's state machine stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    Received,
    SignatureChecked,
    Authorized,
    Forwarded,
    Completed,
    Rejected,
    Aborted,
}

#[derive(Clone, Debug)]
pub enum Decision {
    Approved { income: U256 },
    Rejected { code: &'static str, reason: String },
    /// Payment checks are disabled for this deployment.
    Bypassed,
}

#[derive(Clone, Debug)]
pub struct CallOutcome {
    pub channel_id: Option<ChannelId>,
    pub path: String,
    pub phase: CallPhase,
    pub decision: Decision,
}

impl CallOutcome {
    pub fn rejected(channel_id: Option<ChannelId>, path: &str, error: &ChannelError) -> Self {
        Self {
            channel_id,
            path: path.to_string(),
            phase: CallPhase::Aborted,
            decision: Decision::Rejected {
                code: error.code(),
                reason: error.to_string(),
            },
        }
    }
}

/// Receives outcomes for metering. Must not influence the decision.
pub trait PaymentObserver: Send + Sync {
    fn record(&self, outcome: &CallOutcome);
}

/// Emits each outcome as a structured tracing event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl PaymentObserver for TracingObserver {
    fn record(&self, outcome: &CallOutcome) {
        match &outcome.decision {
            Decision::Approved { income } => tracing::info!(
                channel_id = ?outcome.channel_id,
                path = %outcome.path,
                phase = ?outcome.phase,
                income = %income,
                "call approved"
            ),
            Decision::Rejected { code, reason } => tracing::info!(
                channel_id = ?outcome.channel_id,
                path = %outcome.path,
                phase = ?outcome.phase,
                code,
                reason = %reason,
                "call rejected"
            ),
            Decision::Bypassed => tracing::trace!(path = %outcome.path, "payment check bypassed"),
        }
    }
}
