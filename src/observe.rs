use ethers_core::types::Address;
use parking_lot::Mutex;

use crate::types::{BundleId, CandidateId, ResultId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Expired { observed: u64, window: u64, head: u64 },
    TieBreak { winner: CandidateId },
    Invalid(String),
}

/// Structured events handed to the observability collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    CandidateEmitted { candidate: CandidateId, strategy: String, gross_profit: i128, height: u64 },
    CandidateDropped { candidate: CandidateId, reason: DropReason },
    SimulationCompleted { candidate: CandidateId, result: ResultId, verdict: String, net_profit: i128, gas_used: u64 },
    BundleBuilt { bundle: BundleId, result: ResultId, attempt: u32, txs: usize, target_block: u64 },
    BundleRejected { result: ResultId, reason: String },
    SubmissionTransition { bundle: BundleId, relay: String, status: &'static str, detail: Option<String> },
    RiskDenied { account: Address, stage: &'static str, reason: String },
    PermanentFailure { candidate: CandidateId, attempts: u32, reason: String },
    Degraded { component: &'static str, error: String },
    FatalAlert { account: Address, detail: String },
}

impl CoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreEvent::CandidateEmitted { .. } => "candidate_emitted",
            CoreEvent::CandidateDropped { reason: DropReason::Expired { .. }, .. } => "candidate_expired",
            CoreEvent::CandidateDropped { .. } => "candidate_dropped",
            CoreEvent::SimulationCompleted { .. } => "simulation_result",
            CoreEvent::BundleBuilt { .. } => "bundle_built",
            CoreEvent::BundleRejected { .. } => "bundle_rejected",
            CoreEvent::SubmissionTransition { .. } => "submission_transition",
            CoreEvent::RiskDenied { .. } => "risk_denied",
            CoreEvent::PermanentFailure { .. } => "permanent_failure",
            CoreEvent::Degraded { .. } => "degraded",
            CoreEvent::FatalAlert { .. } => "fatal_alert",
        }
    }

    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            CoreEvent::CandidateEmitted { candidate, strategy, gross_profit, height } => vec![
                ("candidate", candidate.to_string()),
                ("strategy", strategy.clone()),
                ("gross_profit", gross_profit.to_string()),
                ("height", height.to_string()),
            ],
            CoreEvent::CandidateDropped { candidate, reason } => {
                let mut f = vec![("candidate", candidate.to_string())];
                match reason {
                    DropReason::Expired { observed, window, head } => {
                        f.push(("reason", "expired".to_string()));
                        f.push(("observed", observed.to_string()));
                        f.push(("window", window.to_string()));
                        f.push(("head", head.to_string()));
                    }
                    DropReason::TieBreak { winner } => {
                        f.push(("reason", "tie_break".to_string()));
                        f.push(("winner", winner.to_string()));
                    }
                    DropReason::Invalid(msg) => {
                        f.push(("reason", "invalid".to_string()));
                        f.push(("detail", msg.clone()));
                    }
                }
                f
            }
            CoreEvent::SimulationCompleted { candidate, result, verdict, net_profit, gas_used } => vec![
                ("candidate", candidate.to_string()),
                ("result", result.to_string()),
                ("verdict", verdict.clone()),
                ("net_profit", net_profit.to_string()),
                ("gas_used", gas_used.to_string()),
            ],
            CoreEvent::BundleBuilt { bundle, result, attempt, txs, target_block } => vec![
                ("bundle", bundle.to_string()),
                ("result", result.to_string()),
                ("attempt", attempt.to_string()),
                ("txs", txs.to_string()),
                ("target_block", target_block.to_string()),
            ],
            CoreEvent::BundleRejected { result, reason } => {
                vec![("result", result.to_string()), ("reason", reason.clone())]
            }
            CoreEvent::SubmissionTransition { bundle, relay, status, detail } => {
                let mut f =
                    vec![("bundle", bundle.to_string()), ("relay", relay.clone()), ("status", status.to_string())];
                if let Some(d) = detail {
                    f.push(("detail", d.clone()));
                }
                f
            }
            CoreEvent::RiskDenied { account, stage, reason } => vec![
                ("account", format!("{account:?}")),
                ("stage", stage.to_string()),
                ("reason", reason.clone()),
            ],
            CoreEvent::PermanentFailure { candidate, attempts, reason } => vec![
                ("candidate", candidate.to_string()),
                ("attempts", attempts.to_string()),
                ("reason", reason.clone()),
            ],
            CoreEvent::Degraded { component, error } => {
                vec![("component", component.to_string()), ("error", error.clone())]
            }
            CoreEvent::FatalAlert { account, detail } => {
                vec![("account", format!("{account:?}")), ("detail", detail.clone())]
            }
        }
    }
}

/// Observability sink. Implementations must not block.
pub trait Observer: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

/// Writes every event through `tracing`; with `with-metrics` also counts them per kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn emit(&self, event: CoreEvent) {
        let kind = event.kind();
        let fields = event
            .fields()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        match &event {
            CoreEvent::FatalAlert { .. } => tracing::error!(kind, %fields, "fatal"),
            CoreEvent::Degraded { .. } | CoreEvent::PermanentFailure { .. } => tracing::warn!(kind, %fields, "event"),
            CoreEvent::RiskDenied { .. } => tracing::info!(kind, outcome = "deny", %fields, "event"),
            CoreEvent::CandidateDropped { .. } => tracing::debug!(kind, %fields, "event"),
            _ => tracing::info!(kind, %fields, "event"),
        }
        #[cfg(feature = "with-metrics")]
        metrics::counter!("searcher_events_total", "kind" => kind).increment(1);
    }
}

/// Keeps every event in memory. Used by tests and the dry-run report.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<CoreEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl Observer for RecordingObserver {
    fn emit(&self, event: CoreEvent) {
        TracingObserver.emit(event.clone());
        self.events.lock().push(event);
    }
}
