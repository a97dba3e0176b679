//! Orchestration status, derived purely from stored history.

use crate::HistoryEvent;

/// High-level status of an orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Instance registered, no execution started yet.
    Pending,
    Running,
    Suspended,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
    ContinuedAsNew,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::NotFound => "NotFound",
            OrchestrationStatus::Pending => "Pending",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Suspended => "Suspended",
            OrchestrationStatus::Completed { .. } => "Completed",
            OrchestrationStatus::Failed { .. } => "Failed",
            OrchestrationStatus::Terminated { .. } => "Terminated",
            OrchestrationStatus::ContinuedAsNew => "ContinuedAsNew",
        }
    }
}

/// Derive the status of one execution from its history. An empty history is
/// `Pending`; the caller maps unknown instances to `NotFound`.
pub fn status_from_history(history: &[HistoryEvent]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::Pending;
    }
    let mut suspended = false;
    for event in history {
        match event {
            HistoryEvent::OrchestrationCompleted { output, .. } => {
                return OrchestrationStatus::Completed { output: output.clone() }
            }
            HistoryEvent::OrchestrationFailed { error, .. } => {
                return OrchestrationStatus::Failed { error: error.clone() }
            }
            HistoryEvent::OrchestrationTerminated { reason, .. } => {
                return OrchestrationStatus::Terminated { reason: reason.clone() }
            }
            HistoryEvent::OrchestrationContinuedAsNew { .. } => return OrchestrationStatus::ContinuedAsNew,
            HistoryEvent::ExecutionSuspended { .. } => suspended = true,
            HistoryEvent::ExecutionResumed { .. } => suspended = false,
            _ => {}
        }
    }
    if suspended {
        OrchestrationStatus::Suspended
    } else {
        OrchestrationStatus::Running
    }
}

/// Latest published custom status, if any.
pub(crate) fn custom_status_from_history(history: &[HistoryEvent]) -> Option<String> {
    history.iter().rev().find_map(|e| match e {
        HistoryEvent::CustomStatusSet { value, .. } => Some(value.clone()),
        _ => None,
    })
}

/// Error returned by the polling wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}
