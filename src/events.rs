use crate::exit::ExitStatus;

/// Lifecycle events emitted by the orchestrator. Delivery is
/// fire-and-forget: notifier failures are ignored so a broken webhook can
/// never take down a multi-hour run.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    Started {
        session_id: String,
        tasks_file: String,
        max_iterations: u32,
    },
    Completed {
        iterations: u32,
    },
    Escalate,
    Blocked,
    Inadmissible,
    MaxIterations {
        max_iterations: u32,
    },
    Interrupted,
    TasksInvalid,
}

impl LoopEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Escalate => "escalate",
            Self::Blocked => "blocked",
            Self::Inadmissible => "inadmissible",
            Self::MaxIterations { .. } => "max_iterations",
            Self::Interrupted => "interrupted",
            Self::TasksInvalid => "tasks_invalid",
        }
    }

    /// The event matching a terminal exit, if one exists.
    pub fn for_exit(status: ExitStatus, iterations: u32, max_iterations: u32) -> Option<Self> {
        match status {
            ExitStatus::Success => Some(Self::Completed { iterations }),
            ExitStatus::Escalate => Some(Self::Escalate),
            ExitStatus::Blocked => Some(Self::Blocked),
            ExitStatus::Inadmissible => Some(Self::Inadmissible),
            ExitStatus::MaxIterations => Some(Self::MaxIterations { max_iterations }),
            ExitStatus::Interrupted => Some(Self::Interrupted),
            ExitStatus::TasksInvalid => Some(Self::TasksInvalid),
            ExitStatus::Error => None,
        }
    }
}

/// External notification seam. Implementations post to webhooks, desktop
/// notifiers, or anything else; errors must be swallowed internally.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &LoopEvent);
}

/// Default notifier: structured log lines only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &LoopEvent) {
        tracing::info!(event = event.name(), detail = ?event, "lifecycle event");
    }
}
