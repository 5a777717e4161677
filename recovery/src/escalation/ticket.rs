//! Escalation tickets and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OpResult, OperationalError};
use crate::types::{AttemptOutcome, FailureRecord};

/// Who has to look at a failure, least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    AutoRecovery,
    SupervisorReview,
    HumanIntervention,
    CriticalAlert,
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoRecovery => write!(f, "auto_recovery"),
            Self::SupervisorReview => write!(f, "supervisor_review"),
            Self::HumanIntervention => write!(f, "human_intervention"),
            Self::CriticalAlert => write!(f, "critical_alert"),
        }
    }
}

/// Handler a ticket is dispatched to when the queue drains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerAction {
    AttemptRecovery,
    QueueForReview,
    RequestHuman,
    SendCriticalAlert,
}

impl From<EscalationLevel> for HandlerAction {
    fn from(level: EscalationLevel) -> Self {
        match level {
            EscalationLevel::AutoRecovery => Self::AttemptRecovery,
            EscalationLevel::SupervisorReview => Self::QueueForReview,
            EscalationLevel::HumanIntervention => Self::RequestHuman,
            EscalationLevel::CriticalAlert => Self::SendCriticalAlert,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    InProgress,
    Resolved,
    Failed,
    Cancelled,
}

impl TicketStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Cancelled)
    }

    /// Pending → InProgress → {Resolved | Failed}; Cancelled or Failed from
    /// either open state. Nothing leaves a terminal state.
    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (InProgress, Resolved)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failure handed to supervisors or humans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTicket {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub level: EscalationLevel,
    pub status: TicketStatus,
    /// 0–100, higher is more urgent
    pub priority: u8,
    pub reason: String,
    /// The failure as it was when escalated
    pub failure_snapshot: FailureRecord,
    #[serde(default)]
    pub prior_attempts: Vec<AttemptOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Open tickets past this time fail on the next read
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub handler: Option<HandlerAction>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationTicket {
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Move to `next`, rejecting backwards or terminal transitions
    pub fn transition(&mut self, next: TicketStatus, now: DateTime<Utc>) -> OpResult<()> {
        if self.status.is_terminal() {
            return Err(OperationalError::AlreadyResolved {
                ticket_id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(OperationalError::transition(self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.resolved_at = Some(now);
        }
        Ok(())
    }

    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now > self.deadline
    }
}

/// Selection for [`EscalationDesk::pending`](super::EscalationDesk::pending)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketFilter {
    pub agent_id: Option<String>,
    pub level: Option<EscalationLevel>,
    pub min_priority: Option<u8>,
    /// Include tickets already dispatched but not closed
    pub include_in_progress: bool,
}

impl TicketFilter {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, ticket: &EscalationTicket) -> bool {
        let status_ok = match ticket.status {
            TicketStatus::Pending => true,
            TicketStatus::InProgress => self.include_in_progress,
            _ => false,
        };
        status_ok
            && self.agent_id.as_deref().map_or(true, |a| a == ticket.agent_id)
            && self.level.map_or(true, |l| l == ticket.level)
            && self.min_priority.map_or(true, |p| ticket.priority >= p)
    }
}
