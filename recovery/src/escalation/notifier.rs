//! Outbound notification channel for escalations
//!
//! The channel itself (email, webhook, pager) lives outside the core and is
//! injected into the desk. Notify failures are logged by the desk, never
//! retried.

use async_trait::async_trait;
use tracing::{info, warn};

use super::ticket::{EscalationLevel, EscalationTicket};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, level: EscalationLevel, ticket: &EscalationTicket) -> anyhow::Result<()>;
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, level: EscalationLevel, ticket: &EscalationTicket) -> anyhow::Result<()> {
        match level {
            EscalationLevel::CriticalAlert | EscalationLevel::HumanIntervention => warn!(
                ticket_id = %ticket.id,
                agent_id = %ticket.agent_id,
                level = %level,
                priority = ticket.priority,
                "Escalation requires attention: {}",
                ticket.reason
            ),
            _ => info!(
                ticket_id = %ticket.id,
                agent_id = %ticket.agent_id,
                level = %level,
                priority = ticket.priority,
                "Escalation queued: {}",
                ticket.reason
            ),
        }
        Ok(())
    }
}
