//! The Escalation Desk

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::notifier::{LogNotifier, Notifier};
use super::ticket::{EscalationLevel, EscalationTicket, HandlerAction, TicketFilter, TicketStatus};
use crate::error::{OpResult, OperationalError};
use crate::retention::{select_expired, Retained, RetentionPolicy};
use crate::storage::schema::{keys, NS_ESCALATIONS};
use crate::storage::{KvStoreExt, SharedStore};
use crate::types::{AttemptOutcome, FailureKind, FailureRecord, Severity};

/// Minutes an open ticket may wait, per level
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelTimeouts {
    pub auto_recovery_mins: u64,
    pub supervisor_review_mins: u64,
    pub human_intervention_mins: u64,
    pub critical_alert_mins: u64,
}

impl Default for LevelTimeouts {
    fn default() -> Self {
        Self {
            auto_recovery_mins: 30,
            supervisor_review_mins: 240,
            human_intervention_mins: 60,
            critical_alert_mins: 15,
        }
    }
}

impl LevelTimeouts {
    pub fn for_level(&self, level: EscalationLevel) -> Duration {
        let mins = match level {
            EscalationLevel::AutoRecovery => self.auto_recovery_mins,
            EscalationLevel::SupervisorReview => self.supervisor_review_mins,
            EscalationLevel::HumanIntervention => self.human_intervention_mins,
            EscalationLevel::CriticalAlert => self.critical_alert_mins,
        };
        Duration::minutes(mins as i64)
    }
}

/// Configuration for the Escalation Desk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Kinds that always raise a critical alert
    pub critical_kinds: Vec<FailureKind>,
    /// Prior attempts after which a human must step in
    pub max_auto_recovery_attempts: usize,
    /// Failed prior attempts that trigger supervisor review
    pub auto_escalate_after_failures: usize,
    pub timeouts: LevelTimeouts,
    /// Closed tickets kept for audit, newest first
    pub max_closed_tickets: usize,
    /// Closed tickets older than this are dropped
    pub closed_retention_hours: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            critical_kinds: vec![FailureKind::PermissionError],
            max_auto_recovery_attempts: 5,
            auto_escalate_after_failures: 3,
            timeouts: LevelTimeouts::default(),
            max_closed_tickets: 1000,
            closed_retention_hours: 168,
        }
    }
}

impl EscalationConfig {
    pub fn validate(&self) -> OpResult<()> {
        if self.max_auto_recovery_attempts == 0 || self.auto_escalate_after_failures == 0 {
            return Err(OperationalError::config(
                "escalation attempt thresholds must be > 0",
            ));
        }
        if self.max_closed_tickets == 0 {
            return Err(OperationalError::config("max_closed_tickets must be > 0"));
        }
        Ok(())
    }

    fn closed_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: self.max_closed_tickets,
            max_age: Duration::hours(self.closed_retention_hours as i64),
        }
    }
}

/// Id and close time of a terminal ticket
struct ClosedTicket {
    id: String,
    closed_at: DateTime<Utc>,
}

impl Retained for ClosedTicket {
    fn retained_id(&self) -> &str {
        &self.id
    }

    fn retained_at(&self) -> DateTime<Utc> {
        self.closed_at
    }
}

/// Outcome of one queue drain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueReport {
    /// Ticket ids in dispatch order
    pub dispatched: Vec<String>,
    pub notify_failures: usize,
}

/// `round(sev*0.4 + importance*0.3 + criticality*0.3 + failed*2)`, clamped
/// to 0–100
pub fn priority_score(failure: &FailureRecord, prior_attempts: &[AttemptOutcome]) -> u8 {
    let failed = prior_attempts.iter().filter(|a| !a.success).count() as f64;
    let raw = failure.severity.score() * 0.4
        + failure.context_score("agent_importance") * 0.3
        + failure.context_score("task_criticality") * 0.3
        + failed * 2.0;
    raw.round().clamp(0.0, 100.0) as u8
}

/// The Escalation Desk
///
/// Tickets are held in an in-process index and written through to the
/// `escalations` namespace. The index is merged with stored tickets on first
/// use, so a restarted desk sees earlier tickets.
pub struct EscalationDesk {
    store: SharedStore,
    config: EscalationConfig,
    notifier: Arc<dyn Notifier>,
    tickets: RwLock<HashMap<String, EscalationTicket>>,
    hydrated: AtomicBool,
}

impl EscalationDesk {
    pub fn new(store: SharedStore, config: EscalationConfig) -> Self {
        Self::with_notifier(store, config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        store: SharedStore,
        config: EscalationConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            config,
            notifier,
            tickets: RwLock::new(HashMap::new()),
            hydrated: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Level for a failure; first matching rule wins
    pub fn evaluate(&self, failure: &FailureRecord, prior_attempts: &[AttemptOutcome]) -> EscalationLevel {
        let failed = prior_attempts.iter().filter(|a| !a.success).count();
        if self.config.critical_kinds.contains(&failure.kind) {
            EscalationLevel::CriticalAlert
        } else if prior_attempts.len() >= self.config.max_auto_recovery_attempts {
            EscalationLevel::HumanIntervention
        } else if failed >= self.config.auto_escalate_after_failures {
            EscalationLevel::SupervisorReview
        } else {
            match failure.severity {
                Severity::Critical => EscalationLevel::CriticalAlert,
                Severity::High => EscalationLevel::SupervisorReview,
                _ => EscalationLevel::AutoRecovery,
            }
        }
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, HashMap<String, EscalationTicket>> {
        self.tickets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn hydrate(&self) -> OpResult<()> {
        if self.hydrated.load(Ordering::Acquire) {
            return Ok(());
        }
        let stored: Vec<EscalationTicket> = self.store.scan_json(NS_ESCALATIONS, keys::TICKET_PREFIX)?;
        let mut index = self.write_index();
        let loaded = stored.len();
        for ticket in stored {
            index.entry(ticket.id.clone()).or_insert(ticket);
        }
        self.hydrated.store(true, Ordering::Release);
        debug!(loaded, "Hydrated escalation tickets");
        Ok(())
    }

    fn persist(&self, ticket: &EscalationTicket) -> OpResult<()> {
        self.store
            .put_json(NS_ESCALATIONS, &keys::ticket(&ticket.id), ticket)
    }

    fn build_ticket(
        &self,
        failure: &FailureRecord,
        prior_attempts: &[AttemptOutcome],
        level: EscalationLevel,
        reason: String,
        now: DateTime<Utc>,
    ) -> EscalationTicket {
        EscalationTicket {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: failure.agent_id.clone(),
            task_id: failure.task_id.clone(),
            level,
            status: TicketStatus::Pending,
            priority: priority_score(failure, prior_attempts),
            reason,
            failure_snapshot: failure.clone(),
            prior_attempts: prior_attempts.to_vec(),
            created_at: now,
            updated_at: now,
            deadline: now + self.config.timeouts.for_level(level),
            handler: None,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Open a ticket; `level` overrides [`evaluate`](Self::evaluate)
    pub fn escalate(
        &self,
        failure: &FailureRecord,
        prior_attempts: &[AttemptOutcome],
        level: Option<EscalationLevel>,
    ) -> OpResult<String> {
        self.escalate_at(failure, prior_attempts, level, Utc::now())
    }

    pub fn escalate_at(
        &self,
        failure: &FailureRecord,
        prior_attempts: &[AttemptOutcome],
        level: Option<EscalationLevel>,
        now: DateTime<Utc>,
    ) -> OpResult<String> {
        self.hydrate()?;
        let level = level.unwrap_or_else(|| self.evaluate(failure, prior_attempts));
        let ticket = self.build_ticket(
            failure,
            prior_attempts,
            level,
            format!("{} failure: {}", failure.kind, failure.message),
            now,
        );

        let mut index = self.write_index();
        self.persist(&ticket)?;
        let id = ticket.id.clone();
        info!(
            ticket_id = %id,
            agent_id = %ticket.agent_id,
            level = %level,
            priority = ticket.priority,
            "Escalation ticket created"
        );
        index.insert(id.clone(), ticket);
        Ok(id)
    }

    /// Escalation that cannot fail.
    ///
    /// The level is raised to at least HumanIntervention. If the ticket
    /// cannot be stored it is still indexed in-process; the notifier is
    /// called immediately rather than waiting for a queue drain.
    pub async fn escalate_emergency(
        &self,
        failure: &FailureRecord,
        prior_attempts: &[AttemptOutcome],
        reason: &str,
    ) -> String {
        if let Err(e) = self.hydrate() {
            debug!(error = %e, "Emergency escalation without hydrated index");
        }
        let now = Utc::now();
        let level = self
            .evaluate(failure, prior_attempts)
            .max(EscalationLevel::HumanIntervention);
        let mut ticket = self.build_ticket(
            failure,
            prior_attempts,
            level,
            format!("emergency: {}", reason),
            now,
        );
        ticket.status = TicketStatus::InProgress;
        ticket.handler = Some(HandlerAction::from(level));

        if let Err(e) = self.persist(&ticket) {
            warn!(
                ticket_id = %ticket.id,
                agent_id = %ticket.agent_id,
                error = %e,
                "Emergency ticket not persisted, keeping in memory"
            );
        }
        self.write_index().insert(ticket.id.clone(), ticket.clone());
        warn!(
            ticket_id = %ticket.id,
            agent_id = %ticket.agent_id,
            level = %level,
            "Emergency escalation: {}",
            reason
        );

        if let Err(e) = self.notifier.notify(level, &ticket).await {
            warn!(ticket_id = %ticket.id, error = %format!("{:#}", e), "Notification failed");
        }
        ticket.id
    }

    /// Fail open tickets whose deadline has passed; returns how many
    pub fn expire_overdue_at(&self, now: DateTime<Utc>) -> usize {
        let mut index = self.write_index();
        let mut expired = 0;
        for ticket in index.values_mut() {
            if !ticket.is_overdue_at(now) {
                continue;
            }
            if ticket.transition(TicketStatus::Failed, now).is_ok() {
                ticket.resolution = Some("timed out".to_string());
                expired += 1;
                info!(ticket_id = %ticket.id, level = %ticket.level, "Escalation ticket timed out");
                if let Err(e) = self.persist(ticket) {
                    warn!(ticket_id = %ticket.id, error = %e, "Failed to persist ticket timeout");
                }
            }
        }
        expired
    }

    /// Drop closed tickets outside the retention policy; returns how many
    pub fn prune_closed_at(&self, now: DateTime<Utc>) -> usize {
        let mut index = self.write_index();
        let closed: Vec<ClosedTicket> = index
            .values()
            .filter(|t| !t.is_open())
            .map(|t| ClosedTicket {
                id: t.id.clone(),
                closed_at: t.resolved_at.unwrap_or(t.updated_at),
            })
            .collect();

        let expired = select_expired(&closed, &self.config.closed_policy(), now);
        for id in &expired {
            index.remove(id);
            if let Err(e) = self.store.delete(NS_ESCALATIONS, &keys::ticket(id)) {
                warn!(ticket_id = %id, error = %e, "Failed to delete closed ticket");
            }
        }
        if !expired.is_empty() {
            debug!(pruned = expired.len(), "Pruned closed escalation tickets");
        }
        expired.len()
    }

    fn refresh(&self, now: DateTime<Utc>) -> OpResult<()> {
        self.hydrate()?;
        self.expire_overdue_at(now);
        self.prune_closed_at(now);
        Ok(())
    }

    /// Apply `f` to a ticket and persist the result atomically
    fn update<F>(&self, ticket_id: &str, now: DateTime<Utc>, f: F) -> OpResult<EscalationTicket>
    where
        F: FnOnce(&mut EscalationTicket) -> OpResult<()>,
    {
        self.refresh(now)?;
        let mut index = self.write_index();
        let current = index
            .get(ticket_id)
            .ok_or_else(|| OperationalError::not_found("ticket", ticket_id))?;
        let mut next = current.clone();
        f(&mut next)?;
        self.persist(&next)?;
        index.insert(ticket_id.to_string(), next.clone());
        Ok(next)
    }

    /// Fetch a ticket, applying timeouts first
    pub fn get(&self, ticket_id: &str) -> OpResult<EscalationTicket> {
        self.refresh(Utc::now())?;
        self.tickets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(ticket_id)
            .cloned()
            .ok_or_else(|| OperationalError::not_found("ticket", ticket_id))
    }

    /// Mark a ticket as being worked on
    pub fn start(&self, ticket_id: &str) -> OpResult<()> {
        let now = Utc::now();
        self.update(ticket_id, now, |t| t.transition(TicketStatus::InProgress, now))?;
        debug!(ticket_id, "Escalation ticket started");
        Ok(())
    }

    /// Close a ticket as resolved.
    ///
    /// A second call, or a call on a cancelled/failed ticket, returns
    /// [`OperationalError::AlreadyResolved`].
    pub fn resolve(&self, ticket_id: &str, resolution: &str, resolved_by: &str) -> OpResult<()> {
        let now = Utc::now();
        let ticket = self.update(ticket_id, now, |t| {
            if t.status == TicketStatus::Pending {
                t.transition(TicketStatus::InProgress, now)?;
            }
            t.transition(TicketStatus::Resolved, now)?;
            t.resolution = Some(resolution.to_string());
            t.resolved_by = Some(resolved_by.to_string());
            Ok(())
        })?;
        info!(
            ticket_id,
            agent_id = %ticket.agent_id,
            resolved_by,
            "Escalation ticket resolved"
        );
        Ok(())
    }

    pub fn cancel(&self, ticket_id: &str, reason: &str) -> OpResult<()> {
        let now = Utc::now();
        self.update(ticket_id, now, |t| {
            t.transition(TicketStatus::Cancelled, now)?;
            t.resolution = Some(reason.to_string());
            Ok(())
        })?;
        info!(ticket_id, reason, "Escalation ticket cancelled");
        Ok(())
    }

    /// Open tickets matching `filter`, most urgent first (ties oldest first)
    pub fn pending(&self, filter: &TicketFilter) -> OpResult<Vec<EscalationTicket>> {
        self.pending_at(filter, Utc::now())
    }

    pub fn pending_at(&self, filter: &TicketFilter, now: DateTime<Utc>) -> OpResult<Vec<EscalationTicket>> {
        self.refresh(now)?;
        let index = self
            .tickets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut tickets: Vec<EscalationTicket> = index
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tickets.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tickets)
    }

    /// Dispatch every pending ticket to its level's handler, most urgent
    /// first. Dispatched tickets move to InProgress whether or not the
    /// notification succeeds.
    pub async fn process_queue(&self) -> OpResult<QueueReport> {
        let queue = self.pending(&TicketFilter::default())?;
        let mut report = QueueReport::default();

        for queued in queue {
            let now = Utc::now();
            let handler = HandlerAction::from(queued.level);
            let ticket = match self.update(&queued.id, now, |t| {
                t.transition(TicketStatus::InProgress, now)?;
                t.handler = Some(handler);
                Ok(())
            }) {
                Ok(ticket) => ticket,
                // Resolved or cancelled since the queue was read
                Err(OperationalError::AlreadyResolved { .. }) | Err(OperationalError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            };

            debug!(ticket_id = %ticket.id, handler = ?handler, priority = ticket.priority, "Dispatching escalation");
            if let Err(e) = self.notifier.notify(ticket.level, &ticket).await {
                report.notify_failures += 1;
                warn!(
                    ticket_id = %ticket.id,
                    level = %ticket.level,
                    error = %format!("{:#}", e),
                    "Notification failed"
                );
            }
            report.dispatched.push(ticket.id);
        }

        if !report.dispatched.is_empty() {
            info!(
                dispatched = report.dispatched.len(),
                notify_failures = report.notify_failures,
                "Escalation queue drained"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(EscalationLevel, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, level: EscalationLevel, ticket: &EscalationTicket) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((level, ticket.id.clone()));
            if self.fail {
                anyhow::bail!("webhook returned 503");
            }
            Ok(())
        }
    }

    fn desk() -> EscalationDesk {
        EscalationDesk::new(InMemoryStore::new().shared(), EscalationConfig::default())
    }

    fn failure(kind: FailureKind, severity: Severity) -> FailureRecord {
        FailureRecord::new("agent-1", "task-1", kind, "it broke").with_severity(severity)
    }

    fn attempts(failed: usize, ok: usize) -> Vec<AttemptOutcome> {
        let mut v: Vec<AttemptOutcome> = (0..failed).map(|_| AttemptOutcome::failed("retry", "no")).collect();
        v.extend((0..ok).map(|_| AttemptOutcome::succeeded("retry", serde_json::Value::Null)));
        v
    }

    #[test]
    fn test_evaluate_rule_order() {
        let d = desk();
        let low = failure(FailureKind::Timeout, Severity::Low);
        assert_eq!(d.evaluate(&low, &[]), EscalationLevel::AutoRecovery);
        assert_eq!(
            d.evaluate(&failure(FailureKind::PermissionError, Severity::Low), &[]),
            EscalationLevel::CriticalAlert
        );
        assert_eq!(d.evaluate(&low, &attempts(1, 4)), EscalationLevel::HumanIntervention);
        assert_eq!(d.evaluate(&low, &attempts(3, 0)), EscalationLevel::SupervisorReview);
        assert_eq!(
            d.evaluate(&failure(FailureKind::Timeout, Severity::Critical), &[]),
            EscalationLevel::CriticalAlert
        );
        assert_eq!(
            d.evaluate(&failure(FailureKind::Timeout, Severity::High), &[]),
            EscalationLevel::SupervisorReview
        );
        // Attempt count outranks severity
        assert_eq!(
            d.evaluate(&failure(FailureKind::Timeout, Severity::Critical), &attempts(5, 0)),
            EscalationLevel::HumanIntervention
        );
    }

    #[test]
    fn test_priority_score() {
        let f = failure(FailureKind::Timeout, Severity::Critical);
        // 10*0.4 + 5*0.3 + 5*0.3 = 7
        assert_eq!(priority_score(&f, &[]), 7);
        let f = f
            .with_context("agent_importance", 10)
            .with_context("task_criticality", 10);
        // 4 + 3 + 3 + 2*2
        assert_eq!(priority_score(&f, &attempts(2, 1)), 14);
        assert_eq!(priority_score(&f, &attempts(200, 0)), 100);
    }

    #[test]
    fn test_resolve_twice() {
        let d = desk();
        let id = d
            .escalate(&failure(FailureKind::Timeout, Severity::High), &[], None)
            .unwrap();
        d.resolve(&id, "restarted worker", "ops").unwrap();
        let err = d.resolve(&id, "again", "ops").unwrap_err();
        assert!(matches!(err, OperationalError::AlreadyResolved { .. }));

        let ticket = d.get(&id).unwrap();
        assert_eq!(ticket.status, TicketStatus::Resolved);
        assert_eq!(ticket.resolved_by.as_deref(), Some("ops"));
    }

    #[test]
    fn test_cancelled_ticket_cannot_resolve() {
        let d = desk();
        let id = d
            .escalate(&failure(FailureKind::Timeout, Severity::Low), &[], None)
            .unwrap();
        d.start(&id).unwrap();
        d.cancel(&id, "duplicate").unwrap();
        assert!(matches!(
            d.resolve(&id, "x", "y"),
            Err(OperationalError::AlreadyResolved { .. })
        ));
        assert!(d.resolve("missing", "x", "y").is_err());
    }

    #[test]
    fn test_pending_order_and_filter() {
        let d = desk();
        let low = d
            .escalate(&failure(FailureKind::Timeout, Severity::Low), &[], None)
            .unwrap();
        let crit = d
            .escalate(&failure(FailureKind::Timeout, Severity::Critical), &[], None)
            .unwrap();
        let mut other = failure(FailureKind::Timeout, Severity::Low);
        other.agent_id = "agent-2".into();
        d.escalate(&other, &[], None).unwrap();

        let all = d.pending(&TicketFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, crit);
        // Equal priority: oldest first
        assert_eq!(all[1].id, low);

        let mine = d.pending(&TicketFilter::for_agent("agent-1")).unwrap();
        assert_eq!(mine.len(), 2);
        let critical = d
            .pending(&TicketFilter {
                level: Some(EscalationLevel::CriticalAlert),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(critical.len(), 1);
    }

    #[test]
    fn test_overdue_tickets_fail() {
        let d = desk();
        let past = Utc::now() - Duration::minutes(20);
        let id = d
            .escalate_at(
                &failure(FailureKind::Timeout, Severity::Critical),
                &[],
                None,
                past,
            )
            .unwrap();
        let ticket = d.get(&id).unwrap();
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert_eq!(ticket.resolution.as_deref(), Some("timed out"));
        assert!(d.pending(&TicketFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_queue_dispatches_by_priority() {
        let notifier = Arc::new(RecordingNotifier::default());
        let d = EscalationDesk::with_notifier(
            InMemoryStore::new().shared(),
            EscalationConfig::default(),
            notifier.clone(),
        );
        let low = d
            .escalate(&failure(FailureKind::Timeout, Severity::Low), &[], None)
            .unwrap();
        let crit = d
            .escalate(&failure(FailureKind::Timeout, Severity::Critical), &[], None)
            .unwrap();

        let report = d.process_queue().await.unwrap();
        assert_eq!(report.dispatched, vec![crit.clone(), low.clone()]);
        assert_eq!(report.notify_failures, 0);

        let calls = notifier.calls.lock().unwrap().clone();
        assert_eq!(calls[0], (EscalationLevel::CriticalAlert, crit.clone()));
        assert_eq!(calls[1], (EscalationLevel::AutoRecovery, low));

        let ticket = d.get(&crit).unwrap();
        assert_eq!(ticket.status, TicketStatus::InProgress);
        assert_eq!(ticket.handler, Some(HandlerAction::SendCriticalAlert));

        // Nothing left to dispatch
        assert!(d.process_queue().await.unwrap().dispatched.is_empty());
    }

    #[tokio::test]
    async fn test_notify_failure_is_logged_not_fatal() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let d = EscalationDesk::with_notifier(
            InMemoryStore::new().shared(),
            EscalationConfig::default(),
            notifier,
        );
        let id = d
            .escalate(&failure(FailureKind::Timeout, Severity::High), &[], None)
            .unwrap();
        let report = d.process_queue().await.unwrap();
        assert_eq!(report.notify_failures, 1);
        assert_eq!(d.get(&id).unwrap().status, TicketStatus::InProgress);
    }

    #[tokio::test]
    async fn test_emergency_survives_storage_outage() {
        let store = Arc::new(InMemoryStore::new());
        let d = EscalationDesk::new(store.clone(), EscalationConfig::default());
        store.set_unavailable(true);

        let f = failure(FailureKind::Timeout, Severity::Low);
        assert!(d.escalate(&f, &[], None).is_err());
        let id = d.escalate_emergency(&f, &[], "storage down").await;

        store.set_unavailable(false);
        let ticket = d.get(&id).unwrap();
        assert_eq!(ticket.level, EscalationLevel::HumanIntervention);
        assert_eq!(ticket.status, TicketStatus::InProgress);
    }

    #[test]
    fn test_closed_tickets_are_pruned() {
        let store = InMemoryStore::new().shared();
        let config = EscalationConfig {
            max_closed_tickets: 2,
            ..Default::default()
        };
        let d = EscalationDesk::new(store.clone(), config);
        let f = failure(FailureKind::Timeout, Severity::Low);
        let ids: Vec<String> = (0..3).map(|_| d.escalate(&f, &[], None).unwrap()).collect();
        for id in &ids {
            d.resolve(id, "fixed", "ops").unwrap();
        }
        let open = d.escalate(&f, &[], None).unwrap();

        // Oldest closed ticket is gone from the index and the store
        assert!(matches!(d.get(&ids[0]), Err(OperationalError::NotFound { .. })));
        assert!(store.get(NS_ESCALATIONS, &keys::ticket(&ids[0])).unwrap().is_none());
        assert_eq!(d.get(&ids[2]).unwrap().status, TicketStatus::Resolved);

        // Past the age limit every closed ticket goes; open ones stay
        let later = Utc::now() + Duration::hours(169);
        assert_eq!(d.prune_closed_at(later), 2);
        assert!(d.get(&ids[2]).is_err());
        assert_eq!(d.get(&open).unwrap().status, TicketStatus::Pending);
    }

    #[test]
    fn test_restarted_desk_sees_tickets() {
        let store = InMemoryStore::new().shared();
        let d = EscalationDesk::new(store.clone(), EscalationConfig::default());
        let id = d
            .escalate(&failure(FailureKind::Timeout, Severity::High), &[], None)
            .unwrap();

        let restarted = EscalationDesk::new(store, EscalationConfig::default());
        assert_eq!(restarted.get(&id).unwrap().level, EscalationLevel::SupervisorReview);
        restarted.resolve(&id, "done", "ops").unwrap();
    }
}
