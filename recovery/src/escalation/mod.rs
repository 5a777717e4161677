//! Escalation Desk: prioritized tickets for failures the core cannot fix
//!
//! # Level rules (first match wins)
//!
//! ```text
//! kind in critical_kinds                      → CriticalAlert
//! prior attempts >= max_auto_recovery (5)     → HumanIntervention
//! failed attempts >= auto_escalate_after (3)  → SupervisorReview
//! severity Critical                           → CriticalAlert
//! severity High                               → SupervisorReview
//! otherwise                                   → AutoRecovery
//! ```
//!
//! Tickets move Pending → InProgress → {Resolved | Failed}, or to Cancelled
//! from either open state. Open tickets past their level's timeout are
//! failed the next time the desk is read.

pub mod desk;
pub mod notifier;
pub mod ticket;

pub use desk::{priority_score, EscalationConfig, EscalationDesk, LevelTimeouts, QueueReport};
pub use notifier::{LogNotifier, Notifier};
pub use ticket::{EscalationLevel, EscalationTicket, HandlerAction, TicketFilter, TicketStatus};
