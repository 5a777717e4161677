//! The Loop Detector

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::breaker::CircuitBreakerState;
use super::similarity::{canonical_cycle, pattern_hash, signature, windows_match};
use super::{LoopCheck, LoopConfig, LoopPattern, LoopSignal, ObservedAction};
use crate::canonical::value_checksum;
use crate::error::OpResult;
use crate::storage::schema::{keys, NS_CIRCUIT_BREAKERS, NS_LOOP_PATTERNS};
use crate::storage::{KvStoreExt, SharedStore};
use crate::types::FailureKind;

/// In-memory state for one agent
#[derive(Debug)]
struct AgentTrack {
    actions: VecDeque<ObservedAction>,
    /// Parallel to `actions`
    state_hashes: VecDeque<Option<String>>,
    breaker: CircuitBreakerState,
    patterns: HashMap<String, LoopPattern>,
}

impl AgentTrack {
    fn new(breaker: CircuitBreakerState, patterns: Vec<LoopPattern>) -> Self {
        Self {
            actions: VecDeque::new(),
            state_hashes: VecDeque::new(),
            breaker,
            patterns: patterns
                .into_iter()
                .map(|p| (p.pattern_hash.clone(), p))
                .collect(),
        }
    }

    fn push(&mut self, action: ObservedAction, capacity: usize) {
        while self.actions.len() >= capacity {
            self.actions.pop_front();
            self.state_hashes.pop_front();
        }
        self.state_hashes
            .push_back(action.state.as_ref().map(value_checksum));
        self.actions.push_back(action);
    }

    fn clear_actions(&mut self) {
        self.actions.clear();
        self.state_hashes.clear();
    }
}

fn lock(track: &Mutex<AgentTrack>) -> MutexGuard<'_, AgentTrack> {
    track.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The Loop Detector
pub struct LoopDetector {
    store: SharedStore,
    config: LoopConfig,
    tracks: DashMap<String, Arc<Mutex<AgentTrack>>>,
    breaker_trips: AtomicU64,
}

impl LoopDetector {
    pub fn new(store: SharedStore, config: LoopConfig) -> Self {
        Self {
            store,
            config,
            tracks: DashMap::new(),
            breaker_trips: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Number of Closed → Open transitions since construction
    pub fn breaker_trips(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    /// Per-agent track, hydrated from storage on first use
    fn track(&self, agent_id: &str) -> OpResult<Arc<Mutex<AgentTrack>>> {
        if let Some(track) = self.tracks.get(agent_id) {
            return Ok(track.value().clone());
        }

        let breaker = self
            .store
            .get_json::<CircuitBreakerState>(NS_CIRCUIT_BREAKERS, &keys::breaker(agent_id))?
            .unwrap_or_else(|| CircuitBreakerState::closed(agent_id, self.config.breaker_timeout_secs));
        let patterns: Vec<LoopPattern> = self
            .store
            .scan_json(NS_LOOP_PATTERNS, &keys::loop_pattern_prefix(agent_id))?;
        debug!(agent_id, patterns = patterns.len(), "Hydrated loop detector state");

        let track = Arc::new(Mutex::new(AgentTrack::new(breaker, patterns)));
        Ok(self
            .tracks
            .entry(agent_id.to_string())
            .or_insert(track)
            .value()
            .clone())
    }

    /// Record an action and run all loop checks against the agent's buffer.
    ///
    /// Checks are evaluated as of the action's timestamp.
    pub fn record_and_check(&self, agent_id: &str, action: ObservedAction) -> OpResult<LoopCheck> {
        let track = self.track(agent_id)?;
        let mut t = lock(&track);
        let now = action.timestamp;
        t.push(action, self.config.buffer_size);

        let signals = self.detect(&mut t, now);
        if signals.is_empty() {
            return Ok(LoopCheck::default());
        }

        let window: Vec<String> = {
            let skip = t.actions.len().saturating_sub(self.config.signature_window);
            t.actions.iter().skip(skip).map(signature).collect()
        };
        let hash = pattern_hash(&window);
        let pattern = t
            .patterns
            .entry(hash.clone())
            .and_modify(|p| {
                p.occurrences += 1;
                p.last_seen = now;
            })
            .or_insert_with(|| LoopPattern {
                id: uuid::Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                pattern_hash: hash.clone(),
                occurrences: 1,
                first_seen: now,
                last_seen: now,
                sample_actions: canonical_cycle(&window),
            })
            .clone();
        self.store
            .put_json(NS_LOOP_PATTERNS, &keys::loop_pattern(agent_id, &hash), &pattern)?;

        let reason = signals
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        if !t.breaker.is_open_at(now) {
            t.breaker
                .open(now, self.config.breaker_timeout_secs, reason.clone());
            self.store
                .put_json(NS_CIRCUIT_BREAKERS, &keys::breaker(agent_id), &t.breaker)?;
            self.breaker_trips.fetch_add(1, Ordering::Relaxed);
            info!(
                agent_id,
                pattern_hash = %hash,
                timeout_secs = self.config.breaker_timeout_secs,
                "Loop detected, circuit breaker opened: {}",
                reason
            );
        } else {
            debug!(
                agent_id,
                pattern_hash = %hash,
                occurrences = pattern.occurrences,
                "Loop re-detected while breaker open"
            );
        }

        Ok(LoopCheck {
            is_loop: true,
            pattern: Some(pattern),
            signals,
        })
    }

    fn detect(&self, t: &mut AgentTrack, now: DateTime<Utc>) -> Vec<LoopSignal> {
        let mut signals = Vec::new();
        if let Some(s) = self.check_repetition(t) {
            signals.push(s);
        }
        if let Some(s) = self.check_error_sequence(t) {
            signals.push(s);
        }
        if let Some(s) = self.check_state_cycle(t, now) {
            signals.push(s);
        }
        if let Some(s) = self.check_flood(t, now) {
            signals.push(s);
        }
        signals
    }

    fn check_repetition(&self, t: &mut AgentTrack) -> Option<LoopSignal> {
        let cfg = &self.config;
        let actions: &[ObservedAction] = t.actions.make_contiguous();
        let n = actions.len();

        for length in cfg.min_pattern_length..=cfg.max_pattern_length {
            let repeats = (cfg.max_iterations / length).max(3);
            if length * repeats > n {
                continue;
            }
            let latest = &actions[n - length..];
            let repeated = (1..repeats).all(|k| {
                let start = n - length * (k + 1);
                windows_match(latest, &actions[start..start + length], cfg.similarity_threshold)
            });
            if repeated {
                return Some(LoopSignal::Repetition { length, repeats });
            }
        }
        None
    }

    fn check_error_sequence(&self, t: &AgentTrack) -> Option<LoopSignal> {
        let kinds: Vec<FailureKind> = t.actions.iter().filter_map(|a| a.failure_kind).collect();

        let len = self.config.error_sequence_length;
        if kinds.len() >= len {
            let tail = &kinds[kinds.len() - len..];
            if tail.iter().all(|k| *k == tail[0]) {
                return Some(LoopSignal::ErrorSequence {
                    kinds: tail.to_vec(),
                });
            }
        }

        // ABABAB
        if kinds.len() >= 6 {
            let tail = &kinds[kinds.len() - 6..];
            let (a, b) = (tail[0], tail[1]);
            let alternating = a != b
                && tail
                    .iter()
                    .enumerate()
                    .all(|(i, k)| *k == if i % 2 == 0 { a } else { b });
            if alternating {
                return Some(LoopSignal::ErrorSequence {
                    kinds: tail.to_vec(),
                });
            }
        }
        None
    }

    fn check_state_cycle(&self, t: &AgentTrack, now: DateTime<Utc>) -> Option<LoopSignal> {
        let current = t.state_hashes.back()?.as_deref()?;
        let since = now - Duration::seconds(self.config.time_window_secs as i64);
        let occurrences = t
            .actions
            .iter()
            .zip(&t.state_hashes)
            .filter(|(a, h)| a.timestamp >= since && h.as_deref() == Some(current))
            .count();
        (occurrences >= self.config.state_repeat_threshold)
            .then_some(LoopSignal::StateCycle { occurrences })
    }

    fn check_flood(&self, t: &AgentTrack, now: DateTime<Utc>) -> Option<LoopSignal> {
        let since = now - Duration::seconds(self.config.flood_window_secs as i64);
        let actions = t.actions.iter().filter(|a| a.timestamp > since).count();
        (actions > self.config.max_iterations).then_some(LoopSignal::Flood {
            actions,
            window_secs: self.config.flood_window_secs,
        })
    }

    /// Whether the agent's breaker is open right now
    pub fn is_paused(&self, agent_id: &str) -> bool {
        self.is_paused_at(agent_id, Utc::now())
    }

    /// Whether the agent's breaker is open at `now`, closing it if timed out
    pub fn is_paused_at(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        let track = match self.track(agent_id) {
            Ok(track) => track,
            Err(e) => {
                warn!(agent_id, error = %e, "Could not load breaker state, treating agent as unpaused");
                return false;
            }
        };
        let mut t = lock(&track);
        self.expire_breaker(agent_id, &mut t, now);
        t.breaker.is_open_at(now)
    }

    fn expire_breaker(&self, agent_id: &str, t: &mut AgentTrack, now: DateTime<Utc>) {
        if !t.breaker.is_expired_at(now) {
            return;
        }
        t.breaker.close();
        if let Err(e) = self
            .store
            .put_json(NS_CIRCUIT_BREAKERS, &keys::breaker(agent_id), &t.breaker)
        {
            warn!(agent_id, error = %e, "Failed to persist breaker close");
        }
        info!(agent_id, "Circuit breaker closed after timeout");
    }

    /// Open the agent's breaker without a detected loop
    pub fn pause(&self, agent_id: &str, reason: &str) -> OpResult<()> {
        self.pause_at(agent_id, reason, Utc::now())
    }

    pub fn pause_at(&self, agent_id: &str, reason: &str, now: DateTime<Utc>) -> OpResult<()> {
        let track = self.track(agent_id)?;
        let mut t = lock(&track);
        let was_open = t.breaker.is_open_at(now);
        t.breaker.open(now, self.config.breaker_timeout_secs, reason);
        self.store
            .put_json(NS_CIRCUIT_BREAKERS, &keys::breaker(agent_id), &t.breaker)?;
        if !was_open {
            self.breaker_trips.fetch_add(1, Ordering::Relaxed);
        }
        info!(agent_id, reason, "Agent paused");
        Ok(())
    }

    /// Break an active loop: keep the breaker open and drop the buffered
    /// actions so the same history is not re-detected after the timeout.
    pub fn break_loop(&self, agent_id: &str, reason: &str) -> OpResult<()> {
        self.break_loop_at(agent_id, reason, Utc::now())
    }

    pub fn break_loop_at(&self, agent_id: &str, reason: &str, now: DateTime<Utc>) -> OpResult<()> {
        let track = self.track(agent_id)?;
        let mut t = lock(&track);
        if !t.breaker.is_open_at(now) {
            t.breaker.open(now, self.config.breaker_timeout_secs, reason);
            self.store
                .put_json(NS_CIRCUIT_BREAKERS, &keys::breaker(agent_id), &t.breaker)?;
            self.breaker_trips.fetch_add(1, Ordering::Relaxed);
        }
        let dropped = t.actions.len();
        t.clear_actions();
        info!(agent_id, dropped, "Loop broken, action buffer cleared");
        Ok(())
    }

    /// Close the breaker and forget the agent's buffer and patterns
    pub fn reset(&self, agent_id: &str) -> OpResult<()> {
        let track = self.track(agent_id)?;
        let mut t = lock(&track);
        for hash in t.patterns.keys() {
            self.store
                .delete(NS_LOOP_PATTERNS, &keys::loop_pattern(agent_id, hash))?;
        }
        self.store
            .delete(NS_CIRCUIT_BREAKERS, &keys::breaker(agent_id))?;

        t.patterns.clear();
        t.clear_actions();
        t.breaker = CircuitBreakerState::closed(agent_id, self.config.breaker_timeout_secs);
        info!(agent_id, "Loop detector reset");
        Ok(())
    }

    /// Current breaker state, with timeouts applied
    pub fn breaker(&self, agent_id: &str) -> OpResult<CircuitBreakerState> {
        self.breaker_at(agent_id, Utc::now())
    }

    pub fn breaker_at(&self, agent_id: &str, now: DateTime<Utc>) -> OpResult<CircuitBreakerState> {
        let track = self.track(agent_id)?;
        let mut t = lock(&track);
        self.expire_breaker(agent_id, &mut t, now);
        Ok(t.breaker.clone())
    }

    /// Known patterns for an agent, oldest first
    pub fn patterns(&self, agent_id: &str) -> OpResult<Vec<LoopPattern>> {
        let track = self.track(agent_id)?;
        let t = lock(&track);
        let mut patterns: Vec<LoopPattern> = t.patterns.values().cloned().collect();
        patterns.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_detect::BreakerStatus;
    use crate::storage::InMemoryStore;
    use serde_json::json;

    fn detector(config: LoopConfig) -> LoopDetector {
        LoopDetector::new(InMemoryStore::new().shared(), config)
    }

    fn timeout_at(ts: DateTime<Utc>, n: u32) -> ObservedAction {
        ObservedAction::new("timeout", format!("request timed out after {}s", 30 + n))
            .with_failure_kind(FailureKind::Timeout)
            .at(ts)
    }

    #[test]
    fn test_error_sequence_opens_breaker() {
        let d = detector(LoopConfig::default());
        let base = Utc::now();
        for i in 0..4 {
            let check = d
                .record_and_check("a", timeout_at(base + Duration::seconds(i), i as u32))
                .unwrap();
            assert!(!check.is_loop, "loop at {}", i);
        }
        let check = d
            .record_and_check("a", timeout_at(base + Duration::seconds(4), 4))
            .unwrap();
        assert!(check.is_loop);
        assert!(matches!(check.signals[0], LoopSignal::ErrorSequence { .. }));
        assert!(d.is_paused_at("a", base + Duration::seconds(5)));
        assert!(!d.is_paused("other"));
    }

    #[test]
    fn test_alternating_errors() {
        let d = detector(LoopConfig::default());
        let base = Utc::now();
        let mut last = LoopCheck::default();
        for i in 0..6 {
            let kind = if i % 2 == 0 {
                FailureKind::Timeout
            } else {
                FailureKind::ToolFailure
            };
            last = d
                .record_and_check(
                    "a",
                    ObservedAction::new(kind.to_string(), format!("failure {}", i))
                        .with_failure_kind(kind)
                        .at(base + Duration::seconds(i)),
                )
                .unwrap();
        }
        assert!(last.is_loop);
    }

    #[test]
    fn test_state_cycle() {
        let d = detector(LoopConfig::default());
        let base = Utc::now();
        let states = [json!({"pos": 1}), json!({"pos": 2}), json!({"pos": 1}), json!({"pos": 3})];
        for (i, s) in states.iter().enumerate() {
            let check = d
                .record_and_check(
                    "a",
                    ObservedAction::new(format!("step{}", i), "move")
                        .with_state(s.clone())
                        .at(base + Duration::seconds(i as i64)),
                )
                .unwrap();
            assert!(!check.is_loop);
        }
        let check = d
            .record_and_check(
                "a",
                ObservedAction::new("step9", "move")
                    .with_state(json!({"pos": 1}))
                    .at(base + Duration::seconds(10)),
            )
            .unwrap();
        assert_eq!(check.signals, vec![LoopSignal::StateCycle { occurrences: 3 }]);
    }

    #[test]
    fn test_state_cycle_respects_window() {
        let d = detector(LoopConfig::default());
        let base = Utc::now();
        for i in 0..3 {
            let check = d
                .record_and_check(
                    "a",
                    ObservedAction::new(format!("s{}", i), "m")
                        .with_state(json!("same"))
                        .at(base + Duration::seconds(200 * i)),
                )
                .unwrap();
            assert!(!check.is_loop);
        }
    }

    #[test]
    fn test_flood() {
        let d = detector(LoopConfig::default());
        let base = Utc::now();
        let mut last = LoopCheck::default();
        for i in 0..51 {
            last = d
                .record_and_check(
                    "a",
                    ObservedAction::new(format!("distinct-{}", i), format!("{}", "x".repeat(i)))
                        .at(base + Duration::milliseconds(i as i64 * 100)),
                )
                .unwrap();
            if i < 50 {
                assert!(!last.is_loop, "loop at {}", i);
            }
        }
        assert!(last
            .signals
            .iter()
            .any(|s| matches!(s, LoopSignal::Flood { actions: 51, .. })));
    }

    #[test]
    fn test_four_cycle_opens_breaker_once() {
        let d = detector(LoopConfig {
            max_iterations: 12,
            ..Default::default()
        });
        let base = Utc::now();
        let cycle = ["read", "write", "compile", "test"];
        let mut detections = 0;
        for i in 0..24 {
            let kind = cycle[i % 4];
            let check = d
                .record_and_check(
                    "a",
                    ObservedAction::new(kind, format!("{} src/lib.rs", kind))
                        .at(base + Duration::seconds(i as i64)),
                )
                .unwrap();
            if check.is_loop {
                detections += 1;
            }
        }

        assert!(detections > 1);
        assert_eq!(d.breaker_trips(), 1);
        let patterns = d.patterns("a").unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrences, detections);
        assert_eq!(patterns[0].sample_actions.len(), 4);
    }

    #[test]
    fn test_breaker_auto_closes() {
        let d = detector(LoopConfig::default());
        let now = Utc::now();
        d.pause_at("a", "manual", now).unwrap();
        assert!(d.is_paused_at("a", now + Duration::seconds(30)));
        assert!(!d.is_paused_at("a", now + Duration::seconds(61)));
        assert_eq!(
            d.breaker_at("a", now + Duration::seconds(61)).unwrap().status,
            BreakerStatus::Closed
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let store = InMemoryStore::new().shared();
        let d = LoopDetector::new(store.clone(), LoopConfig::default());
        let base = Utc::now();
        for i in 0..5 {
            d.record_and_check("a", timeout_at(base + Duration::seconds(i), 0))
                .unwrap();
        }
        assert!(d.is_paused_at("a", base + Duration::seconds(5)));
        d.reset("a").unwrap();
        assert!(!d.is_paused_at("a", base + Duration::seconds(5)));
        assert!(d.patterns("a").unwrap().is_empty());

        // A fresh detector sees the reset
        let fresh = LoopDetector::new(store, LoopConfig::default());
        assert!(fresh.patterns("a").unwrap().is_empty());
    }

    #[test]
    fn test_state_survives_restart() {
        let store = InMemoryStore::new().shared();
        let d = LoopDetector::new(store.clone(), LoopConfig::default());
        let now = Utc::now();
        d.pause_at("a", "operator", now).unwrap();

        let restarted = LoopDetector::new(store, LoopConfig::default());
        assert!(restarted.is_paused_at("a", now + Duration::seconds(1)));
        assert_eq!(
            restarted.breaker("a").unwrap().reason.as_deref(),
            Some("operator")
        );
    }

    #[test]
    fn test_break_loop_clears_buffer() {
        let d = detector(LoopConfig::default());
        let base = Utc::now();
        for i in 0..5 {
            d.record_and_check("a", timeout_at(base + Duration::seconds(i), 0))
                .unwrap();
        }
        d.break_loop_at("a", "loop", base + Duration::seconds(5)).unwrap();
        assert_eq!(d.breaker_trips(), 1);
        // Buffer cleared: the next failure alone is not a loop
        let check = d
            .record_and_check("a", timeout_at(base + Duration::seconds(120), 0))
            .unwrap();
        assert!(!check.is_loop);
    }
}
