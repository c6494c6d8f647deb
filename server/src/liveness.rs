//! Liveness Tracker
//!
//! Derives the online/sleeping/offline state of each agent of one network
//! from the time its last message arrived. Observations and sweeps are
//! driven by the owning router, so no locking is needed.

use fleetlink_shared::{AgentId, LivenessState};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// What an inbound message says about the agent's power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Any regular traffic
    Alive,
    /// Flight controller reported itself powered down
    PoweredDown,
}

/// A single change of liveness state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTransition {
    pub agent: AgentId,
    pub from: LivenessState,
    pub to: LivenessState,
}

#[derive(Debug, Clone, Copy)]
struct AgentLiveness {
    last_seen: Instant,
    state: LivenessState,
}

/// Tracks last-seen timestamps and derived states of agents
#[derive(Debug)]
pub struct LivenessTracker {
    agents: HashMap<AgentId, AgentLiveness>,
    online_timeout: Duration,
}

impl LivenessTracker {
    pub fn new(online_timeout: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            online_timeout,
        }
    }

    /// Record a signal from an agent.
    ///
    /// Returns the transition it caused, if any. A single packet brings an
    /// offline agent straight back online.
    pub fn observe(
        &mut self,
        agent: AgentId,
        timestamp: Instant,
        signal: SignalKind,
    ) -> Option<LivenessTransition> {
        let target = match signal {
            SignalKind::Alive => LivenessState::Online,
            SignalKind::PoweredDown => LivenessState::Sleeping,
        };

        let entry = self.agents.entry(agent).or_insert(AgentLiveness {
            last_seen: timestamp,
            state: LivenessState::Unknown,
        });

        // Out-of-order timestamps never move last_seen backwards
        if timestamp > entry.last_seen {
            entry.last_seen = timestamp;
        }

        if entry.state == target {
            return None;
        }

        let from = entry.state;
        entry.state = target;

        match target {
            LivenessState::Sleeping => debug!(agent, %from, "Agent is sleeping"),
            _ => info!(agent, %from, "Agent is online"),
        }

        Some(LivenessTransition {
            agent,
            from,
            to: target,
        })
    }

    /// Move every agent silent for longer than the online timeout to Offline.
    ///
    /// Emits exactly one transition per agent that changed state.
    pub fn sweep(&mut self, now: Instant) -> Vec<LivenessTransition> {
        let mut transitions = Vec::new();

        for (&agent, entry) in self.agents.iter_mut() {
            let alive = matches!(
                entry.state,
                LivenessState::Online | LivenessState::Sleeping
            );
            if alive && now.saturating_duration_since(entry.last_seen) > self.online_timeout {
                info!(
                    agent,
                    silent_ms = now.saturating_duration_since(entry.last_seen).as_millis() as u64,
                    "Agent went offline"
                );
                transitions.push(LivenessTransition {
                    agent,
                    from: entry.state,
                    to: LivenessState::Offline,
                });
                entry.state = LivenessState::Offline;
            }
        }

        transitions
    }

    /// Current state of an agent; `Unknown` for agents never seen
    pub fn state_of(&self, agent: AgentId) -> LivenessState {
        self.agents
            .get(&agent)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    pub fn last_seen(&self, agent: AgentId) -> Option<Instant> {
        self.agents.get(&agent).map(|entry| entry.last_seen)
    }

    /// Check if any tracked agent is online
    pub fn any_online(&self) -> bool {
        self.agents
            .values()
            .any(|entry| entry.state == LivenessState::Online)
    }

    pub fn online_count(&self) -> usize {
        self.agents
            .values()
            .filter(|entry| entry.state == LivenessState::Online)
            .count()
    }

    /// Forget an agent entirely
    pub fn remove(&mut self, agent: AgentId) -> bool {
        self.agents.remove(&agent).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    #[test]
    fn test_unknown_for_unseen_agent() {
        let tracker = LivenessTracker::new(TIMEOUT);
        assert_eq!(tracker.state_of(42), LivenessState::Unknown);
        assert!(tracker.last_seen(42).is_none());
    }

    #[test]
    fn test_first_observation_goes_online() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();

        let transition = tracker.observe(7, t0, SignalKind::Alive);
        assert_eq!(
            transition,
            Some(LivenessTransition {
                agent: 7,
                from: LivenessState::Unknown,
                to: LivenessState::Online
            })
        );
        assert_eq!(tracker.state_of(7), LivenessState::Online);

        // Repeated heartbeats do not emit further events
        assert!(tracker
            .observe(7, t0 + Duration::from_millis(10), SignalKind::Alive)
            .is_none());
    }

    #[test]
    fn test_online_until_sweep_past_timeout() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.observe(7, t0, SignalKind::Alive);

        assert!(tracker.sweep(t0 + TIMEOUT / 2).is_empty());
        assert_eq!(tracker.state_of(7), LivenessState::Online);

        // Exactly at the timeout the agent is still online
        assert!(tracker.sweep(t0 + TIMEOUT).is_empty());

        let transitions = tracker.sweep(t0 + TIMEOUT * 3 / 2);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, LivenessState::Offline);
        assert_eq!(tracker.state_of(7), LivenessState::Offline);

        // A second sweep does not repeat the event
        assert!(tracker.sweep(t0 + TIMEOUT * 2).is_empty());
    }

    #[test]
    fn test_offline_agent_recovers_on_single_packet() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.observe(7, t0, SignalKind::Alive);
        tracker.sweep(t0 + TIMEOUT * 2);

        let transition = tracker.observe(7, t0 + TIMEOUT * 3, SignalKind::Alive);
        assert_eq!(
            transition.map(|t| (t.from, t.to)),
            Some((LivenessState::Offline, LivenessState::Online))
        );
    }

    #[test]
    fn test_powered_down_forces_sleeping() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.observe(3, t0, SignalKind::Alive);

        let transition = tracker.observe(3, t0, SignalKind::PoweredDown);
        assert_eq!(transition.map(|t| t.to), Some(LivenessState::Sleeping));
        assert!(!tracker.any_online());

        // Waking up
        tracker.observe(3, t0, SignalKind::Alive);
        assert_eq!(tracker.state_of(3), LivenessState::Online);
    }

    #[test]
    fn test_sleeping_agent_goes_offline_when_silent() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.observe(3, t0, SignalKind::PoweredDown);

        let transitions = tracker.sweep(t0 + TIMEOUT * 2);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, LivenessState::Sleeping);
    }

    #[test]
    fn test_late_timestamp_does_not_rewind_last_seen() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(500);
        tracker.observe(1, t1, SignalKind::Alive);
        tracker.observe(1, t0, SignalKind::Alive);
        assert_eq!(tracker.last_seen(1), Some(t1));
    }

    #[test]
    fn test_remove_and_counts() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.observe(1, t0, SignalKind::Alive);
        tracker.observe(2, t0, SignalKind::Alive);
        assert_eq!(tracker.online_count(), 2);

        assert!(tracker.remove(1));
        assert!(!tracker.remove(1));
        assert_eq!(tracker.online_count(), 1);
        assert_eq!(tracker.state_of(1), LivenessState::Unknown);
    }
}
