//! Metric emission through the `metrics` facade.
//!
//! No recorder is installed here; the embedding process decides whether and
//! where these are exported.

use fleetlink_shared::NetworkId;

fn network_label(network: &NetworkId) -> String {
    network.as_str().to_owned()
}

/// Queue depth gauges.
pub mod gauges {
    use super::network_label;
    use fleetlink_shared::NetworkId;

    /// Set the total number of pending requests on a network.
    pub fn queue_depth(network: &NetworkId, depth: usize) {
        metrics::gauge!("fleetlink_queue_depth", "network" => network_label(network))
            .set(depth as f64);
    }

    /// Set the number of online agents on a network.
    pub fn agents_online(network: &NetworkId, count: usize) {
        metrics::gauge!("fleetlink_agents_online", "network" => network_label(network))
            .set(count as f64);
    }
}

/// Traffic and outcome counters.
pub mod counters {
    use super::network_label;
    use fleetlink_shared::NetworkId;

    /// Count one inbound message of the given kind.
    pub fn inbound_total(network: &NetworkId, kind: &'static str) {
        metrics::counter!(
            "fleetlink_inbound_total",
            "network" => network_label(network),
            "kind" => kind
        )
        .increment(1);
    }

    /// Count one inbound message dropped before routing.
    pub fn inbound_dropped_total(network: &NetworkId, reason: &'static str) {
        metrics::counter!(
            "fleetlink_inbound_dropped_total",
            "network" => network_label(network),
            "reason" => reason
        )
        .increment(1);
    }

    /// Count one broadcast frame of the given kind.
    pub fn broadcasts_total(network: &NetworkId, kind: &'static str) {
        metrics::counter!(
            "fleetlink_broadcasts_total",
            "network" => network_label(network),
            "kind" => kind
        )
        .increment(1);
    }

    /// Count one command reaching a terminal state.
    pub fn commands_total(network: &NetworkId, outcome: &'static str) {
        metrics::counter!(
            "fleetlink_commands_total",
            "network" => network_label(network),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Count one retransmission.
    pub fn retries_total(network: &NetworkId) {
        metrics::counter!("fleetlink_retries_total", "network" => network_label(network))
            .increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    use super::network_label;
    use fleetlink_shared::NetworkId;
    use std::time::Duration;

    /// Record a first-attempt round-trip time of one exchange class.
    pub fn rtt_seconds(network: &NetworkId, class: &'static str, rtt: Duration) {
        metrics::histogram!(
            "fleetlink_rtt_seconds",
            "network" => network_label(network),
            "class" => class
        )
        .record(rtt.as_secs_f64());
    }
}
