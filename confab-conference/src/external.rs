//! Narrow interfaces to the capability probe and the analytics sink

use crate::events::AnalyticsEvent;

/// Environment capability queries
pub trait CapabilityProbe: Send + Sync {
    /// Whether the direct peer connection mode works in this environment
    fn supports_p2p(&self) -> bool;
}

/// Receives analytics notifications; must not block and cannot fail
pub trait AnalyticsSink: Send + Sync {
    fn send_event(&self, event: AnalyticsEvent);
}

/// Analytics sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn send_event(&self, event: AnalyticsEvent) {
        tracing::debug!(event = ?event, "Analytics event");
    }
}

/// Probe with a fixed answer
#[derive(Debug, Clone, Copy)]
pub struct StaticCapabilities {
    pub p2p: bool,
}

impl CapabilityProbe for StaticCapabilities {
    fn supports_p2p(&self) -> bool {
        self.p2p
    }
}
