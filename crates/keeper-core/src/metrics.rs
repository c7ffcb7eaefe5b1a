//! Seam towards the metrics exporter. The books publish observations
//! through this trait; the server wires a prometheus implementation.

pub trait NodeMetrics: Send + Sync {
    fn node_alive(&self, node_id: &str, domain: &str, hostname: &str);
    fn node_event(&self, kind: &str, event: &str, node_id: &str, domain: &str, hostname: &str);
}

/// Discards everything; used in tests.
pub struct NoopMetrics;

impl NodeMetrics for NoopMetrics {
    fn node_alive(&self, _: &str, _: &str, _: &str) {}
    fn node_event(&self, _: &str, _: &str, _: &str, _: &str, _: &str) {}
}
