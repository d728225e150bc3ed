//! Pluggable priority / TTL assignment for queued packets.

use s2s_protocol::DataPacket;

/// Assigns a priority and a time-to-live to each packet at enqueue time.
///
/// Higher priorities dequeue first. A negative TTL means "never expires".
pub trait Prioritizer: Send + Sync {
    fn priority(&self, packet: &DataPacket) -> i64;
    fn ttl_ms(&self, packet: &DataPacket) -> i64;
}

/// Every packet gets priority 0 and never expires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPrioritizer;

impl Prioritizer for NoOpPrioritizer {
    fn priority(&self, _packet: &DataPacket) -> i64 {
        0
    }

    fn ttl_ms(&self, _packet: &DataPacket) -> i64 {
        -1
    }
}

/// Reads priority and TTL from packet attributes, falling back to defaults
/// when the attribute is missing or not an integer.
#[derive(Debug, Clone)]
pub struct AttributePrioritizer {
    pub priority_attribute: String,
    pub ttl_attribute: String,
    pub default_priority: i64,
    pub default_ttl_ms: i64,
}

impl AttributePrioritizer {
    pub fn new(priority_attribute: impl Into<String>, ttl_attribute: impl Into<String>) -> Self {
        Self {
            priority_attribute: priority_attribute.into(),
            ttl_attribute: ttl_attribute.into(),
            default_priority: 0,
            default_ttl_ms: -1,
        }
    }

    fn read(packet: &DataPacket, key: &str) -> Option<i64> {
        packet.attribute(key).and_then(|v| v.trim().parse().ok())
    }
}

impl Prioritizer for AttributePrioritizer {
    fn priority(&self, packet: &DataPacket) -> i64 {
        Self::read(packet, &self.priority_attribute).unwrap_or(self.default_priority)
    }

    fn ttl_ms(&self, packet: &DataPacket) -> i64 {
        Self::read(packet, &self.ttl_attribute).unwrap_or(self.default_ttl_ms)
    }
}
