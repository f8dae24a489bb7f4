use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Recursion ceiling applied even when no explicit policy is set.
pub const DEFAULT_RECURSION_CEILING: u32 = 1000;

/// Caps under which a script executes. All fields optional; an unset field
/// means "unconstrained" and is omitted from the wire encoding entirely, so
/// "no limits" and "empty limits object" stay distinguishable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allocations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_recursion_depth: Option<u32>,
}

impl ResourceLimits {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_allocations: None,
            max_duration_ms: None,
            max_memory_bytes: None,
            gc_interval: None,
            max_recursion_depth: None,
        }
    }

    #[must_use]
    pub const fn max_allocations(mut self, count: u64) -> Self {
        self.max_allocations = Some(count);
        self
    }

    #[must_use]
    pub const fn max_duration_ms(mut self, ms: u64) -> Self {
        self.max_duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub const fn gc_interval(mut self, interval: u64) -> Self {
        self.gc_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = Some(depth);
        self
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.max_allocations.is_none()
            && self.max_duration_ms.is_none()
            && self.max_memory_bytes.is_none()
            && self.gc_interval.is_none()
            && self.max_recursion_depth.is_none()
    }

    /// Effective recursion ceiling; enforced even for an empty policy.
    #[must_use]
    pub const fn recursion_ceiling(&self) -> u32 {
        match self.max_recursion_depth {
            Some(depth) => depth,
            None => DEFAULT_RECURSION_CEILING,
        }
    }

    #[must_use]
    pub const fn max_duration(&self) -> Option<Duration> {
        match self.max_duration_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        }
    }
}

/// Resources consumed by one execution. Zero-filled when the transport
/// cannot measure (the worker path synthesizes this default).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub elapsed_ms: f64,
    pub stack_depth: u32,
    pub allocations: u64,
}
