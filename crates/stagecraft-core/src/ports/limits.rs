//! LimitsSource port - concurrency caps, read on every claim pass.

use std::sync::RwLock;

use crate::domain::ConcurrencyLimits;

pub trait LimitsSource: Send + Sync {
    fn limits(&self) -> ConcurrencyLimits;
}

/// Caps fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct StaticLimits(pub ConcurrencyLimits);

impl LimitsSource for StaticLimits {
    fn limits(&self) -> ConcurrencyLimits {
        self.0
    }
}

/// Caps that can be changed while the scheduler runs (e.g. from a settings
/// screen). The next claim pass picks up the new values.
#[derive(Debug, Default)]
pub struct SharedLimits {
    inner: RwLock<ConcurrencyLimits>,
}

impl SharedLimits {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        Self {
            inner: RwLock::new(limits),
        }
    }

    pub fn set(&self, limits: ConcurrencyLimits) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = limits;
    }
}

impl LimitsSource for SharedLimits {
    fn limits(&self) -> ConcurrencyLimits {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}
