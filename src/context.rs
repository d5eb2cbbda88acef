//! Explicit execution context shared by every orchestration component.
//!
//! Nothing reads ambient global state: the runs root, configuration, audit
//! sink, clock, and tool registry all travel in a [`RunContext`], so tests can
//! swap in an in-memory audit log or a fixed clock.
use crate::audit::{AuditEvent, AuditLog, FileAuditLog};
use crate::config::{load_config, IntakeConfig};
use crate::run::RunsRoot;
use crate::tool::ToolRegistry;
use crate::util::now_epoch_ms;
use anyhow::Result;
#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Result<u128>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Result<u128> {
        now_epoch_ms()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Default)]
pub struct FixedClock {
    now_ms: AtomicU64,
}

#[cfg(test)]
impl FixedClock {
    pub fn at(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now_ms(&self) -> Result<u128> {
        Ok(u128::from(self.now_ms.load(Ordering::SeqCst)))
    }
}

#[derive(Clone)]
pub struct RunContext {
    pub root: RunsRoot,
    pub config: IntakeConfig,
    pub audit: Arc<dyn AuditLog>,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<ToolRegistry>,
}

impl RunContext {
    /// Production context: config from `intake.json`, file-backed audit log.
    pub fn open(root: RunsRoot) -> Result<Self> {
        let config = load_config(&root)?;
        Ok(Self {
            audit: Arc::new(FileAuditLog::new(root.clone())),
            root,
            config,
            clock: Arc::new(SystemClock),
            registry: Arc::new(ToolRegistry::standard()),
        })
    }

    pub fn now(&self) -> Result<u128> {
        self.clock.now_ms()
    }

    pub fn emit(&self, event: &AuditEvent) -> Result<()> {
        self.audit.append(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances_only_on_request() {
        let clock = FixedClock::at(1_000);
        assert_eq!(clock.now_ms().unwrap(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms().unwrap(), 1_500);
    }
}
