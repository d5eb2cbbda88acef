use super::{AuditEvent, AuditLog};
use crate::run::RunsRoot;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
#[cfg(test)]
use {anyhow::anyhow, std::sync::Mutex};

/// Per-run `tool_calls.jsonl`, fsynced on every append.
pub struct FileAuditLog {
    root: RunsRoot,
}

impl FileAuditLog {
    pub fn new(root: RunsRoot) -> Self {
        Self { root }
    }
}

impl AuditLog for FileAuditLog {
    fn append(&self, event: &AuditEvent) -> Result<()> {
        let paths = self.root.run(&event.run_id);
        let path = paths.tool_calls_path();
        fs::create_dir_all(paths.dir())
            .with_context(|| format!("create {}", paths.dir().display()))?;
        let mut line = serde_json::to_vec(event).context("serialize audit event")?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        // One write per event keeps concurrent appenders from interleaving lines.
        file.write_all(&line)
            .with_context(|| format!("write {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync {}", path.display()))?;
        Ok(())
    }

    fn events(&self, run_id: &str) -> Result<Vec<AuditEvent>> {
        let path = self.root.run(run_id).tool_calls_path();
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
            })
            .collect()
    }
}

/// In-memory log for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

#[cfg(test)]
impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl AuditLog for MemoryAuditLog {
    fn append(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("audit log mutex poisoned"))?
            .push(event.clone());
        Ok(())
    }

    fn events(&self, run_id: &str) -> Result<Vec<AuditEvent>> {
        Ok(self
            .events
            .lock()
            .map_err(|_| anyhow!("audit log mutex poisoned"))?
            .iter()
            .filter(|event| event.run_id == run_id)
            .cloned()
            .collect())
    }
}
