//! Admin job execution.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::bail;

use crate::meta::Job;

/// Executes one kind of job on the leader.
pub trait JobHandler: Send + Sync {
    fn execute(&self, job: &Job, data: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Handlers by job kind, registered at startup.
#[derive(Default)]
pub struct JobRegistry {
    handlers: RwLock<HashMap<u64, Arc<dyn JobHandler>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: u64, handler: Arc<dyn JobHandler>) {
        self.handlers.write().unwrap().insert(kind, handler);
    }

    pub fn execute(&self, job: &Job, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let handler = self.handlers.read().unwrap().get(&job.kind).cloned();
        let Some(handler) = handler else {
            bail!("no handler registered for job kind {}", job.kind);
        };
        handler.execute(job, data)
    }
}
