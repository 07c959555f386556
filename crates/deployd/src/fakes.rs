//! Scripted CI double for tests.
//!
//! Responses are queued per endpoint and consumed in order. Once a queue is
//! empty the fake answers "not yet" (`Ok(None)`) for queue and build polls and
//! an empty final chunk for log reads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use deploy_core::config::DEFAULT_JOB_NAME;
use deploy_core::{BuildInstance, BuildRequest, LogChunk, QueueToken, RemoteOutcome};

use crate::ci::{CiApi, Result};

#[derive(Debug, Default)]
struct Script {
    trigger: VecDeque<Result<QueueToken>>,
    queue: VecDeque<Result<Option<u64>>>,
    build: VecDeque<Result<Option<RemoteOutcome>>>,
    log: VecDeque<Result<LogChunk>>,
}

#[derive(Debug)]
pub struct ScriptedCi {
    job_name: String,
    script: Mutex<Script>,
    trigger_calls: AtomicUsize,
    queue_calls: AtomicUsize,
    build_calls: AtomicUsize,
    log_calls: AtomicUsize,
}

impl Default for ScriptedCi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCi {
    pub fn new() -> Self {
        Self {
            job_name: DEFAULT_JOB_NAME.to_string(),
            script: Mutex::new(Script::default()),
            trigger_calls: AtomicUsize::new(0),
            queue_calls: AtomicUsize::new(0),
            build_calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = job_name.into();
        self
    }

    pub fn with_trigger(self, response: Result<QueueToken>) -> Self {
        self.script().trigger.push_back(response);
        self
    }

    pub fn push_queue(self, response: Result<Option<u64>>) -> Self {
        self.script().queue.push_back(response);
        self
    }

    pub fn push_build(self, response: Result<Option<RemoteOutcome>>) -> Self {
        self.script().build.push_back(response);
        self
    }

    pub fn push_log(self, response: Result<LogChunk>) -> Self {
        self.script().log.push_back(response);
        self
    }

    pub fn trigger_calls(&self) -> usize {
        self.trigger_calls.load(Ordering::SeqCst)
    }

    pub fn queue_calls(&self) -> usize {
        self.queue_calls.load(Ordering::SeqCst)
    }

    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CiApi for ScriptedCi {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    async fn trigger_build(&self, _request: &BuildRequest) -> Result<QueueToken> {
        self.trigger_calls.fetch_add(1, Ordering::SeqCst);
        self.script()
            .trigger
            .pop_front()
            .unwrap_or(Ok(QueueToken(1)))
    }

    async fn queue_item(&self, _queue_id: QueueToken) -> Result<Option<u64>> {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        self.script().queue.pop_front().unwrap_or(Ok(None))
    }

    async fn build_result(&self, _build: &BuildInstance) -> Result<Option<RemoteOutcome>> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        self.script().build.pop_front().unwrap_or(Ok(None))
    }

    async fn progressive_log(&self, _build: &BuildInstance, offset: u64) -> Result<LogChunk> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        self.script().log.pop_front().unwrap_or(Ok(LogChunk {
            text: String::new(),
            next_offset: offset,
            has_more: false,
        }))
    }
}
