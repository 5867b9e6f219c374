use std::time::Duration;

use courier_core::AllowList;
use serde::{Deserialize, Serialize};

use crate::retry::RetryOptions;

/// Library-side configuration for one composition's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry: RetryOptions,
    /// Upper bound on uploads in flight at once.
    pub max_concurrent: usize,
    /// Per-attachment deadline covering all retry attempts.
    pub upload_deadline_ms: Option<u64>,
    pub allow_list: AllowList,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            max_concurrent: 4,
            upload_deadline_ms: None,
            allow_list: AllowList::default(),
        }
    }
}

impl PipelineConfig {
    pub fn upload_deadline(&self) -> Option<Duration> {
        self.upload_deadline_ms.map(Duration::from_millis)
    }

    pub fn with_upload_deadline(mut self, deadline: Duration) -> Self {
        self.upload_deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = allow_list;
        self
    }
}
