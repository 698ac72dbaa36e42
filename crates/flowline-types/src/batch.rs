//! Batch windows coalescing bursts of trigger events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Accumulation buffer for one (workflow, node) pair.
///
/// A window opens with its first event and flushes exactly once, either when
/// `current_count` reaches `window_size` or when a sweep sees
/// `window_closes_at` pass. `generation` counts completed flushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchWindow {
    pub workflow_id: String,
    pub node_id: String,
    pub current_batch: Vec<Value>,
    pub current_count: u32,
    pub window_size: u32,
    pub window_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_closes_at: Option<DateTime<Utc>>,
    pub generation: u64,
    pub version: i64,
}

impl BatchWindow {
    pub fn empty(workflow_id: &str, node_id: &str, window_size: u32, window_secs: u64) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            node_id: node_id.to_string(),
            current_batch: Vec::new(),
            current_count: 0,
            window_size,
            window_secs,
            window_started_at: None,
            window_closes_at: None,
            generation: 0,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.current_count > 0
    }
}
