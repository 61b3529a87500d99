use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::execution::CapturedStream;
use crate::models::TaskId;

pub const DEFAULT_MAX_TASK_OUTPUT_RECORDS: usize = 512;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskOutputRecord {
    pub command: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Captured process output keyed by task id, so it can be read after the
/// task finished. Oldest tasks are evicted once `max_records` is reached.
#[derive(Debug)]
pub struct TaskOutputStore {
    max_records: usize,
    outputs: Mutex<BTreeMap<TaskId, TaskOutputRecord>>,
}

impl Default for TaskOutputStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TASK_OUTPUT_RECORDS)
    }
}

impl TaskOutputStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            outputs: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(
        &self,
        task_id: TaskId,
        command: Option<String>,
        stdout: &CapturedStream,
        stderr: &CapturedStream,
    ) {
        let mut outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        if !outputs.contains_key(&task_id)
            && outputs.len() >= self.max_records
            && let Some(oldest_task_id) = outputs.keys().next().copied()
        {
            outputs.remove(&oldest_task_id);
        }

        outputs.insert(
            task_id,
            TaskOutputRecord {
                command,
                stdout: normalize_stream(stdout),
                stderr: normalize_stream(stderr),
            },
        );
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskOutputRecord> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .cloned()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&task_id)
    }

    pub fn remove(&self, task_id: TaskId) {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_id);
    }
}

fn normalize_stream(stream: &CapturedStream) -> Option<String> {
    if stream.bytes.iter().all(u8::is_ascii_whitespace) && !stream.is_truncated() {
        return None;
    }
    Some(stream.render())
}
