// neura-core/src/ports/process.rs

// Subprocess supervision contract. Every spawned child (browser,
// rasterizer, converter) registers its PID against the job running on the
// current task, so forced cancellation can terminate the tree.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

tokio::task_local! {
    /// The job a worker task is currently executing.
    pub static CURRENT_JOB_ID: String;
}

#[derive(Default)]
pub struct ProcessTracker {
    pids: Mutex<HashMap<String, HashSet<u32>>>,
}

impl ProcessTracker {
    /// Register a child PID against the job running on this task, if any.
    pub fn track_for_current_job(&self, pid: u32) {
        let Ok(job_id) = CURRENT_JOB_ID.try_with(|id| id.clone()) else {
            return;
        };
        #[allow(clippy::unwrap_used)]
        self.pids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(job_id)
            .or_default()
            .insert(pid);
    }

    pub fn untrack(&self, pid: u32) {
        #[allow(clippy::unwrap_used)]
        let mut pids = self.pids.lock().unwrap_or_else(|p| p.into_inner());
        for set in pids.values_mut() {
            set.remove(&pid);
        }
    }

    /// Terminate every tracked child of a job.
    pub fn kill_job(&self, job_id: &str) {
        #[allow(clippy::unwrap_used)]
        let pids: Vec<u32> = self
            .pids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for pid in pids {
            terminate_pid(pid);
        }
    }

    pub fn clear(&self, job_id: &str) {
        #[allow(clippy::unwrap_used)]
        self.pids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(job_id);
    }

    pub fn tracked(&self, job_id: &str) -> Vec<u32> {
        #[allow(clippy::unwrap_used)]
        let pids = self.pids.lock().unwrap_or_else(|p| p.into_inner());
        pids.get(job_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    let _ = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status();
}

#[cfg(not(unix))]
fn terminate_pid(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status();
}
