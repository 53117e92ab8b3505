//! Start-of-observation snapshots and process memory sampling.

use std::time::{Duration, Instant};

/// Taken when an observation starts; consumed when it ends.
#[derive(Debug, Clone, Copy)]
pub struct StartSnapshot {
    started: Instant,
    memory: Option<u64>,
}

impl StartSnapshot {
    pub fn now() -> Self {
        Self { started: Instant::now(), memory: resident_memory_bytes() }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Resident memory growth since the snapshot, in bytes. Zero when the
    /// platform does not report memory.
    pub fn memory_delta(&self) -> i64 {
        match (self.memory, resident_memory_bytes()) {
            (Some(before), Some(after)) => after as i64 - before as i64,
            _ => 0,
        }
    }

    pub fn start_memory(&self) -> Option<u64> {
        self.memory
    }
}

/// Resident set size of this process, from `/proc/self/statm`.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/self/statm").ok()?;
    // Second field is RSS in pages
    let pages = content.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(pages * 4096)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}

/// Peak resident set size of this process (`VmHWM`).
#[cfg(target_os = "linux")]
pub fn peak_memory_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = content.lines().find(|l| l.starts_with("VmHWM:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
pub fn peak_memory_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_elapsed_grows() {
        let snapshot = StartSnapshot::now();
        thread::sleep(Duration::from_millis(10));
        assert!(snapshot.elapsed() >= Duration::from_millis(10));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_is_reported_on_linux() {
        assert!(resident_memory_bytes().unwrap_or(0) > 0);
    }
}
