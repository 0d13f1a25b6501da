pub mod xray;

use log::{info, warn};
use std::{fs, path::Path, time::Duration};

use crate::host::{Host, Sig};

const POLL: Duration = Duration::from_millis(100);

/// SIGTERM, wait up to 1.5 s, then SIGKILL whatever is left.
pub fn terminate(h: &dyn Host, pids: &[u32]) {
    if pids.is_empty() {
        return;
    }
    for &pid in pids {
        h.signal(pid, Sig::Term);
    }
    for _ in 0..15 {
        if pids.iter().all(|p| !h.alive(*p)) {
            info!("stopped pids {pids:?}");
            return;
        }
        h.sleep(POLL);
    }

    for &pid in pids.iter().filter(|p| h.alive(**p)) {
        warn!("pid {pid} ignored SIGTERM, killing");
        h.signal(pid, Sig::Kill);
    }
    for _ in 0..10 {
        if pids.iter().all(|p| !h.alive(*p)) {
            return;
        }
        h.sleep(POLL);
    }
    warn!("pids still alive after SIGKILL: {:?}", pids.iter().filter(|p| h.alive(**p)).collect::<Vec<_>>());
}

/// Last `n` lines of a log file; empty when the file is missing.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(data) = fs::read(path) else { return Vec::new() };
    let text = String::from_utf8_lossy(&data);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].iter().map(|l| l.to_string()).collect()
}
