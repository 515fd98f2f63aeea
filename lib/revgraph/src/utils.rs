use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static RUN_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Identifier unique to one pipeline run of this process, used to name per-run artifacts.
pub fn local_run_id() -> String {
    let pid = std::process::id();
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    if seq == 0 { format!("local-{}-{}", pid, ts) } else { format!("local-{}-{}-{}", pid, ts, seq) }
}

pub fn env_var_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        }
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
pub fn fd_soft_limit() -> Option<u64> {
    use libc::{getrlimit, rlimit, RLIMIT_NOFILE};
    let mut lim = rlimit { rlim_cur: 0, rlim_max: 0 };
    let rc = unsafe { getrlimit(RLIMIT_NOFILE, &mut lim as *mut rlimit) };
    if rc == 0 { Some(lim.rlim_cur as u64) } else { None }
}

#[cfg(not(target_os = "linux"))]
pub fn fd_soft_limit() -> Option<u64> { None }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_carry_pid_and_never_repeat() {
        let a = local_run_id();
        let b = local_run_id();
        assert!(a.starts_with(&format!("local-{}-", std::process::id())));
        assert_ne!(a, b);
    }
}
