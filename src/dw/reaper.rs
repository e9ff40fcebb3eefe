//! Grace-then-kill resolution of helper processes spawned during one operation.

use crate::dw::event::dw_event;
use crate::dw::runner::ProcHandle;
use nix::errno::Errno;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::error::Elapsed;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    GraceExpired,
    WaitFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exited on its own within the grace period (or was already reaped).
    Calmed,
    Killed(KillReason),
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub pid: i32,
    pub command: String,
    pub outcome: Outcome,
    /// Time from the start of resolution until this handle was settled.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    pub resolutions: Vec<Resolution>,
}

impl ReapReport {
    pub fn calmed(&self) -> usize {
        self.resolutions.iter().filter(|r| r.outcome == Outcome::Calmed).count()
    }

    pub fn killed(&self) -> usize {
        self.resolutions.len() - self.calmed()
    }
}

/// Handles collected during one logical operation.
///
/// Shared by `&` between the protected block and the cleanup block of a
/// [`CatchGroup`](crate::dw::catch::CatchGroup); never reused across operations.
#[derive(Debug)]
pub struct DeathQueue {
    procs: Mutex<Vec<ProcHandle>>,
    grace: Duration,
}

impl Default for DeathQueue {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl DeathQueue {
    pub fn new(grace: Duration) -> Self {
        Self {
            procs: Mutex::new(Vec::new()),
            grace,
        }
    }

    pub fn add(&self, handle: Option<ProcHandle>) {
        if let Some(h) = handle {
            self.procs.lock().unwrap_or_else(|p| p.into_inner()).push(h);
        }
    }

    pub fn len(&self) -> usize {
        self.procs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every queued handle and leave the queue empty.
    ///
    /// Each handle gets its own waiter and its own grace timer; this returns once
    /// all of them are settled.
    pub async fn let_die(&self) -> ReapReport {
        let procs: Vec<ProcHandle> = {
            let mut g = self.procs.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *g)
        };
        if procs.is_empty() {
            return ReapReport::default();
        }

        let started = Instant::now();
        let mut js: JoinSet<Resolution> = JoinSet::new();
        for handle in procs {
            js.spawn(rest_or_die(handle, self.grace, started));
        }

        let mut report = ReapReport::default();
        while let Some(joined) = js.join_next().await {
            match joined {
                Ok(r) => report.resolutions.push(r),
                Err(e) => dw_event("reaper", format!("outcome=waiter_failed err={e}")),
            }
        }
        report
    }
}

/// Verdict for one waiter: exited (or already reaped elsewhere) is calm, anything else gets killed.
fn classify(waited: Result<std::io::Result<ExitStatus>, Elapsed>) -> Outcome {
    match waited {
        Ok(Ok(_)) => Outcome::Calmed,
        Ok(Err(e)) if e.raw_os_error() == Some(Errno::ECHILD as i32) => Outcome::Calmed,
        Ok(Err(_)) => Outcome::Killed(KillReason::WaitFailed),
        Err(_) => Outcome::Killed(KillReason::GraceExpired),
    }
}

async fn rest_or_die(mut handle: ProcHandle, grace: Duration, started: Instant) -> Resolution {
    let pid = handle.pid().as_raw();
    let waited = tokio::time::timeout(grace, handle.wait()).await;
    if let Ok(Err(e)) = &waited {
        dw_event("reaper", format!("pid={pid} wait_error={e}"));
    }
    let outcome = classify(waited);
    if let Outcome::Killed(_) = outcome {
        if let Err(e) = handle.kill().await {
            dw_event("reaper", format!("pid={pid} outcome=kill_failed err={e}"));
        }
    }

    let elapsed = started.elapsed();
    let note = match outcome {
        Outcome::Calmed => "outcome=calmed (exited naturally)",
        Outcome::Killed(KillReason::GraceExpired) => "outcome=killed reason=grace_expired",
        Outcome::Killed(KillReason::WaitFailed) => "outcome=killed reason=wait_failed",
    };
    dw_event(
        "reaper",
        format!(
            "pid={pid} {note} elapsed_ms={} grace_ms={} cmd={:?}",
            elapsed.as_millis(),
            grace.as_millis(),
            handle.command()
        ),
    );
    Resolution {
        pid,
        command: handle.command().to_string(),
        outcome,
        elapsed,
    }
}
