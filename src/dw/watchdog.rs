//! The steady-state supervision loop.
//!
//! One tick at a time: maintenance first, then a health pass that probes the
//! target before the display stack and remediates within a per-domain
//! [`RetryBudget`]. The loop only returns once a budget is exhausted.

use crate::dw::config::WatchdogSettings;
use crate::dw::event::{dw_event, dw_warn};
use crate::dw::maintenance::MaintenanceTicks;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Target,
    Display,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Target => f.write_str("target"),
            Domain::Display => f.write_str("display"),
        }
    }
}

/// Consecutive remediations allowed for one failure domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    used: u32,
    cap: u32,
}

impl RetryBudget {
    pub fn new(cap: u32) -> Self {
        Self { used: 0, cap }
    }

    /// Record one failure. Returns false once `cap` remediations were already spent.
    pub fn try_spend(&mut self) -> bool {
        if self.used >= self.cap {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    pub domain: Domain,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry budget for the {} domain is exhausted; supervision gives up", self.domain)
    }
}

/// What the watchdog needs from the managed stack.
#[async_trait]
pub trait Supervised: Send + Sync {
    async fn target_alive(&self) -> bool;

    /// Display server and framebuffer both present.
    async fn display_alive(&self) -> bool;

    /// Force stop, then relaunch.
    async fn restart_target(&self) -> anyhow::Result<()>;

    /// Force drain, then bring the display stack back up.
    async fn refledge(&self) -> anyhow::Result<()>;

    async fn daily_cleanup(&self) -> anyhow::Result<()>;

    /// Copy the live log into its backup; returns the backup path.
    async fn backup_log(&self) -> anyhow::Result<PathBuf>;

    async fn reset_log(&self, backup: &Path) -> anyhow::Result<()>;
}

struct Budgets {
    target: RetryBudget,
    display: RetryBudget,
}

impl Budgets {
    fn get_mut(&mut self, domain: Domain) -> &mut RetryBudget {
        match domain {
            Domain::Target => &mut self.target,
            Domain::Display => &mut self.display,
        }
    }

    fn any_spent(&self) -> bool {
        self.target.used() > 0 || self.display.used() > 0
    }

    fn reset(&mut self) {
        self.target.reset();
        self.display.reset();
    }
}

/// Supervise until a retry budget runs out.
pub async fn watch<S: Supervised + ?Sized>(sup: &S, settings: &WatchdogSettings, tick: Duration) -> Exhausted {
    let mut ticks = MaintenanceTicks::from_settings(settings);
    let mut budgets = Budgets {
        target: RetryBudget::new(settings.retry_cap),
        display: RetryBudget::new(settings.retry_cap),
    };
    dw_event(
        "watchdog",
        format!(
            "state=watching tick_ms={} retry_cap={} daily_ticks={} weekly_ticks={}",
            tick.as_millis(),
            settings.retry_cap,
            settings.daily_ticks,
            settings.weekly_ticks
        ),
    );

    loop {
        tokio::time::sleep(tick).await;

        let due = ticks.advance();
        if due.daily {
            dw_event("watchdog", "maintenance=daily action=clean_up");
            if let Err(e) = sup.daily_cleanup().await {
                dw_warn("watchdog", format!("could not clean up: {e:#}"));
            }
        }
        if due.weekly {
            archive_log(sup, settings.backup_retries).await;
        }

        if let Some(domain) = health_pass(sup, &mut budgets).await {
            let out = Exhausted { domain };
            dw_warn("watchdog", format!("state=gave_up domain={domain} {out}"));
            return out;
        }
    }
}

async fn archive_log<S: Supervised + ?Sized>(sup: &S, retries: u32) {
    let attempts = retries.saturating_add(1);
    for attempt in 1..=attempts {
        match sup.backup_log().await {
            Ok(backup) => {
                match sup.reset_log(&backup).await {
                    Ok(()) => dw_event(
                        "watchdog",
                        format!("maintenance=weekly outcome=archived backup={}", backup.display()),
                    ),
                    Err(e) => dw_warn("watchdog", format!("log archived but not reset: {e:#}")),
                }
                return;
            }
            Err(e) => dw_warn(
                "watchdog",
                format!("maintenance=weekly attempt={attempt}/{attempts} outcome=backup_failed err={e:#}"),
            ),
        }
    }
    dw_warn("watchdog", "critical: could not backup logs");
}

/// Probe, remediate within budget, and probe again until everything is up.
/// Returns the domain whose budget ran out, if any.
async fn health_pass<S: Supervised + ?Sized>(sup: &S, budgets: &mut Budgets) -> Option<Domain> {
    loop {
        let failed = if !sup.target_alive().await {
            Domain::Target
        } else if !sup.display_alive().await {
            Domain::Display
        } else {
            break;
        };

        let budget = budgets.get_mut(failed);
        if !budget.try_spend() {
            return Some(failed);
        }
        let (used, cap) = (budget.used(), budget.cap());
        let res = match failed {
            Domain::Target => {
                dw_event("watchdog", format!("domain=target attempt={used}/{cap} action=stop_and_relaunch"));
                sup.restart_target().await
            }
            Domain::Display => {
                dw_event("watchdog", format!("domain=display attempt={used}/{cap} action=drain_and_refledge"));
                sup.refledge().await
            }
        };
        if let Err(e) = res {
            dw_warn("watchdog", format!("domain={failed} remediation failed: {e:#}"));
        }
    }

    if budgets.any_spent() {
        budgets.reset();
        dw_event("watchdog", "state=recovered All set. Watching...");
    }
    None
}
