//! Remediation actions over the managed desktop stack.
//!
//! Every action runs inside a [`CatchGroup`] whose cleanup resolves the action's
//! own [`DeathQueue`]. Long-lived daemons (framebuffer, display server, window
//! manager, target) are started but never queued; only helper commands are.

use crate::dw::catch::{CatchGroup, Fault};
use crate::dw::config::{StepMode, StepSpec, WatchConfig};
use crate::dw::event::{attach_live_log, dw_event, dw_warn};
use crate::dw::maintenance::{backup_live_log, reset_live_log};
use crate::dw::probe::{is_running, must_pid_of, pid_of};
use crate::dw::reaper::DeathQueue;
use crate::dw::runner::CmdRunner;
use crate::dw::watchdog::Supervised;
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Local;
use nix::sys::signal::Signal;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    AlreadyRunning,
    Started,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::AlreadyRunning => "already running",
            Presence::Started => "started",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fledged {
    pub framebuffer: Presence,
    pub display_server: Presence,
}

pub struct Stack<R: CmdRunner> {
    runner: R,
    cfg: Arc<WatchConfig>,
}

impl<R: CmdRunner> Stack<R> {
    pub fn new(runner: R, cfg: Arc<WatchConfig>) -> Self {
        Self { runner, cfg }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn death_queue(&self) -> DeathQueue {
        DeathQueue::new(self.cfg.timings.reap_grace)
    }

    /// Run `body` as the protected block of a catch group that reaps `dq` afterwards.
    async fn guarded<T, F>(&self, op: &str, dq: &DeathQueue, body: F) -> anyhow::Result<T>
    where
        T: Send,
        F: Future<Output = Result<T, Fault>> + Send,
    {
        let mut out: Option<T> = None;
        let mut caught: Option<anyhow::Error> = None;
        CatchGroup::builder()
            .try_block(async { body.await.map(|v| out = Some(v)) })
            .catch(|e| caught = Some(e))
            .finally(async {
                let report = dq.let_die().await;
                if !report.resolutions.is_empty() {
                    dw_event(
                        "stack",
                        format!("op={op} reaped={} calmed={} killed={}", report.resolutions.len(), report.calmed(), report.killed()),
                    );
                }
            })
            .build()?
            .run()
            .await;
        match (caught, out) {
            (Some(e), _) => Err(e.context(format!("{op} failed"))),
            (None, Some(v)) => Ok(v),
            (None, None) => anyhow::bail!("{op} finished without a result"),
        }
    }

    /// Bring up the framebuffer, display server and window manager as needed.
    pub async fn fledge(&self) -> anyhow::Result<Fledged> {
        let dq = self.death_queue();
        self.guarded("fledge", &dq, self.fledge_steps(&dq)).await
    }

    async fn fledge_steps(&self, dq: &DeathQueue) -> Result<Fledged, Fault> {
        let env = &self.cfg.env;
        let names = &self.cfg.processes;
        let cmds = &self.cfg.commands;

        let framebuffer = if must_pid_of(&self.runner, env, &names.framebuffer).await?.is_some() {
            Presence::AlreadyRunning
        } else {
            dw_event("stack", format!("op=fledge process={} state=absent", names.framebuffer));
            // A window manager left over from the previous display would grab the new one.
            let stray = kill_by_name_command(&names.window_manager);
            dq.add(self.runner.run_sync(&stray, env).await.handle);
            let (_, daemon) = self.runner.must_async(&cmds.start_framebuffer, env).await?;
            drop(daemon);
            dw_event("stack", "op=fledge outcome=opened_framebuffer");
            Presence::Started
        };

        let display_server = if must_pid_of(&self.runner, env, &names.display_server).await?.is_some() {
            Presence::AlreadyRunning
        } else {
            dw_event("stack", format!("op=fledge process={} state=absent", names.display_server));
            let (_, daemon) = self.runner.must_async(&cmds.start_display_server, env).await?;
            drop(daemon);
            for helper in &cmds.display_power_off {
                let res = self.runner.run_sync(helper, env).await;
                if let Some(e) = &res.error {
                    dw_warn("stack", format!("op=fledge helper={helper:?} err={e:#}"));
                }
                dq.add(res.handle);
            }
            let (_, daemon) = self.runner.must_async(&cmds.start_window_manager, env).await?;
            drop(daemon);
            dw_event("stack", "op=fledge outcome=pulled_up_display_server");
            Presence::Started
        };

        Ok(Fledged {
            framebuffer,
            display_server,
        })
    }

    /// Launch the target until a probe sees it. Bounded only by the caller.
    pub async fn launch(&self) -> anyhow::Result<Presence> {
        let dq = self.death_queue();
        self.guarded("launch", &dq, self.launch_steps()).await
    }

    async fn launch_steps(&self) -> Result<Presence, Fault> {
        let env = &self.cfg.env;
        let target = &self.cfg.processes.target;
        if must_pid_of(&self.runner, env, target).await?.is_some() {
            dw_event("stack", format!("op=launch process={target} state=running"));
            return Ok(Presence::AlreadyRunning);
        }
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            dw_event("stack", format!("op=launch process={target} state=absent attempt={attempt}"));
            let (_, daemon) = self.runner.must_async(&self.cfg.commands.launch_target, env).await?;
            drop(daemon);
            tokio::time::sleep(self.cfg.timings.launch_settle).await;
            if must_pid_of(&self.runner, env, target).await?.is_some() {
                dw_event("stack", format!("op=launch process={target} outcome=launched attempts={attempt}"));
                return Ok(Presence::Started);
            }
        }
    }

    /// SIGTERM the target until it is gone. Returns the number of signals sent.
    pub async fn stop(&self) -> anyhow::Result<usize> {
        let dq = self.death_queue();
        let names = [self.cfg.processes.target.as_str()];
        self.guarded("stop", &dq, self.signal_until_gone("stop", &names, Signal::SIGTERM))
            .await
    }

    /// SIGKILL the display server and framebuffer until both are gone.
    pub async fn drain(&self) -> anyhow::Result<usize> {
        let dq = self.death_queue();
        let names = [
            self.cfg.processes.display_server.as_str(),
            self.cfg.processes.framebuffer.as_str(),
        ];
        self.guarded("drain", &dq, self.signal_until_gone("drain", &names, Signal::SIGKILL))
            .await
    }

    async fn signal_until_gone(&self, op: &str, names: &[&str], sig: Signal) -> Result<usize, Fault> {
        let env = &self.cfg.env;
        let mut sent = 0;
        loop {
            let mut found = Vec::new();
            for name in names {
                if let Some(pid) = pid_of(&self.runner, env, name).await {
                    found.push((*name, pid));
                }
            }
            if found.is_empty() {
                break;
            }
            for (name, pid) in found {
                dw_event("stack", format!("op={op} process={name} pid={pid} signal={sig}"));
                self.runner.signal(pid, sig)?;
                sent += 1;
            }
            tokio::time::sleep(self.cfg.timings.stop_poll).await;
        }
        dw_event("stack", format!("op={op} outcome=gone processes={names:?} signals={sent}"));
        Ok(sent)
    }

    /// Remove the target's logs, history and exports.
    pub async fn clean_up(&self) -> anyhow::Result<()> {
        let dq = self.death_queue();
        let caught: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        CatchGroup::builder()
            .try_block(self.clean_up_steps(&dq))
            .catch(|e| {
                dw_warn("stack", format!("op=clean_up problems during cleanup: {e:#}"));
                *caught.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
            })
            .finally(async {
                if caught.lock().unwrap_or_else(|p| p.into_inner()).is_none() {
                    dw_event("stack", "op=clean_up outcome=cleaned up");
                }
                dq.let_die().await;
            })
            .build()?
            .run()
            .await;
        match caught.into_inner().unwrap_or_else(|p| p.into_inner()) {
            Some(e) => Err(e.context("clean up failed")),
            None => Ok(()),
        }
    }

    async fn clean_up_steps(&self, dq: &DeathQueue) -> Result<(), Fault> {
        for cmd in &self.cfg.commands.clean_up {
            let (_, helper) = self.runner.must_sync(cmd, &self.cfg.env).await?;
            dq.add(helper);
        }
        Ok(())
    }

    pub async fn install_runtime(&self) -> anyhow::Result<usize> {
        let dq = self.death_queue();
        let steps = &self.cfg.setup.install_runtime;
        self.guarded("install_runtime", &dq, self.run_steps("install_runtime", &dq, steps))
            .await
    }

    pub async fn prepare(&self) -> anyhow::Result<usize> {
        let dq = self.death_queue();
        let steps = &self.cfg.setup.prepare;
        self.guarded("prepare", &dq, self.run_steps("prepare", &dq, steps)).await
    }

    async fn run_steps(&self, op: &str, dq: &DeathQueue, steps: &[StepSpec]) -> Result<usize, Fault> {
        let env = &self.cfg.env;
        for (i, step) in steps.iter().enumerate() {
            dw_event("stack", format!("op={op} step={}/{} mode={:?} run={:?}", i + 1, steps.len(), step.mode, step.run));
            let (_, helper) = match step.mode {
                StepMode::Sync => self.runner.must_sync(&step.run, env).await?,
                StepMode::Async => self.runner.must_async(&step.run, env).await?,
            };
            dq.add(helper);
            if !step.settle.is_zero() {
                tokio::time::sleep(step.settle).await;
            }
        }
        Ok(steps.len())
    }

    /// Start a fresh live log and route events into it.
    pub async fn enable_logging(&self) -> anyhow::Result<()> {
        let live = &self.cfg.logs.live;
        truncate_live_log(live).await?;
        attach_live_log(live).await
    }

    /// One-time container entry: logging, runtime, display, prefix, first launch.
    pub async fn enter(&self) -> anyhow::Result<()> {
        dw_event("stack", "op=enter phase=start");
        self.enable_logging().await.context("enable logging")?;
        dw_event("stack", "op=enter step=1/5 logging=enabled");
        self.install_runtime().await?;
        dw_event("stack", "op=enter step=2/5 runtime=installed");
        self.fledge().await?;
        dw_event("stack", "op=enter step=3/5 display=fledged");
        self.prepare().await?;
        dw_event("stack", "op=enter step=4/5 prefix=prepared");
        self.launch().await?;
        dw_event("stack", "op=enter step=5/5 target=launched");
        dw_event("stack", "op=enter phase=done initialization successful");
        Ok(())
    }
}

fn kill_by_name_command(name: &str) -> String {
    format!("pkill -9 -x \"{name}\"")
}

async fn truncate_live_log(live: &Path) -> anyhow::Result<()> {
    if let Some(dir) = live.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create log directory {}", dir.display()))?;
    }
    tokio::fs::File::create(live)
        .await
        .with_context(|| format!("truncate live log {}", live.display()))?;
    Ok(())
}

#[async_trait]
impl<R: CmdRunner> Supervised for Stack<R> {
    async fn target_alive(&self) -> bool {
        is_running(&self.runner, &self.cfg.env, &self.cfg.processes.target).await
    }

    async fn display_alive(&self) -> bool {
        let env = &self.cfg.env;
        is_running(&self.runner, env, &self.cfg.processes.display_server).await
            && is_running(&self.runner, env, &self.cfg.processes.framebuffer).await
    }

    async fn restart_target(&self) -> anyhow::Result<()> {
        dw_event("stack", "force stop before relaunch");
        self.stop().await?;
        self.launch().await.map(|_| ())
    }

    async fn refledge(&self) -> anyhow::Result<()> {
        dw_event("stack", "force drain before re-fledge");
        self.drain().await?;
        self.fledge().await.map(|_| ())
    }

    async fn daily_cleanup(&self) -> anyhow::Result<()> {
        self.clean_up().await
    }

    async fn backup_log(&self) -> anyhow::Result<PathBuf> {
        backup_live_log(&self.cfg.logs.live, Local::now()).await
    }

    async fn reset_log(&self, backup: &Path) -> anyhow::Result<()> {
        reset_live_log(&self.cfg.logs.live, backup).await
    }
}
