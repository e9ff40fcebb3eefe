use crate::dw::config::Env;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// A spawned shell command. Owned by whoever spawned it until handed to a
/// [`DeathQueue`](crate::dw::reaper::DeathQueue).
#[derive(Debug)]
pub struct ProcHandle {
    pid: Pid,
    command: String,
    child: Child,
    status: Option<ExitStatus>,
}

impl ProcHandle {
    fn new(pid: Pid, command: &str, child: Child) -> Self {
        Self {
            pid,
            command: command.to_string(),
            child,
            status: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit status, once observed.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Wait for exit. Returns the cached status if it was already observed.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(st) = self.status {
            return Ok(st);
        }
        let st = self.child.wait().await?;
        self.status = Some(st);
        Ok(st)
    }

    /// SIGKILL the whole process group (every command gets its own), then reap the child.
    pub async fn kill(&mut self) -> anyhow::Result<()> {
        match killpg(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => anyhow::bail!("killpg pgid={} failed: {e}", self.pid),
        }
        // The leader may have left the group (setsid); hit it directly too.
        let _ = self.child.start_kill();
        let st = self.child.wait().await?;
        self.status = Some(st);
        Ok(())
    }
}

/// What a command execution produced: captured output (trimmed), the process
/// handle (if it could be spawned) and the error (if any).
#[derive(Debug, Default)]
pub struct CmdResult {
    pub output: String,
    pub handle: Option<ProcHandle>,
    pub error: Option<anyhow::Error>,
}

impl CmdResult {
    pub fn ok(output: impl Into<String>, handle: Option<ProcHandle>) -> Self {
        Self {
            output: output.into(),
            handle,
            error: None,
        }
    }

    pub fn failed(output: impl Into<String>, handle: Option<ProcHandle>, error: anyhow::Error) -> Self {
        Self {
            output: output.into(),
            handle,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> anyhow::Result<(String, Option<ProcHandle>)> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.output, self.handle)),
        }
    }
}

/// Executes shell command lines.
///
/// The `must_*` variants turn a failed execution into an `Err`, for use inside
/// [`CatchGroup`](crate::dw::catch::CatchGroup) protected blocks.
#[async_trait]
pub trait CmdRunner: Send + Sync {
    /// Run to completion and capture stdout.
    async fn run_sync(&self, cmd_line: &str, env: &Env) -> CmdResult;

    /// Start, wait a short settle delay, and return whatever stdout was produced so far.
    async fn run_async(&self, cmd_line: &str, env: &Env) -> CmdResult;

    /// Deliver `sig` to a single process. A pid that is already gone is not an error.
    fn signal(&self, pid: Pid, sig: Signal) -> anyhow::Result<()>;

    async fn must_sync(&self, cmd_line: &str, env: &Env) -> anyhow::Result<(String, Option<ProcHandle>)> {
        self.run_sync(cmd_line, env).await.into_result()
    }

    async fn must_async(&self, cmd_line: &str, env: &Env) -> anyhow::Result<(String, Option<ProcHandle>)> {
        self.run_async(cmd_line, env).await.into_result()
    }
}

/// Runs commands through `sh -c` in their own process group, with a cleared
/// environment replaced by the configured [`Env`].
#[derive(Debug, Clone)]
pub struct ShellRunner {
    async_settle: Duration,
}

impl ShellRunner {
    pub fn new(async_settle: Duration) -> Self {
        Self { async_settle }
    }

    fn command(cmd_line: &str, env: &Env) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(cmd_line)
            .env_clear()
            .envs(env.iter())
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    fn spawn(cmd_line: &str, env: &Env) -> anyhow::Result<(Pid, Child)> {
        let child = Self::command(cmd_line, env)
            .spawn()
            .map_err(|e| anyhow::anyhow!("starting command \"{cmd_line}\" not successful: {e}"))?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| anyhow::anyhow!("command \"{cmd_line}\" exited before its pid was known"))?;
        Ok((pid, child))
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl CmdRunner for ShellRunner {
    async fn run_sync(&self, cmd_line: &str, env: &Env) -> CmdResult {
        let (pid, mut child) = match Self::spawn(cmd_line, env) {
            Ok(v) => v,
            Err(e) => return CmdResult::failed(cmd_line, None, e),
        };
        let mut stdout = child.stdout.take();
        let mut buf = Vec::new();
        let read = async {
            if let Some(s) = stdout.as_mut() {
                s.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (read_res, wait_res) = tokio::join!(read, child.wait());
        let mut handle = ProcHandle::new(pid, cmd_line, child);
        let output = String::from_utf8_lossy(&buf).trim().to_string();

        let status = match wait_res {
            Ok(st) => st,
            Err(e) => {
                let err = anyhow::anyhow!("running command \"{cmd_line}\" not successful: {e}");
                return CmdResult::failed(output, Some(handle), err);
            }
        };
        handle.status = Some(status);
        if let Err(e) = read_res {
            let err = anyhow::anyhow!("reading output of \"{cmd_line}\" failed: {e}");
            return CmdResult::failed(output, Some(handle), err);
        }
        if !status.success() {
            let err = anyhow::anyhow!("running command \"{cmd_line}\" not successful: {status}");
            return CmdResult::failed(output, Some(handle), err);
        }
        CmdResult::ok(output, Some(handle))
    }

    async fn run_async(&self, cmd_line: &str, env: &Env) -> CmdResult {
        let (pid, mut child) = match Self::spawn(cmd_line, env) {
            Ok(v) => v,
            Err(e) => return CmdResult::failed(cmd_line, None, e),
        };
        let captured: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        if let Some(mut stdout) = child.stdout.take() {
            let sink = Arc::clone(&captured);
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stdout.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .extend_from_slice(&chunk[..n]),
                    }
                }
            });
        }
        tokio::time::sleep(self.async_settle).await;
        let output = {
            let g = captured.lock().unwrap_or_else(|p| p.into_inner());
            String::from_utf8_lossy(&g).trim().to_string()
        };
        CmdResult::ok(output, Some(ProcHandle::new(pid, cmd_line, child)))
    }

    fn signal(&self, pid: Pid, sig: Signal) -> anyhow::Result<()> {
        match kill(pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => anyhow::bail!("kill pid={pid} sig={sig} failed: {e}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{BTreeMap, HashMap, HashSet};

    /// In-memory stand-in for the host: a fake process table driven by `pidof`,
    /// launch commands and signals. Records every call.
    #[derive(Debug, Default)]
    pub(crate) struct SpyRunner {
        state: Mutex<SpyState>,
    }

    #[derive(Debug, Default)]
    struct SpyState {
        calls: Vec<String>,
        signals: Vec<(i32, Signal)>,
        table: BTreeMap<String, Vec<i32>>,
        spawns: HashMap<String, String>,
        failing: HashSet<String>,
        misses: HashMap<String, u32>,
        ignore_term: HashMap<String, u32>,
        next_pid: i32,
    }

    impl SpyRunner {
        pub(crate) fn new() -> Self {
            let spy = Self::default();
            spy.lock().next_pid = 1000;
            spy
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, SpyState> {
            self.state.lock().unwrap_or_else(|p| p.into_inner())
        }

        /// A process named `name` is running.
        pub(crate) fn with_process(self, name: &str) -> Self {
            self.start(name);
            self
        }

        /// Running `cmd` brings up a process named `name`.
        pub(crate) fn spawning(self, cmd: &str, name: &str) -> Self {
            self.lock().spawns.insert(cmd.to_string(), name.to_string());
            self
        }

        /// The first `times` runs of `cmd` succeed without bringing anything up.
        pub(crate) fn flaky(self, cmd: &str, times: u32) -> Self {
            self.lock().misses.insert(cmd.to_string(), times);
            self
        }

        /// Running `cmd` fails.
        pub(crate) fn failing(self, cmd: &str) -> Self {
            self.lock().failing.insert(cmd.to_string());
            self
        }

        /// Processes named `name` survive the first `times` SIGTERMs.
        pub(crate) fn ignoring_term(self, name: &str, times: u32) -> Self {
            self.lock().ignore_term.insert(name.to_string(), times);
            self
        }

        pub(crate) fn start(&self, name: &str) -> i32 {
            let mut st = self.lock();
            st.next_pid += 1;
            let pid = st.next_pid;
            st.table.entry(name.to_string()).or_default().push(pid);
            pid
        }

        pub(crate) fn crash(&self, name: &str) {
            self.lock().table.remove(name);
        }

        pub(crate) fn is_up(&self, name: &str) -> bool {
            self.lock().table.get(name).map(|p| !p.is_empty()).unwrap_or(false)
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.lock().calls.clone()
        }

        pub(crate) fn count(&self, cmd: &str) -> usize {
            self.lock().calls.iter().filter(|c| c.as_str() == cmd).count()
        }

        pub(crate) fn signals(&self) -> Vec<(i32, Signal)> {
            self.lock().signals.clone()
        }

        fn respond(&self, cmd_line: &str) -> CmdResult {
            let mut st = self.lock();
            st.calls.push(cmd_line.to_string());
            if st.failing.contains(cmd_line) {
                return CmdResult::failed(cmd_line, None, anyhow::anyhow!("running command \"{cmd_line}\" not successful"));
            }
            if let Some(name) = cmd_line.strip_prefix("pidof \"").and_then(|s| s.strip_suffix('"')) {
                let out = st
                    .table
                    .get(name)
                    .and_then(|p| p.first())
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                return CmdResult::ok(out, None);
            }
            if let Some(left) = st.misses.get_mut(cmd_line) {
                if *left > 0 {
                    *left -= 1;
                    return CmdResult::ok("", None);
                }
            }
            if let Some(name) = st.spawns.get(cmd_line).cloned() {
                st.next_pid += 1;
                let pid = st.next_pid;
                st.table.entry(name).or_default().push(pid);
            }
            CmdResult::ok("", None)
        }
    }

    #[async_trait]
    impl CmdRunner for SpyRunner {
        async fn run_sync(&self, cmd_line: &str, _env: &Env) -> CmdResult {
            self.respond(cmd_line)
        }

        async fn run_async(&self, cmd_line: &str, _env: &Env) -> CmdResult {
            self.respond(cmd_line)
        }

        fn signal(&self, pid: Pid, sig: Signal) -> anyhow::Result<()> {
            let mut st = self.lock();
            st.signals.push((pid.as_raw(), sig));
            let owner = st
                .table
                .iter()
                .find(|(_, pids)| pids.contains(&pid.as_raw()))
                .map(|(name, _)| name.clone());
            let Some(owner) = owner else { return Ok(()) };
            if sig == Signal::SIGTERM {
                if let Some(left) = st.ignore_term.get_mut(&owner) {
                    if *left > 0 {
                        *left -= 1;
                        return Ok(());
                    }
                }
            }
            if let Some(pids) = st.table.get_mut(&owner) {
                pids.retain(|p| *p != pid.as_raw());
            }
            st.table.retain(|_, pids| !pids.is_empty());
            Ok(())
        }
    }
}
