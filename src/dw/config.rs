use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Variables handed to every spawned command (the spawned environment is cleared first).
///
/// Loaded once at startup and never mutated afterwards; callers pass `&Env` around.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env {
    vars: Vec<(String, String)>,
}

impl Env {
    pub fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env = Env::default();
        for (k, v) in vars {
            env.set(k, v);
        }
        env
    }

    fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub env: Env,
    pub logs: LogPaths,
    pub processes: ProcessNames,
    pub commands: Commands,
    pub setup: SetupSteps,
    pub timings: Timings,
    pub watchdog: WatchdogSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub directory: PathBuf,
    /// Full path of the live log (`directory` joined with the configured file name).
    pub live: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProcessNames {
    #[serde(default = "default_framebuffer")]
    pub framebuffer: String,
    #[serde(default = "default_display_server")]
    pub display_server: String,
    #[serde(default = "default_window_manager")]
    pub window_manager: String,
    #[serde(default = "default_target")]
    pub target: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Commands {
    #[serde(default = "default_start_framebuffer")]
    pub start_framebuffer: String,
    #[serde(default = "default_start_display_server")]
    pub start_display_server: String,
    #[serde(default = "default_display_power_off")]
    pub display_power_off: Vec<String>,
    #[serde(default = "default_start_window_manager")]
    pub start_window_manager: String,
    #[serde(default = "default_launch_target")]
    pub launch_target: String,
    #[serde(default = "default_clean_up")]
    pub clean_up: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// Wait for the command to finish.
    #[default]
    Sync,
    /// Start it and continue after the runner's settle delay.
    Async,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub run: String,
    #[serde(default)]
    pub mode: StepMode,
    /// Extra pause after the step (installers keep working after their launcher returns).
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub settle: Duration,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SetupSteps {
    #[serde(default)]
    pub install_runtime: Vec<StepSpec>,
    #[serde(default)]
    pub prepare: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Timings {
    #[serde(default = "default_tick", deserialize_with = "deserialize_duration")]
    pub tick: Duration,
    #[serde(default = "default_reap_grace", deserialize_with = "deserialize_duration")]
    pub reap_grace: Duration,
    #[serde(default = "default_launch_settle", deserialize_with = "deserialize_duration")]
    pub launch_settle: Duration,
    #[serde(default = "default_async_settle", deserialize_with = "deserialize_duration")]
    pub async_settle: Duration,
    #[serde(default = "default_stop_poll", deserialize_with = "deserialize_duration")]
    pub stop_poll: Duration,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WatchdogSettings {
    /// Consecutive remediations allowed per failure domain before supervision gives up.
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
    #[serde(default = "default_daily_ticks")]
    pub daily_ticks: u32,
    #[serde(default = "default_weekly_ticks")]
    pub weekly_ticks: u32,
    /// Immediate retries of the weekly log backup after the first failed attempt.
    #[serde(default = "default_backup_retries")]
    pub backup_retries: u32,
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WatchConfigFile {
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    logs: Option<LogPathsFile>,
    #[serde(default)]
    processes: Option<ProcessNames>,
    #[serde(default)]
    commands: Option<Commands>,
    #[serde(default)]
    setup: Option<SetupSteps>,
    #[serde(default)]
    timings: Option<Timings>,
    #[serde(default)]
    watchdog: Option<WatchdogSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogPathsFile {
    #[serde(default = "default_log_directory")]
    directory: PathBuf,
    #[serde(default = "default_live_log")]
    live: String,
}

fn default_log_directory() -> PathBuf {
    "/var/log/deskwatch".into()
}
fn default_live_log() -> String {
    "deskwatch.log".to_string()
}
fn default_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("USER", "root"),
        ("THIRD_PARTY", "/opt/third-party"),
        ("WINEPREFIX", "/opt/.wineprefix"),
        ("WINEDEBUG", "-all"),
        ("DISPLAY", ":1"),
        ("SCREEN_NUM", "0"),
        ("SCREEN_WHD", "1366x768x16"),
        ("PATH", "/usr/local/bin:/usr/bin:/usr/local/sbin:/usr/sbin:/bin:/sbin"),
    ]
}
fn default_framebuffer() -> String {
    "Xvfb".to_string()
}
fn default_display_server() -> String {
    "x11vnc".to_string()
}
fn default_window_manager() -> String {
    "i3".to_string()
}
fn default_target() -> String {
    "terminal64.exe".to_string()
}
fn default_start_framebuffer() -> String {
    "Xvfb $DISPLAY -screen $SCREEN_NUM $SCREEN_WHD +extension DPMS +extension GLX +extension RANDR +extension RENDER > $DW_LOGS/xvfb.log 2>&1".to_string()
}
fn default_start_display_server() -> String {
    "x11vnc -display $DISPLAY -bg -forever -nopw -quiet -rfbport 5900 -xkb -o $DW_LOGS/x11vnc.log".to_string()
}
fn default_display_power_off() -> Vec<String> {
    vec![
        "xset -dpms".to_string(),
        "xset s noblank".to_string(),
        "xset s off".to_string(),
    ]
}
fn default_start_window_manager() -> String {
    "i3 > $DW_LOGS/i3.log 2>&1".to_string()
}
fn default_launch_target() -> String {
    "wine \"$WINEPREFIX/dosdevices/c:/Program Files/MetaTrader 5/terminal64.exe\" /portable > $DW_LOGS/target.log 2>&1".to_string()
}
fn default_clean_up() -> Vec<String> {
    vec![
        "rm -rf \"$WINEPREFIX/dosdevices/c:/Program Files/MetaTrader 5/logs/\"*".to_string(),
        "rm -rf \"$WINEPREFIX/dosdevices/c:/Program Files/MetaTrader 5/history/\"*".to_string(),
        "rm -rf \"$WINEPREFIX/dosdevices/c:/Program Files/MetaTrader 5/\"*.csv".to_string(),
    ]
}
fn default_tick() -> Duration {
    Duration::from_secs(60)
}
fn default_reap_grace() -> Duration {
    Duration::from_secs(45)
}
fn default_launch_settle() -> Duration {
    Duration::from_secs(30)
}
fn default_async_settle() -> Duration {
    Duration::from_secs(2)
}
fn default_stop_poll() -> Duration {
    Duration::from_millis(500)
}
fn default_retry_cap() -> u32 {
    3
}
fn default_daily_ticks() -> u32 {
    24 * 60
}
fn default_weekly_ticks() -> u32 {
    7 * 24 * 60
}
fn default_backup_retries() -> u32 {
    3
}

impl Default for ProcessNames {
    fn default() -> Self {
        Self {
            framebuffer: default_framebuffer(),
            display_server: default_display_server(),
            window_manager: default_window_manager(),
            target: default_target(),
        }
    }
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            start_framebuffer: default_start_framebuffer(),
            start_display_server: default_start_display_server(),
            display_power_off: default_display_power_off(),
            start_window_manager: default_start_window_manager(),
            launch_target: default_launch_target(),
            clean_up: default_clean_up(),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            reap_grace: default_reap_grace(),
            launch_settle: default_launch_settle(),
            async_settle: default_async_settle(),
            stop_poll: default_stop_poll(),
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            retry_cap: default_retry_cap(),
            daily_ticks: default_daily_ticks(),
            weekly_ticks: default_weekly_ticks(),
            backup_retries: default_backup_retries(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        let directory = default_log_directory();
        Self {
            env: with_log_dir(Env::new(default_env()), &directory),
            logs: LogPaths {
                live: directory.join(default_live_log()),
                directory,
            },
            processes: ProcessNames::default(),
            commands: Commands::default(),
            setup: SetupSteps::default(),
            timings: Timings::default(),
            watchdog: WatchdogSettings::default(),
        }
    }
}

/// Commands reference the log directory as `$DW_LOGS`.
fn with_log_dir(mut env: Env, dir: &Path) -> Env {
    env.set("DW_LOGS", dir.display().to_string());
    env
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(Duration::from_millis)
            .ok_or_else(|| D::Error::custom("duration must be a non-negative integer (ms)")),
        serde_yaml::Value::String(s) => parse_duration_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be integer milliseconds or a string like \"45s\"",
        )),
    }
}

/// Parse `1500ms`, `45s`, `1m`, `2h` or `1d` (a single unit, fractional values allowed).
pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse().map_err(|e| format!("invalid duration number: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        "" => return Err(format!("duration {s:?} needs a unit (ms/s/m/h/d) or use an integer for ms")),
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h/d)")),
    };
    Ok(Duration::from_millis((num * mult).round() as u64))
}

pub fn load_config(config_path: &Path) -> anyhow::Result<WatchConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&raw, base)
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", config_path.display()))
}

/// Parse YAML text; relative paths resolve against `base`.
pub fn parse_config(raw: &str, base: &Path) -> anyhow::Result<WatchConfig> {
    let file_cfg: WatchConfigFile = if raw.trim().is_empty() {
        WatchConfigFile::default()
    } else {
        serde_yaml::from_str(raw)?
    };

    let (mut directory, live_name) = match file_cfg.logs {
        Some(l) => (l.directory, l.live),
        None => (default_log_directory(), default_live_log()),
    };
    if directory.is_relative() {
        directory = base.join(directory);
    }
    anyhow::ensure!(!live_name.trim().is_empty(), "logs.live must not be empty");
    anyhow::ensure!(
        Path::new(&live_name).file_name().map(|n| n == live_name.as_str()).unwrap_or(false),
        "logs.live must be a plain file name, got {live_name:?}"
    );

    let mut env = Env::new(default_env());
    if let Some(vars) = file_cfg.env {
        for (k, v) in vars {
            anyhow::ensure!(
                !k.is_empty() && !k.contains('=') && !k.contains('\0'),
                "invalid env variable name {k:?}"
            );
            env.set(k, v);
        }
    }
    let env = with_log_dir(env, &directory);

    let cfg = WatchConfig {
        env,
        logs: LogPaths {
            live: directory.join(live_name),
            directory,
        },
        processes: file_cfg.processes.unwrap_or_default(),
        commands: file_cfg.commands.unwrap_or_default(),
        setup: file_cfg.setup.unwrap_or_default(),
        timings: file_cfg.timings.unwrap_or_default(),
        watchdog: file_cfg.watchdog.unwrap_or_default(),
    };
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &WatchConfig) -> anyhow::Result<()> {
    let p = &cfg.processes;
    for (field, name) in [
        ("framebuffer", &p.framebuffer),
        ("display_server", &p.display_server),
        ("window_manager", &p.window_manager),
        ("target", &p.target),
    ] {
        anyhow::ensure!(!name.trim().is_empty(), "processes.{field} must not be empty");
        anyhow::ensure!(!name.contains('"'), "processes.{field} must not contain quotes: {name:?}");
    }
    anyhow::ensure!(!cfg.timings.tick.is_zero(), "timings.tick must be > 0");
    anyhow::ensure!(cfg.watchdog.daily_ticks > 0, "watchdog.daily_ticks must be > 0");
    anyhow::ensure!(cfg.watchdog.weekly_ticks > 0, "watchdog.weekly_ticks must be > 0");
    for (i, step) in cfg.setup.install_runtime.iter().chain(cfg.setup.prepare.iter()).enumerate() {
        anyhow::ensure!(!step.run.trim().is_empty(), "setup step #{i} has an empty run command");
    }
    Ok(())
}
