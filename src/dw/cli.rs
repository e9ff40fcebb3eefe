use crate::dw::config::{self, WatchConfig};
use crate::dw::runner::ShellRunner;
use crate::dw::stack::Stack;
use crate::dw::watchdog;
use clap::{Parser, Subcommand};
use nix::unistd::geteuid;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "deskwatch", version, about = "headless desktop watchdog")]
pub struct Args {
    /// Path to config YAML
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Cmd {
    /// Prepare the application runtime (prefix, fonts, target installer)
    Prepare,
    /// Bring up framebuffer, display server and window manager
    Fledge,
    /// Launch the target application if it is not running
    Launch,
    /// Stop the target application (SIGTERM)
    Stop,
    /// Shut down display server and framebuffer (SIGKILL)
    Drain,
    /// Remove the target's logs, history and exports
    CleanUp,
    /// Run the full startup routine, then watch until supervision gives up
    Enter,
}

impl Cmd {
    pub fn name(&self) -> &'static str {
        match self {
            Cmd::Prepare => "prepare",
            Cmd::Fledge => "fledge",
            Cmd::Launch => "launch",
            Cmd::Stop => "stop",
            Cmd::Drain => "drain",
            Cmd::CleanUp => "clean-up",
            Cmd::Enter => "enter",
        }
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    if !geteuid().is_root() {
        anyhow::bail!("'{}' needs to be executed as root", args.cmd.name());
    }
    let cfg = config::load_config(&args.config)?;
    run_with(args.cmd, cfg).await
}

async fn run_with(cmd: Cmd, cfg: WatchConfig) -> anyhow::Result<()> {
    let cfg = Arc::new(cfg);
    let stack = Stack::new(ShellRunner::new(cfg.timings.async_settle), Arc::clone(&cfg));
    match cmd {
        Cmd::Prepare => {
            let steps = stack.prepare().await?;
            println!("Preparation: OK ({steps} steps)");
        }
        Cmd::Fledge => {
            let f = stack.fledge().await?;
            println!("Framebuffer: OK ({})", f.framebuffer.as_str());
            println!("Display server: OK ({})", f.display_server.as_str());
        }
        Cmd::Launch => {
            let p = stack.launch().await?;
            println!("Target process: OK ({})", p.as_str());
        }
        Cmd::Stop => {
            let n = stack.stop().await?;
            println!("Stopped target process(es) ({n} signals)");
        }
        Cmd::Drain => {
            let n = stack.drain().await?;
            println!("Drained display server ({n} signals)");
        }
        Cmd::CleanUp => {
            stack.clean_up().await?;
            println!("Cleanup: OK");
        }
        Cmd::Enter => {
            stack.enter().await?;
            println!("All set. Watching...");
            let out = watchdog::watch(&stack, &cfg.watchdog, cfg.timings.tick).await;
            anyhow::bail!("{out}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_parse_with_default_config() {
        let a = Args::try_parse_from(["deskwatch", "clean-up"]).unwrap();
        assert_eq!(a.cmd, Cmd::CleanUp);
        assert_eq!(a.config, PathBuf::from("config.yaml"));

        let a = Args::try_parse_from(["deskwatch", "-c", "/etc/deskwatch.yaml", "enter"]).unwrap();
        assert_eq!(a.cmd, Cmd::Enter);
        assert_eq!(a.config, PathBuf::from("/etc/deskwatch.yaml"));
    }

    #[test]
    fn exactly_one_verb_is_required() {
        assert!(Args::try_parse_from(["deskwatch"]).is_err());
        assert!(Args::try_parse_from(["deskwatch", "stop", "drain"]).is_err());
        assert!(Args::try_parse_from(["deskwatch", "reboot"]).is_err());
    }

    #[test]
    fn verb_names_match_the_command_line() {
        for verb in ["prepare", "fledge", "launch", "stop", "drain", "clean-up", "enter"] {
            let a = Args::try_parse_from(["deskwatch", verb]).unwrap();
            assert_eq!(a.cmd.name(), verb);
        }
    }
}
