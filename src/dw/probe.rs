use crate::dw::config::Env;
use crate::dw::runner::CmdRunner;
use nix::unistd::Pid;

pub(crate) fn pidof_command(name: &str) -> String {
    format!("pidof \"{name}\"")
}

/// First pid in `pidof` output; empty or unparseable output means "not running".
pub(crate) fn first_pid(output: &str) -> Option<Pid> {
    output
        .split_whitespace()
        .next()
        .and_then(|t| t.parse::<i32>().ok())
        .filter(|p| *p > 0)
        .map(Pid::from_raw)
}

/// Look up a running process by name. A failing lookup counts as "not running".
pub async fn pid_of<R: CmdRunner + ?Sized>(runner: &R, env: &Env, name: &str) -> Option<Pid> {
    let res = runner.run_sync(&pidof_command(name), env).await;
    first_pid(&res.output)
}

pub async fn is_running<R: CmdRunner + ?Sized>(runner: &R, env: &Env, name: &str) -> bool {
    pid_of(runner, env, name).await.is_some()
}

/// Like [`pid_of`], but a lookup that cannot be executed is an error.
///
/// `pidof` exits 1 when nothing matches, so only a spawn failure is raised here.
pub async fn must_pid_of<R: CmdRunner + ?Sized>(runner: &R, env: &Env, name: &str) -> anyhow::Result<Option<Pid>> {
    let res = runner.run_sync(&pidof_command(name), env).await;
    if res.handle.is_none() {
        if let Some(e) = res.error {
            return Err(e.context(format!("process lookup for {name:?} failed")));
        }
    }
    Ok(first_pid(&res.output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dw::runner::testing::SpyRunner;
    use crate::dw::runner::ShellRunner;
    use std::time::Duration;

    #[test]
    fn parses_first_pid_only() {
        assert_eq!(first_pid("4242 17 3"), Some(Pid::from_raw(4242)));
        assert_eq!(first_pid("  99\n"), Some(Pid::from_raw(99)));
        assert_eq!(first_pid(""), None);
        assert_eq!(first_pid("pidof: not found"), None);
        assert_eq!(first_pid("0"), None);
    }

    #[tokio::test]
    async fn probes_follow_the_process_table() {
        let spy = SpyRunner::new().with_process("Xvfb");
        let env = Env::default();
        assert!(is_running(&spy, &env, "Xvfb").await);
        assert!(!is_running(&spy, &env, "x11vnc").await);
        spy.crash("Xvfb");
        assert!(pid_of(&spy, &env, "Xvfb").await.is_none());
        assert_eq!(spy.calls(), vec![
            "pidof \"Xvfb\"".to_string(),
            "pidof \"x11vnc\"".to_string(),
            "pidof \"Xvfb\"".to_string(),
        ]);
    }

    #[tokio::test]
    async fn must_probe_raises_only_when_lookup_cannot_run() {
        let spy = SpyRunner::new().failing("pidof \"wine\"");
        let env = Env::default();
        assert!(must_pid_of(&spy, &env, "wine").await.is_err());
        assert_eq!(must_pid_of(&spy, &env, "i3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn real_lookup_of_a_missing_process_is_not_running() {
        let r = ShellRunner::new(Duration::from_millis(50));
        let env = Env::new([("PATH", "/usr/bin:/bin:/usr/sbin:/sbin")]);
        assert!(!is_running(&r, &env, "no-such-process-deskwatch").await);
    }
}
