use anyhow::Context as _;
use chrono::Local;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};

const EARLY_LOG_MAX_LINES: usize = 5000;

enum SinkMsg {
    Line(String),
    Flush(oneshot::Sender<()>),
}

static LIVE_LOG_TX: OnceLock<tokio_mpsc::UnboundedSender<SinkMsg>> = OnceLock::new();
static EARLY_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

pub(crate) fn timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string()
}

/// Emit one event line: `<ts> [<component>] <msg>`.
///
/// Always goes to stderr. Once [`attach_live_log`] ran it is appended to the live log too;
/// before that, lines are kept in a bounded buffer and flushed into the file on attach.
pub fn dw_event(component: &str, msg: impl AsRef<str>) {
    let line = format!("{} [{component}] {}", timestamp(), msg.as_ref());
    eprintln!("{line}");
    if let Some(tx) = LIVE_LOG_TX.get() {
        let _ = tx.send(SinkMsg::Line(line));
        return;
    }
    let q = EARLY_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
    let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
    g.push_back(line);
    while g.len() > EARLY_LOG_MAX_LINES {
        g.pop_front();
    }
}

/// Same as [`dw_event`] with a `warn:` prefix so operators can grep for it.
pub fn dw_warn(component: &str, msg: impl AsRef<str>) {
    dw_event(component, format!("warn: {}", msg.as_ref()));
}

pub(crate) async fn open_append_log_async(path: &Path) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log file {}", path.display()))
}

/// Attach the live log file as event sink. Only the first call takes effect.
pub async fn attach_live_log(path: &Path) -> anyhow::Result<()> {
    if LIVE_LOG_TX.get().is_some() {
        return Ok(());
    }
    let mut f = open_append_log_async(path).await?;

    let (tx, mut rx) = tokio_mpsc::unbounded_channel::<SinkMsg>();
    if LIVE_LOG_TX.set(tx).is_err() {
        return Ok(());
    }

    // Nothing can land in the early buffer once the sender is set.
    let early: Vec<String> = match EARLY_LOG.get() {
        Some(q) => {
            let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
            g.drain(..).collect()
        }
        None => Vec::new(),
    };

    let path_s: PathBuf = path.to_path_buf();
    tokio::spawn(async move {
        for line in early {
            let _ = f.write_all(with_newline(line).as_bytes()).await;
        }
        let _ = f.flush().await;

        while let Some(msg) = rx.recv().await {
            match msg {
                SinkMsg::Line(line) => {
                    if let Err(e) = f.write_all(with_newline(line).as_bytes()).await {
                        eprintln!("{} [log] write failed path={} err={e}", timestamp(), path_s.display());
                    }
                }
                SinkMsg::Flush(done) => {
                    let _ = f.flush().await;
                    let _ = done.send(());
                }
            }
        }
    });

    dw_event("log", format!("live_log path={}", path.display()));
    Ok(())
}

/// Wait until every line emitted so far reached the live log (no-op without a sink).
pub async fn flush_live_log() {
    let Some(tx) = LIVE_LOG_TX.get() else { return };
    let (done_tx, done_rx) = oneshot::channel();
    if tx.send(SinkMsg::Flush(done_tx)).is_ok() {
        let _ = done_rx.await;
    }
}

fn with_newline(mut s: String) -> String {
    if !s.ends_with('\n') {
        s.push('\n');
    }
    s
}
