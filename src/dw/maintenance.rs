//! Tick-counted daily/weekly maintenance and live-log archiving.

use crate::dw::config::WatchdogSettings;
use crate::dw::event::{flush_live_log, open_append_log_async};
use anyhow::Context as _;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Which maintenance jobs are due on this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due {
    pub daily: bool,
    pub weekly: bool,
}

/// Two counters advanced once per watchdog tick, each wrapping to zero when it
/// reaches its threshold.
#[derive(Debug, Clone)]
pub struct MaintenanceTicks {
    daily: u32,
    weekly: u32,
    daily_every: u32,
    weekly_every: u32,
}

impl MaintenanceTicks {
    pub fn new(daily_every: u32, weekly_every: u32) -> Self {
        Self {
            daily: 0,
            weekly: 0,
            daily_every: daily_every.max(1),
            weekly_every: weekly_every.max(1),
        }
    }

    pub fn from_settings(s: &WatchdogSettings) -> Self {
        Self::new(s.daily_ticks, s.weekly_ticks)
    }

    pub fn advance(&mut self) -> Due {
        self.daily += 1;
        self.weekly += 1;
        let mut due = Due::default();
        if self.daily >= self.daily_every {
            self.daily = 0;
            due.daily = true;
        }
        if self.weekly >= self.weekly_every {
            self.weekly = 0;
            due.weekly = true;
        }
        due
    }
}

/// `<dir>/<stem>.bak-YYYY_MM.log` next to the live log.
pub fn backup_path(live: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = live
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "deskwatch".to_string());
    let name = format!("{stem}.bak-{}.log", now.format("%Y_%m"));
    match live.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// Append the live log's current contents to this month's backup file.
/// The live log itself is left untouched.
pub async fn backup_live_log(live: &Path, now: DateTime<Local>) -> anyhow::Result<PathBuf> {
    flush_live_log().await;
    let data = tokio::fs::read(live)
        .await
        .with_context(|| format!("read live log {}", live.display()))?;
    let backup = backup_path(live, now);
    let mut f = open_append_log_async(&backup).await?;
    f.write_all(&data)
        .await
        .with_context(|| format!("append to backup {}", backup.display()))?;
    f.flush().await?;
    Ok(backup)
}

/// Truncate the live log and leave a single line pointing at the backup.
pub async fn reset_live_log(live: &Path, backup: &Path) -> anyhow::Result<()> {
    flush_live_log().await;
    let mut f = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(live)
        .await
        .with_context(|| format!("truncate live log {}", live.display()))?;
    let line = format!(
        "{} For older logs, see: {}\n",
        Local::now().format("%Y/%m/%d %H:%M:%S"),
        backup.display()
    );
    f.write_all(line.as_bytes()).await?;
    f.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn a_week_of_minutes_fires_daily_seven_times_and_weekly_once() {
        let mut t = MaintenanceTicks::new(1440, 10080);
        let (mut daily, mut weekly) = (0, 0);
        for i in 1..=10080 {
            let due = t.advance();
            if due.daily {
                daily += 1;
                assert_eq!(i % 1440, 0, "daily fired off-boundary at tick {i}");
            }
            if due.weekly {
                weekly += 1;
            }
        }
        assert_eq!((daily, weekly), (7, 1));
    }

    #[test]
    fn counters_wrap_and_fire_once_per_crossing() {
        let mut t = MaintenanceTicks::new(2, 3);
        let seq: Vec<Due> = (0..6).map(|_| t.advance()).collect();
        let daily: Vec<bool> = seq.iter().map(|d| d.daily).collect();
        let weekly: Vec<bool> = seq.iter().map(|d| d.weekly).collect();
        assert_eq!(daily, vec![false, true, false, true, false, true]);
        assert_eq!(weekly, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn backup_name_is_monthly() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let p = backup_path(Path::new("/var/log/deskwatch/deskwatch.log"), now);
        assert_eq!(p, PathBuf::from("/var/log/deskwatch/deskwatch.bak-2024_03.log"));
    }

    #[tokio::test]
    async fn backup_appends_and_reset_leaves_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("deskwatch.log");
        let now = Local.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

        tokio::fs::write(&live, "week one\n").await.unwrap();
        let backup = backup_live_log(&live, now).await.unwrap();
        reset_live_log(&live, &backup).await.unwrap();

        tokio::fs::write(&live, "week two\n").await.unwrap();
        let again = backup_live_log(&live, now).await.unwrap();
        assert_eq!(again, backup);

        let archived = tokio::fs::read_to_string(&backup).await.unwrap();
        assert_eq!(archived, "week one\nweek two\n");

        reset_live_log(&live, &backup).await.unwrap();
        let current = tokio::fs::read_to_string(&live).await.unwrap();
        assert_eq!(current.lines().count(), 1);
        assert!(current.trim_end().ends_with(&format!("For older logs, see: {}", backup.display())));
    }

    #[tokio::test]
    async fn backup_of_missing_live_log_fails() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("absent.log");
        assert!(backup_live_log(&live, Local::now()).await.is_err());
    }
}
