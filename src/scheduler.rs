//! Daily trigger for unattended runs.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::util::env::env_opt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTrigger {
    at: NaiveTime,
}

impl Default for DailyTrigger {
    fn default() -> Self {
        Self {
            at: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl FromStr for DailyTrigger {
    type Err = anyhow::Error;

    /// `HH:MM`, 24-hour local time.
    fn from_str(s: &str) -> Result<Self> {
        let at = NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|e| anyhow!("invalid daily trigger time {s:?} (expected HH:MM): {e}"))?;
        Ok(Self { at })
    }
}

impl DailyTrigger {
    pub fn new(at: NaiveTime) -> Self {
        Self { at }
    }

    /// `SYNC_DAILY_AT`, falling back to 03:00 when unset or unparsable.
    pub fn from_env() -> Self {
        match env_opt("SYNC_DAILY_AT") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(error = %e, "ignoring SYNC_DAILY_AT; using default 03:00");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn at(&self) -> NaiveTime {
        self.at
    }

    /// The first trigger strictly after `now`.
    pub fn next_run_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.at);
        if today > now {
            today
        } else {
            today + TimeDelta::days(1)
        }
    }
}

/// Runs `job` at every trigger time until `cancel` fires. A job already in
/// progress is awaited; cancellation only interrupts the wait between runs.
pub async fn run_daily<F, Fut>(trigger: DailyTrigger, cancel: &CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let now = Local::now().naive_local();
        let next = trigger.next_run_after(now);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(next_run = %next, wait_secs = wait.as_secs(), "next ratings sync scheduled");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("scheduler: shutdown");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }
        job().await;
    }
}
