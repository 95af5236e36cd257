//! Second-precision cron registry driven by a one-second ticker.
//!
//! Entries pair a parsed cron schedule with an action closure. The ticker
//! fires every second, runs every due action, and advances its next-fire
//! time. Standard five-field expressions are accepted and normalized to
//! the six-field seconds form.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

type CronAction = Arc<dyn Fn() + Send + Sync>;

struct CronEntry {
    schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
    action: CronAction,
}

#[derive(Default)]
pub struct CronScheduler {
    entries: Mutex<HashMap<String, CronEntry>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an entry. Five-field expressions get a `0`
    /// seconds column prepended.
    pub fn add(&self, id: &str, expression: &str, action: CronAction) -> Result<()> {
        let normalized = normalize_expression(expression);
        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            Error::InvalidConfig(format!("invalid cron expression {:?}: {}", expression, e))
        })?;
        let next_fire = schedule.upcoming(Utc).next();

        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            id.to_string(),
            CronEntry {
                schedule,
                next_fire,
                action,
            },
        );
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every due entry once and advance its next-fire time. Actions
    /// run outside the entries lock.
    fn fire_due(&self, now: DateTime<Utc>) {
        let mut due: Vec<CronAction> = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            for entry in entries.values_mut() {
                if let Some(next) = entry.next_fire {
                    if next <= now {
                        due.push(entry.action.clone());
                        entry.next_fire = entry.schedule.after(&now).next();
                    }
                }
            }
        }
        for action in due {
            action();
        }
    }

    /// Start the ticker. Stops when the shutdown signal flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.fire_due(Utc::now());
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("cron scheduler stopping");
                        return;
                    }
                }
            }
        })
    }
}

fn normalize_expression(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_add_and_remove() {
        let scheduler = CronScheduler::new();
        scheduler
            .add("t1", "*/5 * * * * *", Arc::new(|| {}))
            .unwrap();
        assert!(scheduler.contains("t1"));
        assert_eq!(scheduler.len(), 1);

        // Re-adding replaces, not duplicates.
        scheduler
            .add("t1", "0 0 * * * *", Arc::new(|| {}))
            .unwrap();
        assert_eq!(scheduler.len(), 1);

        assert!(scheduler.remove("t1"));
        assert!(!scheduler.remove("t1"));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_five_field_expression_normalized() {
        let scheduler = CronScheduler::new();
        scheduler.add("daily", "0 9 * * *", Arc::new(|| {})).unwrap();
        assert!(scheduler.contains("daily"));
    }

    #[test]
    fn test_invalid_expression_rejected() {
        let scheduler = CronScheduler::new();
        let err = scheduler
            .add("bad", "not a cron", Arc::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(!scheduler.contains("bad"));
    }

    #[test]
    fn test_fire_due_advances_next() {
        let scheduler = CronScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        scheduler
            .add(
                "every-second",
                "* * * * * *",
                Arc::new(move || {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let base = Utc::now();
        scheduler.fire_due(base + chrono::Duration::seconds(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Not yet due again at the same instant.
        scheduler.fire_due(base + chrono::Duration::seconds(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.fire_due(base + chrono::Duration::seconds(4));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ticker_fires_and_stops() {
        let scheduler = Arc::new(CronScheduler::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        scheduler
            .add(
                "tick",
                "* * * * * *",
                Arc::new(move || {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = scheduler.clone().spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ticker did not stop")
            .unwrap();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
