//! Timer-driven scheduled backups with a start/stop lifecycle.
//!
//! One background task per manager: compute the next run, sleep until it (or
//! a stop signal / cancellation), create the scheduled backup, apply
//! retention, record bookkeeping, loop. Errors never escape the task.

use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::error::{BackupError, Result};
use crate::manager::BackupManager;
use crate::types::BackupTrigger;

/// Running-state of the scheduler. The mutex only guards the handle swap and
/// is never held across I/O.
pub(crate) struct SchedulerState {
    inner: Mutex<Option<RunningScheduler>>,
}

struct RunningScheduler {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

/// Compute the next scheduled run after `now`.
///
/// Daily-or-slower intervals target `preferred_hour` local time: today if it
/// has not passed, otherwise tomorrow, plus whole extra days for multi-day
/// intervals. Sub-daily intervals are simple offsets.
pub fn calculate_next(now: DateTime<Utc>, schedule: &ScheduleConfig) -> DateTime<Utc> {
    if schedule.interval_hours < 24 {
        return now + schedule.interval();
    }

    let local_now = now.with_timezone(&Local);
    let preferred = local_now
        .date_naive()
        .and_hms_opt(schedule.preferred_hour, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest());

    let mut next = match preferred {
        Some(t) => t.with_timezone(&Utc),
        // Unrepresentable local time (DST edge); fall back to a plain offset.
        None => return now + schedule.interval(),
    };

    if next <= now {
        next += Duration::days(1);
    }
    if schedule.interval_hours > 24 {
        next += Duration::days(i64::from(schedule.interval_hours / 24) - 1);
    }
    next
}

impl BackupManager {
    /// Whether the scheduler task is running.
    pub fn scheduler_running(&self) -> bool {
        self.scheduler
            .inner
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Start the scheduler loop.
    ///
    /// Refuses when already running. A no-op when backups or scheduling are
    /// disabled.
    pub async fn start_scheduler(self: &Arc<Self>, ctx: &CancellationToken) -> Result<()> {
        if !self.config.enabled {
            info!("backups disabled, scheduler not started");
            return Ok(());
        }
        if !self.schedule().await.enabled {
            info!("scheduling disabled, scheduler not started");
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let token = ctx.clone();

        let mut guard = self
            .scheduler
            .inner
            .lock()
            .map_err(|_| BackupError::SchedulerAlreadyRunning)?;
        if guard.is_some() {
            return Err(BackupError::SchedulerAlreadyRunning);
        }

        let handle = tokio::spawn(async move {
            run_loop(manager, token, stop_rx).await;
        });
        *guard = Some(RunningScheduler { stop_tx, handle });
        info!("backup scheduler started");
        Ok(())
    }

    /// Stop the scheduler and wait for the task to exit. Idempotent: stopping
    /// an already-stopped scheduler returns without error.
    pub async fn stop_scheduler(&self) {
        let running = self
            .scheduler
            .inner
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());

        if let Some(running) = running {
            let _ = running.stop_tx.send(true);
            if let Err(err) = running.handle.await {
                warn!(error = %err, "scheduler task ended abnormally");
            }
            info!("backup scheduler stopped");
        }
    }

    /// Current schedule settings.
    pub async fn schedule(&self) -> ScheduleConfig {
        self.schedule_config.read().await.clone()
    }

    /// Swap the schedule settings.
    ///
    /// Validates first, stops a running scheduler, records the swap, and
    /// restarts only when the scheduler was running before and the new
    /// settings keep it enabled.
    pub async fn set_schedule_config(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        new: ScheduleConfig,
    ) -> Result<()> {
        new.validate()?;

        let was_running = self.scheduler_running();
        self.stop_scheduler().await;

        {
            let mut schedule = self.schedule_config.write().await;
            *schedule = new.clone();
        }
        self.store.set_next_scheduled(None).await?;

        if was_running && new.enabled {
            self.start_scheduler(ctx).await?;
        }
        Ok(())
    }
}

async fn run_loop(
    manager: Arc<BackupManager>,
    ctx: CancellationToken,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let schedule = manager.schedule().await;
        let next = calculate_next(Utc::now(), &schedule);
        if let Err(err) = manager.store().set_next_scheduled(Some(next)).await {
            warn!(error = %err, "failed to record next scheduled run");
        }

        let wait = (next - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop_rx.changed() => return,
            _ = ctx.cancelled() => return,
        }

        match manager
            .create_backup(
                &ctx,
                schedule.backup_type,
                BackupTrigger::Scheduled,
                "Scheduled backup",
            )
            .await
        {
            Ok(backup) => info!(id = %backup.id, "scheduled backup finished"),
            Err(err) => error!(error = %err, "scheduled backup failed"),
        }

        if let Err(err) = manager.apply_retention().await {
            error!(error = %err, "retention after scheduled backup failed");
        }

        if let Err(err) = manager.store().set_last_scheduled(Utc::now()).await {
            warn!(error = %err, "failed to record last scheduled run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{manager_with_dir, TestDb};
    use crate::types::BackupType;

    #[test]
    fn test_sub_daily_interval_is_plain_offset() {
        let schedule = ScheduleConfig {
            interval_hours: 6,
            ..ScheduleConfig::default()
        };
        let now = Utc::now();
        assert_eq!(calculate_next(now, &schedule), now + Duration::hours(6));
    }

    #[test]
    fn test_daily_interval_lands_on_preferred_hour() {
        let schedule = ScheduleConfig {
            interval_hours: 24,
            preferred_hour: 2,
            ..ScheduleConfig::default()
        };
        let now = Utc::now();
        let next = calculate_next(now, &schedule);
        assert!(next > now);
        assert!(next - now <= Duration::days(1) + Duration::hours(1));
        let local = next.with_timezone(&Local);
        assert_eq!(local.format("%H:%M:%S").to_string(), "02:00:00");
    }

    #[test]
    fn test_multi_day_interval_adds_days() {
        let schedule = ScheduleConfig {
            interval_hours: 72,
            preferred_hour: 2,
            ..ScheduleConfig::default()
        };
        let now = Utc::now();
        let next = calculate_next(now, &schedule);
        assert!(next - now > Duration::days(2));
        assert!(next - now <= Duration::days(3) + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_start_twice_refused_and_stop_idempotent() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        let manager = Arc::new(manager);
        let ctx = CancellationToken::new();

        manager.start_scheduler(&ctx).await.unwrap();
        assert!(manager.scheduler_running());
        assert!(matches!(
            manager.start_scheduler(&ctx).await,
            Err(BackupError::SchedulerAlreadyRunning)
        ));

        manager.stop_scheduler().await;
        assert!(!manager.scheduler_running());
        // Stopping again is a no-op.
        manager.stop_scheduler().await;
        manager.stop_scheduler().await;
    }

    #[tokio::test]
    async fn test_disabled_schedule_is_noop() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        let manager = Arc::new(manager);
        let ctx = CancellationToken::new();

        manager
            .set_schedule_config(
                &ctx,
                ScheduleConfig {
                    enabled: false,
                    ..ScheduleConfig::default()
                },
            )
            .await
            .unwrap();

        manager.start_scheduler(&ctx).await.unwrap();
        assert!(!manager.scheduler_running());
    }

    #[tokio::test]
    async fn test_swap_config_restarts_running_scheduler() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        let manager = Arc::new(manager);
        let ctx = CancellationToken::new();

        manager.start_scheduler(&ctx).await.unwrap();
        manager
            .set_schedule_config(
                &ctx,
                ScheduleConfig {
                    interval_hours: 48,
                    backup_type: BackupType::Database,
                    ..ScheduleConfig::default()
                },
            )
            .await
            .unwrap();
        assert!(manager.scheduler_running());
        assert_eq!(manager.schedule().await.interval_hours, 48);

        manager.stop_scheduler().await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        let manager = Arc::new(manager);
        let ctx = CancellationToken::new();

        manager.start_scheduler(&ctx).await.unwrap();
        ctx.cancel();
        // The loop observes cancellation; stop still cleans up the handle.
        manager.stop_scheduler().await;
        assert!(!manager.scheduler_running());
    }
}
