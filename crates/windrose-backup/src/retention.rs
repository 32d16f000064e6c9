//! Grandfather-Father-Son retention planning: keep-set selection, forced
//! age/count pruning, previews, and corruption cleanup.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::RetentionPolicy;
use crate::error::Result;
use crate::manager::BackupManager;
use crate::types::{Backup, BackupStatus, BackupType};
use crate::validator::Validator;

/// Why a backup is retained. A backup can match several rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    MinimumCount,
    RecentWindow,
    DailyRepresentative,
    WeeklyRepresentative,
    MonthlyRepresentative,
}

impl KeepReason {
    fn describe(&self) -> &'static str {
        match self {
            KeepReason::MinimumCount => "within minimum retained count",
            KeepReason::RecentWindow => "within recent-hours window",
            KeepReason::DailyRepresentative => "daily representative",
            KeepReason::WeeklyRepresentative => "weekly representative",
            KeepReason::MonthlyRepresentative => "monthly representative",
        }
    }
}

/// One planned deletion with its single governing reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDecision {
    pub backup_id: String,
    pub reason: String,
}

/// One planned retention with every matching rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepDecision {
    pub backup_id: String,
    pub reasons: Vec<String>,
}

/// Output of the planner: a partition of the completed backups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPlan {
    pub keep: Vec<KeepDecision>,
    pub delete: Vec<DeleteDecision>,
}

/// Decorated preview with byte and count accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPreview {
    pub would_keep: Vec<KeepDecision>,
    pub would_delete: Vec<DeleteDecision>,
    pub kept_count: usize,
    pub deleted_count: usize,
    pub kept_bytes: u64,
    pub deleted_bytes: u64,
}

/// Result of applying the plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub kept_count: usize,
    pub freed_bytes: u64,
    pub errors: Vec<String>,
}

/// Result of a corruption sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub scanned: usize,
    pub corrupted: Vec<String>,
}

/// Compute the retention partition for `backups` under `policy` at `now`.
///
/// Only Completed backups participate; everything else is left untouched.
pub fn plan_retention(
    backups: &[Backup],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetentionPlan {
    // Newest first; every rule below walks this order.
    let mut completed: Vec<&Backup> = backups
        .iter()
        .filter(|b| b.status == BackupStatus::Completed)
        .collect();
    completed.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut reasons: HashMap<&str, Vec<KeepReason>> = HashMap::new();

    for (index, backup) in completed.iter().enumerate() {
        if index < policy.min_count {
            reasons
                .entry(backup.id.as_str())
                .or_default()
                .push(KeepReason::MinimumCount);
        }
    }

    if policy.keep_recent_hours > 0 {
        let cutoff = now - Duration::hours(i64::from(policy.keep_recent_hours));
        for backup in &completed {
            if backup.created_at >= cutoff {
                reasons
                    .entry(backup.id.as_str())
                    .or_default()
                    .push(KeepReason::RecentWindow);
            }
        }
    }

    for (window_days, key_format, reason) in [
        (
            i64::from(policy.keep_daily_for_days),
            "%Y-%m-%d",
            KeepReason::DailyRepresentative,
        ),
        (
            i64::from(policy.keep_weekly_for_weeks) * 7,
            "%G-%V",
            KeepReason::WeeklyRepresentative,
        ),
        (
            i64::from(policy.keep_monthly_for_months) * 30,
            "%Y-%m",
            KeepReason::MonthlyRepresentative,
        ),
    ] {
        if window_days == 0 {
            continue;
        }
        let cutoff = now - Duration::days(window_days);
        let mut representative: HashMap<String, &Backup> = HashMap::new();
        for backup in &completed {
            if backup.created_at < cutoff {
                continue;
            }
            let key = backup.created_at.format(key_format).to_string();
            match representative.get(&key) {
                // First sighting in newest-first order is the most recent;
                // replace only when a Full upgrades a non-Full.
                Some(existing)
                    if existing.backup_type != BackupType::Full
                        && backup.backup_type == BackupType::Full =>
                {
                    representative.insert(key, backup);
                }
                Some(_) => {}
                None => {
                    representative.insert(key, backup);
                }
            }
        }
        for backup in representative.into_values() {
            reasons
                .entry(backup.id.as_str())
                .or_default()
                .push(reason);
        }
    }

    let mut plan = RetentionPlan::default();
    let age_cutoff = (policy.max_age_days > 0)
        .then(|| now - Duration::days(i64::from(policy.max_age_days)));

    for (index, backup) in completed.iter().enumerate() {
        let kept_reasons = reasons.get(backup.id.as_str());

        // The age rule overrides every keep rule except the minimum-count
        // floor.
        let over_age = age_cutoff.map_or(false, |cutoff| backup.created_at < cutoff);
        let floor_protected = index < policy.min_count;

        match kept_reasons {
            Some(matched) if !over_age || floor_protected => {
                plan.keep.push(KeepDecision {
                    backup_id: backup.id.clone(),
                    reasons: matched.iter().map(|r| r.describe().to_string()).collect(),
                });
            }
            Some(_) => {
                plan.delete.push(DeleteDecision {
                    backup_id: backup.id.clone(),
                    reason: format!("older than maximum age of {} days", policy.max_age_days),
                });
            }
            None => {
                let reason = if over_age {
                    format!("older than maximum age of {} days", policy.max_age_days)
                } else {
                    "not selected by any retention rule".to_string()
                };
                plan.delete.push(DeleteDecision {
                    backup_id: backup.id.clone(),
                    reason,
                });
            }
        }
    }

    // Ceiling trim: drop the oldest kept entries down to max_count, never
    // below min_count. Keep decisions are in newest-first order already.
    if policy.max_count > 0 {
        let floor = policy.min_count.max(1);
        while plan.keep.len() > policy.max_count && plan.keep.len() > floor {
            let Some(dropped) = plan.keep.pop() else {
                break;
            };
            plan.delete.push(DeleteDecision {
                backup_id: dropped.backup_id,
                reason: format!("exceeds maximum retained count of {}", policy.max_count),
            });
        }
    }

    plan
}

impl BackupManager {
    /// Preview what the active retention policy would do right now.
    pub async fn preview_retention(&self) -> RetentionPreview {
        let backups = self.store.backups().await;
        let policy = self.store.retention_policy().await;
        let plan = plan_retention(&backups, &policy, Utc::now());

        let size_of = |id: &str| {
            backups
                .iter()
                .find(|b| b.id == id)
                .map(|b| b.file_size)
                .unwrap_or(0)
        };

        RetentionPreview {
            kept_count: plan.keep.len(),
            deleted_count: plan.delete.len(),
            kept_bytes: plan.keep.iter().map(|k| size_of(&k.backup_id)).sum(),
            deleted_bytes: plan.delete.iter().map(|d| size_of(&d.backup_id)).sum(),
            would_keep: plan.keep,
            would_delete: plan.delete,
        }
    }

    /// Apply the active retention policy: delete every planned archive, then
    /// drop all their records in a single metadata save.
    pub async fn apply_retention(&self) -> Result<RetentionReport> {
        let backups = self.store.backups().await;
        let policy = self.store.retention_policy().await;
        let plan = plan_retention(&backups, &policy, Utc::now());

        let mut report = RetentionReport {
            kept_count: plan.keep.len(),
            ..RetentionReport::default()
        };

        let mut removed_ids = Vec::new();
        for decision in &plan.delete {
            let Some(backup) = backups.iter().find(|b| b.id == decision.backup_id) else {
                continue;
            };
            match std::fs::remove_file(&backup.path) {
                Ok(()) => report.freed_bytes += backup.file_size,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    report
                        .errors
                        .push(format!("failed to remove {}: {}", backup.path.display(), err));
                    continue;
                }
            }
            info!(
                id = %backup.id,
                reason = %decision.reason,
                "pruning backup"
            );
            removed_ids.push(backup.id.clone());
        }

        if !removed_ids.is_empty() {
            self.store.remove_backups(&removed_ids).await?;
        }
        report.deleted = removed_ids;

        info!(
            deleted = report.deleted.len(),
            kept = report.kept_count,
            freed_bytes = report.freed_bytes,
            "retention applied"
        );
        Ok(report)
    }

    /// Replace the active retention policy after validating it.
    pub async fn set_retention_policy(&self, policy: RetentionPolicy) -> Result<()> {
        policy.validate()?;
        self.store.set_retention_policy(policy).await
    }

    /// Validate every settled backup, marking and disarming corrupt ones.
    ///
    /// Backups failing existence or checksum are marked Corrupted and their
    /// archive files removed; the records remain for the audit trail.
    pub async fn cleanup_corrupted(&self) -> Result<CorruptionReport> {
        let validator = Validator::new(self);
        let backups = self.store.backups().await;
        let mut report = CorruptionReport::default();

        for backup in backups {
            if backup.status == BackupStatus::InProgress {
                continue;
            }
            report.scanned += 1;

            let result = validator.validate_backup(&backup).await;
            if result.checksum_valid && backup.path.exists() {
                continue;
            }

            warn!(id = %backup.id, "backup failed integrity sweep, marking corrupted");
            let mut corrupted = backup.clone();
            corrupted.status = BackupStatus::Corrupted;
            self.store.update_backup(corrupted).await?;
            let _ = std::fs::remove_file(&backup.path);
            report.corrupted.push(backup.id);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackupTrigger;

    fn completed_at_age(hours: i64, backup_type: BackupType) -> Backup {
        let mut b = Backup::new(backup_type, BackupTrigger::Scheduled, "");
        b.created_at = Utc::now() - Duration::hours(hours);
        b.completed_at = Some(b.created_at);
        b.status = BackupStatus::Completed;
        b.file_size = 1024;
        b
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            min_count: 2,
            max_count: 5,
            max_age_days: 90,
            keep_recent_hours: 24,
            keep_daily_for_days: 7,
            keep_weekly_for_weeks: 4,
            keep_monthly_for_months: 6,
        }
    }

    #[test]
    fn test_gfs_selection_with_age_and_ceiling() {
        let backups: Vec<Backup> = [0, 2, 26, 50, 8 * 24, 30 * 24, 100 * 24]
            .into_iter()
            .map(|h| completed_at_age(h, BackupType::Database))
            .collect();

        let plan = plan_retention(&backups, &policy(), Utc::now());

        assert_eq!(plan.keep.len() + plan.delete.len(), 7);
        assert!(plan.keep.len() <= 5);

        // The 100-day backup always falls to the age rule.
        let oldest = &backups[6];
        assert!(plan.delete.iter().any(|d| d.backup_id == oldest.id));

        // The two newest stay: recent window and minimum count.
        for recent in &backups[..2] {
            assert!(plan.keep.iter().any(|k| k.backup_id == recent.id));
        }
    }

    #[test]
    fn test_min_count_floor_survives_age_rule() {
        // Everything is ancient; the floor still holds.
        let backups: Vec<Backup> = (0..4)
            .map(|i| completed_at_age(24 * (200 + i), BackupType::Database))
            .collect();

        let plan = plan_retention(&backups, &policy(), Utc::now());
        assert_eq!(plan.keep.len(), 2);
        assert_eq!(plan.delete.len(), 2);
    }

    #[test]
    fn test_full_preferred_within_bucket() {
        let mut full = completed_at_age(30, BackupType::Full);
        let database = completed_at_age(28, BackupType::Database);
        full.created_at = database.created_at - Duration::minutes(30);

        let lean_policy = RetentionPolicy {
            min_count: 1,
            max_count: 0,
            max_age_days: 0,
            keep_recent_hours: 0,
            keep_daily_for_days: 7,
            keep_weekly_for_weeks: 0,
            keep_monthly_for_months: 0,
        };

        let backups = vec![full.clone(), database.clone()];
        let plan = plan_retention(&backups, &lean_policy, Utc::now());

        // Same day bucket: the Full wins it even though the Database backup
        // is newer; the newer one survives only through min_count.
        let daily_kept: Vec<_> = plan
            .keep
            .iter()
            .filter(|k| k.reasons.iter().any(|r| r.contains("daily")))
            .collect();
        assert_eq!(daily_kept.len(), 1);
        assert_eq!(daily_kept[0].backup_id, full.id);
    }

    #[test]
    fn test_in_progress_excluded() {
        let mut in_progress = completed_at_age(1, BackupType::Database);
        in_progress.status = BackupStatus::InProgress;
        let plan = plan_retention(&[in_progress], &policy(), Utc::now());
        assert!(plan.keep.is_empty());
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_unlimited_max_count() {
        let lean_policy = RetentionPolicy {
            max_count: 0,
            ..policy()
        };
        let backups: Vec<Backup> = (0..20)
            .map(|i| completed_at_age(i, BackupType::Database))
            .collect();
        let plan = plan_retention(&backups, &lean_policy, Utc::now());
        // All within the recent window, none trimmed.
        assert_eq!(plan.keep.len(), 20);
    }
}
