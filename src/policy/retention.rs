//! Retention policy: how many snapshots to keep per time bucket, and the
//! engine that stamps keep-reasons onto manifests.
//!
//! Each cap is tri-state: absent inherits from the parent policy, zero
//! disables the bucket, a positive value bounds how many snapshots the
//! bucket may retain across the whole list.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::snapshot::Manifest;
use crate::utils::errors::{Result, VaultError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_latest: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_hourly: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_annual: Option<i32>,
}

/// Cutoffs for the five time-bounded buckets. "latest" has no cutoff.
struct CutoffTimes {
    annual: DateTime<Utc>,
    monthly: DateTime<Utc>,
    weekly: DateTime<Utc>,
    daily: DateTime<Utc>,
    hourly: DateTime<Utc>,
}

impl RetentionPolicy {
    /// Fallback caps applied when the inheritance chain sets nothing.
    pub fn default_caps() -> Self {
        Self {
            keep_latest: Some(1),
            keep_hourly: Some(48),
            keep_daily: Some(7),
            keep_weekly: Some(4),
            keep_monthly: Some(4),
            keep_annual: Some(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reject caps that cannot describe a bucket size.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("keep-latest", self.keep_latest),
            ("keep-hourly", self.keep_hourly),
            ("keep-daily", self.keep_daily),
            ("keep-weekly", self.keep_weekly),
            ("keep-monthly", self.keep_monthly),
            ("keep-annual", self.keep_annual),
        ] {
            if let Some(v) = value {
                if v < 0 {
                    return Err(VaultError::InvalidRetention(format!(
                        "{name} must not be negative (got {v})"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Adopt the parent's value for every cap this policy leaves unset.
    pub fn merge_from(&mut self, parent: &RetentionPolicy) {
        if self.keep_latest.is_none() {
            self.keep_latest = parent.keep_latest;
        }
        if self.keep_hourly.is_none() {
            self.keep_hourly = parent.keep_hourly;
        }
        if self.keep_daily.is_none() {
            self.keep_daily = parent.keep_daily;
        }
        if self.keep_weekly.is_none() {
            self.keep_weekly = parent.keep_weekly;
        }
        if self.keep_monthly.is_none() {
            self.keep_monthly = parent.keep_monthly;
        }
        if self.keep_annual.is_none() {
            self.keep_annual = parent.keep_annual;
        }
    }

    /// Compute the reasons why each snapshot is retained and store them in
    /// the manifests' retention-reason field.
    ///
    /// Manifests are scanned newest first; within each bucket the first
    /// manifest seen in a period claims it, and per-bucket counters enforce
    /// the caps across the whole list. A manifest is kept iff its reason
    /// list ends up non-empty.
    pub fn compute_retention_reasons(&self, manifests: &mut [Manifest], clock: &dyn Clock) {
        let now = clock.now();
        // Sentinel for unset caps: no snapshot starts after it, so those
        // buckets never match.
        let max_time = now + chrono::Duration::days(365);

        let cutoff = CutoffTimes {
            annual: self.keep_annual.map_or(max_time, |n| years_ago(now, n)),
            monthly: self.keep_monthly.map_or(max_time, |n| months_ago(now, n)),
            weekly: self.keep_weekly.map_or(max_time, |n| weeks_ago(now, n)),
            daily: self.keep_daily.map_or(max_time, |n| days_ago(now, n)),
            hourly: self.keep_hourly.map_or(max_time, |n| hours_ago(now, n)),
        };

        let mut order: Vec<usize> = (0..manifests.len()).collect();
        order.sort_by(|&a, &b| manifests[b].start_time.cmp(&manifests[a].start_time));

        let mut claimed_periods: HashSet<String> = HashSet::new();
        let mut bucket_counts: HashMap<&'static str, i32> = HashMap::new();

        for (position, &index) in order.iter().enumerate() {
            let reasons = self.reasons_for(
                position,
                &manifests[index],
                &cutoff,
                &mut claimed_periods,
                &mut bucket_counts,
            );
            manifests[index].retention_reasons = reasons;
        }
    }

    fn reasons_for(
        &self,
        position: usize,
        manifest: &Manifest,
        cutoff: &CutoffTimes,
        claimed: &mut HashSet<String>,
        counts: &mut HashMap<&'static str, i32>,
    ) -> Vec<String> {
        if !manifest.is_complete() {
            return Vec::new();
        }

        let start = manifest.start_time;
        let iso = start.iso_week();

        // Evaluation order is fixed; a manifest's labels appear in this
        // order. The "latest" period key is the position in the sorted
        // list, which is unique per manifest.
        let cases: [(Option<DateTime<Utc>>, String, &'static str, Option<i32>); 6] = [
            (None, position.to_string(), "latest", self.keep_latest),
            (
                Some(cutoff.annual),
                start.format("%Y").to_string(),
                "annual",
                self.keep_annual,
            ),
            (
                Some(cutoff.monthly),
                start.format("%Y-%m").to_string(),
                "monthly",
                self.keep_monthly,
            ),
            (
                Some(cutoff.weekly),
                format!("{:04}-W{:02}", iso.year(), iso.week()),
                "weekly",
                self.keep_weekly,
            ),
            (
                Some(cutoff.daily),
                start.format("%Y-%m-%d").to_string(),
                "daily",
                self.keep_daily,
            ),
            (
                Some(cutoff.hourly),
                start.format("%Y-%m-%d %H").to_string(),
                "hourly",
                self.keep_hourly,
            ),
        ];

        let mut reasons = Vec::new();

        for (cutoff_time, period, label, cap) in cases {
            let Some(cap) = cap else {
                continue;
            };
            if let Some(cutoff_time) = cutoff_time {
                if start < cutoff_time {
                    continue;
                }
            }
            if claimed.contains(&period) {
                continue;
            }
            let count = counts.entry(label).or_insert(0);
            if *count < cap {
                claimed.insert(period);
                *count += 1;
                reasons.push(label.to_string());
            }
        }

        reasons
    }
}

fn years_ago(base: DateTime<Utc>, n: i32) -> DateTime<Utc> {
    let months = 12 * n.max(0) as u32;
    base.checked_sub_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn months_ago(base: DateTime<Utc>, n: i32) -> DateTime<Utc> {
    base.checked_sub_months(Months::new(n.max(0) as u32))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn weeks_ago(base: DateTime<Utc>, n: i32) -> DateTime<Utc> {
    base - chrono::Duration::weeks(i64::from(n))
}

fn days_ago(base: DateTime<Utc>, n: i32) -> DateTime<Utc> {
    base - chrono::Duration::days(i64::from(n))
}

fn hours_ago(base: DateTime<Utc>, n: i32) -> DateTime<Utc> {
    base - chrono::Duration::hours(i64::from(n))
}
