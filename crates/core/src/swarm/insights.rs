//! # Insights
//!
//! Daily and weekly roll-ups of pipeline activity: what ran, what is waiting
//! on a human, and how reviewers treated the drafts.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::phases::{RunSnapshot, RunStatus};
use crate::config::Channel;
use crate::state::{ApprovalStatus, DraftManager, ErrorLog, OutreachDb};

/// Weekly approval rate (percent) below which messaging needs another look
const LOW_APPROVAL_PCT: f64 = 50.0;

/// Runs started in a window, by how they ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTally {
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunTally {
    fn since(runs: &[RunSnapshot], since: DateTime<Utc>) -> Self {
        let mut tally = Self::default();
        for run in runs
            .iter()
            .filter(|r| r.started_at.is_some_and(|t| t >= since))
        {
            tally.started += 1;
            match run.status {
                RunStatus::Completed => tally.completed += 1,
                RunStatus::Failed => tally.failed += 1,
                RunStatus::Cancelled => tally.cancelled += 1,
                _ => {}
            }
        }
        tally
    }
}

/// Work waiting on someone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWork {
    /// Pending follow-ups due today or earlier
    pub due_followups: usize,
    /// Drafts not yet reviewed
    pub pending_approvals: usize,
    /// Runs parked at the approval gate
    pub runs_awaiting_approval: usize,
    pub active_runs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub runs: RunTally,
    pub pending: PendingWork,
    pub errors_logged: usize,
    pub recommendations: Vec<String>,
}

impl DailySummary {
    pub fn collect(db: &OutreachDb, runs: &[RunSnapshot], today: NaiveDate) -> Result<Self> {
        let drafts = DraftManager::new(db);
        let midnight = start_of(today);

        let pending = PendingWork {
            due_followups: drafts.count_due_followups(today)?,
            pending_approvals: drafts.count_awaiting_review()?,
            runs_awaiting_approval: runs
                .iter()
                .filter(|r| r.status == RunStatus::ApprovalNeeded)
                .count(),
            active_runs: runs.iter().filter(|r| !r.status.is_terminal()).count(),
        };

        let mut summary = Self {
            date: today,
            runs: RunTally::since(runs, midnight),
            pending,
            errors_logged: ErrorLog::new(db).count_since(midnight)?,
            recommendations: Vec::new(),
        };
        summary.recommendations = summary.recommend();
        Ok(summary)
    }

    fn recommend(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.pending.runs_awaiting_approval > 0 {
            notes.push(format!(
                "{} run(s) waiting at the approval gate",
                self.pending.runs_awaiting_approval
            ));
        }
        if self.pending.due_followups > 0 {
            notes.push(format!("{} follow-up(s) due", self.pending.due_followups));
        }
        if self.runs.failed > 0 {
            notes.push(format!(
                "{} run(s) failed today; check the error log",
                self.runs.failed
            ));
        }
        notes
    }
}

/// How reviewers treated one channel's drafts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReview {
    pub drafted: usize,
    pub approved: usize,
    pub rejected: usize,
    pub edit_requested: usize,
}

impl ChannelReview {
    fn add(&mut self, status: ApprovalStatus, count: usize) {
        self.drafted += count;
        match status {
            ApprovalStatus::Approved => self.approved += count,
            ApprovalStatus::Rejected => self.rejected += count,
            ApprovalStatus::EditRequested => self.edit_requested += count,
            ApprovalStatus::Draft => {}
        }
    }

    fn reviewed(&self) -> usize {
        self.approved + self.rejected + self.edit_requested
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyReview {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub runs: RunTally,
    pub by_channel: BTreeMap<Channel, ChannelReview>,
    pub followups_scheduled: usize,
    pub errors_logged: usize,
    /// Approved share of reviewed drafts, in percent; none when nothing was reviewed
    pub approval_rate: Option<f64>,
    pub recommendations: Vec<String>,
}

impl WeeklyReview {
    /// The seven days up to `now`
    pub fn collect(db: &OutreachDb, runs: &[RunSnapshot], now: DateTime<Utc>) -> Result<Self> {
        let drafts = DraftManager::new(db);
        let since = now - Duration::days(7);

        let mut by_channel: BTreeMap<Channel, ChannelReview> = BTreeMap::new();
        for (channel, status, count) in drafts.review_counts_since(since)? {
            by_channel.entry(channel).or_default().add(status, count);
        }

        let (approved, reviewed) = by_channel
            .values()
            .fold((0, 0), |(a, r), c| (a + c.approved, r + c.reviewed()));
        let approval_rate =
            (reviewed > 0).then(|| (approved as f64 / reviewed as f64 * 1000.0).round() / 10.0);

        let mut review = Self {
            since,
            until: now,
            runs: RunTally::since(runs, since),
            by_channel,
            followups_scheduled: drafts.count_followups_since(since)?,
            errors_logged: ErrorLog::new(db).count_since(since)?,
            approval_rate,
            recommendations: Vec::new(),
        };
        review.recommendations = review.recommend();
        Ok(review)
    }

    fn recommend(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.runs.started == 0 {
            notes.push("no batches ran this week".to_string());
        }
        if let Some(rate) = self.approval_rate.filter(|r| *r < LOW_APPROVAL_PCT) {
            notes.push(format!(
                "only {:.1}% of reviewed drafts were approved; revisit messaging",
                rate
            ));
        }
        for (channel, review) in &self.by_channel {
            if review.reviewed() > 0 && review.approved == 0 {
                notes.push(format!("no {} drafts were approved", channel.as_str()));
            }
        }
        notes
    }
}

fn start_of(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}
