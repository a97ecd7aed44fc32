//! # Stats Maintenance
//!
//! Re-derives every store's stats block from its surveys, and every survey's
//! `helpfulCount` from its vote rows.
//!
//! The server refreshes stats after each survey mutation, but a refresh can
//! fail after the write already landed. Those stores keep stale numbers until
//! something recomputes them. This crate is that something.
//!
//! ## Run
//! 1. Load every store.
//! 2. Compute fresh stats from the store's surveys.
//! 3. Compare with what is stored.
//! 4. Compare each survey's `helpfulCount` with its vote rows.
//! 5. With `apply`, write the stores and counters that differ. Without it,
//!    only report.
//!
//! ## Notes
//! - A store with no approved surveys stamps `lastReviewedAt` with the run
//!   time, so two empty blocks are equal regardless of that field.
//! - Writes go through the same repository call the server uses, so running
//!   this next to a live server is safe. The last writer wins and both compute
//!   from the same rows.
//! - Counter repair is a delta against the count read at the start of the
//!   store's pass. A vote landing in between is off by one until the next run.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use survey_server::{
    models::{StoreStats, Survey},
    repository::Repository,
    stats::compute,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub stores: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Surveys whose `helpfulCount` disagreed with their vote rows.
    pub helpful_drift: usize,
    pub applied: bool,
}

pub async fn recalculate_all(
    repository: &dyn Repository,
    apply: bool,
    now: DateTime<Utc>,
    show_progress: bool,
) -> Result<Summary> {
    let stores = repository
        .list_stores()
        .await
        .context("Failed to list stores")?;

    let mut summary = Summary {
        stores: stores.len(),
        applied: apply,
        ..Summary::default()
    };

    let pb = progress_bar(stores.len() as u64, show_progress)?;

    for store in stores {
        pb.set_message(format!("Store {}", store.profile.name));

        let surveys = repository
            .surveys_for_store(store.id)
            .await
            .with_context(|| format!("Failed to load surveys for store {}", store.id))?;
        summary.helpful_drift += reconcile_helpful(repository, &surveys, apply).await?;
        let fresh = compute(&surveys, now);

        if same_stats(&store.stats, &fresh) {
            summary.unchanged += 1;
        } else {
            debug!(
                "Store {} drifted: {} -> {} reviews",
                store.id, store.stats.review_count, fresh.review_count
            );

            if apply {
                repository
                    .write_stats(store.id, &fresh, now)
                    .await
                    .with_context(|| format!("Failed to write stats for store {}", store.id))?;
            }
            summary.updated += 1;
        }

        pb.inc(1);
    }

    pb.finish_with_message("Done");

    info!(
        "Checked {} stores: {} updated, {} unchanged, {} helpful counters off{}",
        summary.stores,
        summary.updated,
        summary.unchanged,
        summary.helpful_drift,
        if apply { "" } else { " (dry run)" }
    );

    Ok(summary)
}

/// Number of surveys whose counter is off. With `apply` they are corrected.
async fn reconcile_helpful(
    repository: &dyn Repository,
    surveys: &[Survey],
    apply: bool,
) -> Result<usize> {
    let mut drifted = 0;

    for survey in surveys {
        let votes = repository
            .count_votes(survey.id)
            .await
            .with_context(|| format!("Failed to count votes for survey {}", survey.id))?;
        if votes == survey.helpful_count {
            continue;
        }

        warn!(
            "Survey {} counts {} helpful but has {} votes",
            survey.id, survey.helpful_count, votes
        );
        drifted += 1;

        if apply {
            let delta = votes as i64 - survey.helpful_count as i64;
            repository
                .adjust_helpful(survey.id, delta)
                .await
                .with_context(|| format!("Failed to repair helpful count for {}", survey.id))?;
        }
    }

    Ok(drifted)
}

fn progress_bar(len: u64, show: bool) -> Result<ProgressBar> {
    if !show {
        return Ok(ProgressBar::hidden());
    }

    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .context("Invalid progress template")?
        .progress_chars("=> "),
    );

    Ok(pb)
}

fn same_stats(stored: &StoreStats, fresh: &StoreStats) -> bool {
    if stored.review_count == 0 && fresh.review_count == 0 {
        return stored.avg_rating.is_none()
            && stored.avg_earning.is_none()
            && stored.avg_wait_time.is_none();
    }

    stored == fresh
}
