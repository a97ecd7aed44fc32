//! # Stats Recalculator
//!
//! A store's [`StoreStats`] block is a projection of its approved surveys.
//! It is never patched incrementally, only recomputed from scratch and
//! written back in one storage operation.
//!
//! Concurrent recalculations for the same store may interleave. Each one
//! computes from a snapshot, so the last writer wins and the next run
//! converges.
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    error::AppError,
    models::{StoreId, StoreStats, Survey},
    repository::Repository,
};

#[derive(Default)]
struct Mean {
    sum: f64,
    count: u64,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.sum += value;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Each mean only counts surveys where that field is present.
pub fn compute(surveys: &[Survey], now: DateTime<Utc>) -> StoreStats {
    let mut rating = Mean::default();
    let mut earning = Mean::default();
    let mut wait_time = Mean::default();
    let mut review_count = 0;
    let mut last_reviewed_at = None;

    for survey in surveys.iter().filter(|s| s.status.is_public()) {
        review_count += 1;

        rating.push(Some(survey.content.rating));
        earning.push(survey.content.average_earning.map(f64::from));
        wait_time.push(survey.content.wait_time_hours.map(f64::from));

        last_reviewed_at = last_reviewed_at.max(Some(survey.created_at));
    }

    if review_count == 0 {
        return StoreStats {
            last_reviewed_at: Some(now),
            ..StoreStats::default()
        };
    }

    StoreStats {
        review_count,
        avg_rating: rating.value(),
        avg_earning: earning.value(),
        avg_wait_time: wait_time.value(),
        last_reviewed_at,
    }
}

pub async fn recalculate(
    repository: &dyn Repository,
    store_id: StoreId,
    now: DateTime<Utc>,
) -> Result<StoreStats, AppError> {
    if repository.find_store(store_id).await?.is_none() {
        return Err(AppError::NotFound("Store"));
    }

    let surveys = repository.surveys_for_store(store_id).await?;
    let stats = compute(&surveys, now);

    repository.write_stats(store_id, &stats, now).await?;

    debug!(
        "Recalculated store {store_id}: {} reviews",
        stats.review_count
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        memory::MemoryRepository,
        models::{Store, StoreProfile, SurveyContent, SurveyStatus},
        repository::{StoreRepository, SurveyRepository},
    };

    fn survey(rating: f64, earning: Option<u32>, wait: Option<u32>, status: SurveyStatus) -> Survey {
        let content = SurveyContent {
            taxonomy: vec!["deriheru".to_string()],
            period: "2024-05".to_string(),
            rating,
            average_earning: earning,
            wait_time_hours: wait,
            ..SurveyContent::default()
        };

        Survey::new(StoreId::generate(), content, status, Utc::now())
    }

    fn profile(name: &str) -> StoreProfile {
        StoreProfile {
            name: name.to_string(),
            branch_name: None,
            region: "tokyo".to_string(),
            area: None,
            tags: Vec::new(),
            description: None,
        }
    }

    #[test]
    fn test_means_skip_missing_fields() {
        let surveys = vec![
            survey(4.0, Some(10), Some(2), SurveyStatus::Approved),
            survey(3.0, Some(20), None, SurveyStatus::Approved),
            survey(5.0, Some(30), None, SurveyStatus::Approved),
            survey(2.0, None, Some(4), SurveyStatus::Approved),
        ];

        let stats = compute(&surveys, Utc::now());

        assert_eq!(stats.review_count, 4);
        assert_eq!(stats.avg_earning, Some(20.0));
        assert_eq!(stats.avg_rating, Some(3.5));
        assert_eq!(stats.avg_wait_time, Some(3.0));
    }

    #[test]
    fn test_zero_reviews_has_no_averages() {
        let now = Utc::now();
        let stats = compute(&[], now);

        assert_eq!(stats.review_count, 0);
        assert_eq!(stats.avg_rating, None);
        assert_eq!(stats.avg_earning, None);
        assert_eq!(stats.avg_wait_time, None);
        assert_eq!(stats.last_reviewed_at, Some(now));
    }

    #[test]
    fn test_only_approved_surveys_count() {
        let surveys = vec![
            survey(5.0, Some(10), None, SurveyStatus::Approved),
            survey(1.0, Some(99), None, SurveyStatus::Pending),
            survey(1.0, Some(99), None, SurveyStatus::Rejected),
        ];

        let stats = compute(&surveys, Utc::now());

        assert_eq!(stats.review_count, 1);
        assert_eq!(stats.avg_rating, Some(5.0));
        assert_eq!(stats.avg_earning, Some(10.0));
    }

    #[test]
    fn test_last_reviewed_is_latest_creation() {
        let mut older = survey(3.0, None, None, SurveyStatus::Approved);
        let newer = survey(3.0, None, None, SurveyStatus::Approved);
        older.created_at = newer.created_at - Duration::days(3);

        let stats = compute(&[newer.clone(), older], Utc::now());

        assert_eq!(stats.last_reviewed_at, Some(newer.created_at));
    }

    #[tokio::test]
    async fn test_recalculate_writes_stats() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        let store = Store::new(profile("Luna"), now);
        assert!(repo.insert_store(&store).await.unwrap());

        for earning in [10, 20, 30] {
            let mut s = survey(4.0, Some(earning), None, SurveyStatus::Approved);
            s.store_id = store.id;
            repo.insert_survey(&s).await.unwrap();
        }

        let stats = recalculate(&repo, store.id, now).await.unwrap();
        let stored = repo.find_store(store.id).await.unwrap().unwrap();

        assert_eq!(stats.review_count, 3);
        assert_eq!(stored.stats, stats);
        assert_eq!(stored.updated_at, now);

        // Idempotent.
        let again = recalculate(&repo, store.id, now).await.unwrap();
        assert_eq!(again, stats);
    }

    #[tokio::test]
    async fn test_recalculate_missing_store() {
        let repo = MemoryRepository::new();

        let result = recalculate(&repo, StoreId::generate(), Utc::now()).await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
