//! In-process repository with the same atomicity contract as redis.
//!
//! Used by tests and by `STORAGE=memory` for local runs. Each trait method takes
//! the lock once, which gives the same per-operation atomicity redis gives.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    error::AppError,
    models::{
        NotificationFailure, Store, StoreId, StoreIdentity, StoreStats, Survey, SurveyId, Vote,
        VoterId,
    },
    repository::{FailureLog, StoreRepository, SurveyRepository, VoteRepository},
};

#[derive(Default)]
struct Collections {
    stores: HashMap<StoreId, Store>,
    identities: HashMap<String, StoreId>,
    surveys: HashMap<SurveyId, Survey>,
    votes: HashMap<(SurveyId, VoterId), DateTime<Utc>>,
    failures: Vec<NotificationFailure>,
}

#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Collections>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<NotificationFailure> {
        self.inner.lock().failures.clone()
    }
}

#[async_trait]
impl StoreRepository for MemoryRepository {
    async fn find_store(&self, id: StoreId) -> Result<Option<Store>, AppError> {
        Ok(self.inner.lock().stores.get(&id).cloned())
    }

    async fn find_store_by_identity(
        &self,
        identity: &StoreIdentity,
    ) -> Result<Option<Store>, AppError> {
        let inner = self.inner.lock();

        Ok(inner
            .identities
            .get(&identity.key())
            .and_then(|id| inner.stores.get(id))
            .cloned())
    }

    async fn insert_store(&self, store: &Store) -> Result<bool, AppError> {
        let mut inner = self.inner.lock();
        let key = store.profile.identity().key();

        if inner.identities.contains_key(&key) {
            return Ok(false);
        }

        inner.identities.insert(key, store.id);
        inner.stores.insert(store.id, store.clone());

        Ok(true)
    }

    async fn add_taxonomy(&self, id: StoreId, code: &str) -> Result<(), AppError> {
        if let Some(store) = self.inner.lock().stores.get_mut(&id) {
            store.taxonomy.insert(code.to_string());
        }

        Ok(())
    }

    async fn write_stats(
        &self,
        id: StoreId,
        stats: &StoreStats,
        updated_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock();
        let store = inner.stores.get_mut(&id).ok_or(AppError::NotFound("Store"))?;

        store.stats = stats.clone();
        store.updated_at = updated_at;

        Ok(())
    }

    async fn list_stores(&self) -> Result<Vec<Store>, AppError> {
        Ok(self.inner.lock().stores.values().cloned().collect())
    }
}

#[async_trait]
impl SurveyRepository for MemoryRepository {
    async fn find_survey(&self, id: SurveyId) -> Result<Option<Survey>, AppError> {
        Ok(self.inner.lock().surveys.get(&id).cloned())
    }

    async fn surveys_for_store(&self, store_id: StoreId) -> Result<Vec<Survey>, AppError> {
        Ok(self
            .inner
            .lock()
            .surveys
            .values()
            .filter(|survey| survey.store_id == store_id)
            .cloned()
            .collect())
    }

    async fn list_surveys(&self) -> Result<Vec<Survey>, AppError> {
        Ok(self.inner.lock().surveys.values().cloned().collect())
    }

    async fn insert_survey(&self, survey: &Survey) -> Result<(), AppError> {
        let mut stored = survey.clone();
        stored.helpful_count = 0;

        self.inner.lock().surveys.insert(survey.id, stored);

        Ok(())
    }

    async fn replace_survey(&self, survey: &Survey) -> Result<(), AppError> {
        let mut inner = self.inner.lock();
        let existing = inner
            .surveys
            .get_mut(&survey.id)
            .ok_or(AppError::NotFound("Survey"))?;

        let store_id = existing.store_id;
        let helpful_count = existing.helpful_count;

        *existing = survey.clone();
        existing.store_id = store_id;
        existing.helpful_count = helpful_count;

        Ok(())
    }

    async fn move_survey(&self, survey: &Survey, from: StoreId) -> Result<(), AppError> {
        let mut inner = self.inner.lock();
        let existing = inner
            .surveys
            .get_mut(&survey.id)
            .ok_or(AppError::NotFound("Survey"))?;

        if existing.store_id != from {
            return Err(AppError::Conflict(
                "survey moved concurrently".to_string(),
            ));
        }

        let helpful_count = existing.helpful_count;
        *existing = survey.clone();
        existing.helpful_count = helpful_count;

        Ok(())
    }

    async fn adjust_helpful(&self, id: SurveyId, delta: i64) -> Result<Option<u64>, AppError> {
        let mut inner = self.inner.lock();

        Ok(inner.surveys.get_mut(&id).map(|survey| {
            survey.helpful_count = survey.helpful_count.saturating_add_signed(delta);
            survey.helpful_count
        }))
    }

    async fn helpful_count(&self, id: SurveyId) -> Result<Option<u64>, AppError> {
        Ok(self
            .inner
            .lock()
            .surveys
            .get(&id)
            .map(|survey| survey.helpful_count))
    }
}

#[async_trait]
impl VoteRepository for MemoryRepository {
    async fn insert_vote(&self, vote: &Vote) -> Result<bool, AppError> {
        let mut inner = self.inner.lock();
        let key = (vote.survey_id, vote.voter_id.clone());

        if inner.votes.contains_key(&key) {
            return Ok(false);
        }

        inner.votes.insert(key, vote.created_at);

        Ok(true)
    }

    async fn delete_vote(
        &self,
        survey_id: SurveyId,
        voter_id: &VoterId,
    ) -> Result<bool, AppError> {
        Ok(self
            .inner
            .lock()
            .votes
            .remove(&(survey_id, voter_id.clone()))
            .is_some())
    }

    async fn count_votes(&self, survey_id: SurveyId) -> Result<u64, AppError> {
        Ok(self
            .inner
            .lock()
            .votes
            .keys()
            .filter(|(id, _)| *id == survey_id)
            .count() as u64)
    }
}

#[async_trait]
impl FailureLog for MemoryRepository {
    async fn record_failure(&self, failure: &NotificationFailure) -> Result<(), AppError> {
        self.inner.lock().failures.push(failure.clone());

        Ok(())
    }
}
