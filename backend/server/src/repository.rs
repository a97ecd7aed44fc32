//! # Storage Seams
//!
//! The core never locks in-process. Every correctness guarantee is pushed down
//! to one of the atomic primitives below:
//!
//! - [`VoteRepository::insert_vote`] / [`VoteRepository::delete_vote`] report
//!   whether persisted state actually changed.
//! - [`SurveyRepository::adjust_helpful`] is an atomic increment.
//! - [`StoreRepository::insert_store`] refuses a second store with the same
//!   [`StoreIdentity`].
//! - [`StoreRepository::write_stats`] replaces the stats block in one write.
//!
//! Two implementations exist: [`crate::database::RedisRepository`] and
//! [`crate::memory::MemoryRepository`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::AppError,
    models::{
        NotificationFailure, Store, StoreId, StoreIdentity, StoreStats, Survey, SurveyId, Vote,
        VoterId,
    },
};

#[async_trait]
pub trait StoreRepository: Send + Sync {
    async fn find_store(&self, id: StoreId) -> Result<Option<Store>, AppError>;

    async fn find_store_by_identity(
        &self,
        identity: &StoreIdentity,
    ) -> Result<Option<Store>, AppError>;

    /// Returns `false` without writing when the identity is already taken.
    async fn insert_store(&self, store: &Store) -> Result<bool, AppError>;

    /// Set-union, never removes codes.
    async fn add_taxonomy(&self, id: StoreId, code: &str) -> Result<(), AppError>;

    async fn write_stats(
        &self,
        id: StoreId,
        stats: &StoreStats,
        updated_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn list_stores(&self) -> Result<Vec<Store>, AppError>;
}

#[async_trait]
pub trait SurveyRepository: Send + Sync {
    async fn find_survey(&self, id: SurveyId) -> Result<Option<Survey>, AppError>;

    /// Every survey referencing the store, regardless of status.
    async fn surveys_for_store(&self, store_id: StoreId) -> Result<Vec<Survey>, AppError>;

    /// Every survey, regardless of status or store.
    async fn list_surveys(&self) -> Result<Vec<Survey>, AppError>;

    async fn insert_survey(&self, survey: &Survey) -> Result<(), AppError>;

    /// Rewrites content, status and timestamps. Leaves the store reference and
    /// the helpful counter alone.
    async fn replace_survey(&self, survey: &Survey) -> Result<(), AppError>;

    /// Rewrites the survey under its new store reference and moves it out of
    /// `from`'s index in one step.
    async fn move_survey(&self, survey: &Survey, from: StoreId) -> Result<(), AppError>;

    /// Atomic add, returns the new count or `None` for an unknown survey.
    async fn adjust_helpful(&self, id: SurveyId, delta: i64) -> Result<Option<u64>, AppError>;

    async fn helpful_count(&self, id: SurveyId) -> Result<Option<u64>, AppError>;
}

#[async_trait]
pub trait VoteRepository: Send + Sync {
    /// `true` only when a new row was created.
    async fn insert_vote(&self, vote: &Vote) -> Result<bool, AppError>;

    /// `true` only when a row was removed.
    async fn delete_vote(&self, survey_id: SurveyId, voter_id: &VoterId)
    -> Result<bool, AppError>;

    async fn count_votes(&self, survey_id: SurveyId) -> Result<u64, AppError>;
}

#[async_trait]
pub trait FailureLog: Send + Sync {
    async fn record_failure(&self, failure: &NotificationFailure) -> Result<(), AppError>;
}

pub trait Repository: StoreRepository + SurveyRepository + VoteRepository + FailureLog {}

impl<T> Repository for T where T: StoreRepository + SurveyRepository + VoteRepository + FailureLog {}
