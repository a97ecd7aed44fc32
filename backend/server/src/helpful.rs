//! # Helpful Toggle
//!
//! Sets a voter's helpful state on a survey to the desired value.
//!
//! The vote row is the state. The cached counter is only ever moved by ±1
//! when the storage layer reports that the vote row actually changed, so a
//! replayed or concurrent request cannot inflate it.
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    error::AppError,
    models::{SurveyId, Vote, VoterId},
    repository::Repository,
};

pub async fn toggle(
    repository: &dyn Repository,
    survey_id: SurveyId,
    voter_id: &VoterId,
    desired: bool,
    now: DateTime<Utc>,
) -> Result<u64, AppError> {
    let survey = repository
        .find_survey(survey_id)
        .await?
        .filter(|survey| survey.status.is_public())
        .ok_or(AppError::NotFound("Survey"))?;

    let changed = if desired {
        let vote = Vote {
            survey_id,
            voter_id: voter_id.clone(),
            created_at: now,
        };
        repository.insert_vote(&vote).await?
    } else {
        repository.delete_vote(survey_id, voter_id).await?
    };

    let count = if changed {
        let delta = if desired { 1 } else { -1 };
        repository.adjust_helpful(survey_id, delta).await?
    } else {
        repository.helpful_count(survey_id).await?
    };

    debug!("Voter {voter_id} set helpful={desired} on survey {survey_id} (changed: {changed})");

    Ok(count.unwrap_or(survey.helpful_count))
}
