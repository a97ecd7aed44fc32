//! # Redis
//!
//! Primary store for stores, surveys and votes.
//!
//! Core purpose is to keep the three collections and give us the atomic
//! operations the engine leans on instead of locks.
//!
//! ## Layout
//!
//! - `stores`: set of every store id
//! - `store:identity`: hash, identity key (trimmed name + branch) to store id, claimed with `HSETNX`
//! - `surveys`: set of every survey id, the index the survey feeds read
//! - `store:{id}`: hash with `profile`, `stats`, `createdAt`, `updatedAt` (JSON values)
//! - `store:{id}:taxonomy`: set of canonical taxonomy codes, grown with `SADD`
//! - `store:{id}:surveys`: set of survey ids, the index the recalculator reads
//! - `survey:{id}`: hash with `doc` (JSON), `storeId` and `helpfulCount`
//! - `survey:{id}:votes`: hash, voter id to vote timestamp
//! - `notifications:failed`: list of undeliverable notification records
//!
//! ## Atomicity
//!
//! - Votes: `HSETNX` answers "inserted a new row", `HDEL` answers "deleted a row"
//! - Helpful counter: `HINCRBY` inside a script that refuses unknown surveys
//! - Store creation: identity claim, store hash and both indexes in one script
//! - Store reference: its own hash field, only written by the move script together with `SMOVE`
//! - Stats: one `HSET` with both `stats` and `updatedAt`
use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    AsyncCommands, Client, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::{
    error::AppError,
    models::{
        NotificationFailure, Store, StoreId, StoreIdentity, StoreProfile, StoreStats, Survey,
        SurveyId, Vote, VoterId,
    },
    repository::{FailureLog, StoreRepository, SurveyRepository, VoteRepository},
};

const STORES: &str = "stores";
const STORE_IDENTITY: &str = "store:identity";
const SURVEYS: &str = "surveys";
const FAILED_NOTIFICATIONS: &str = "notifications:failed";

const MOVE_SURVEY: &str = r"
if redis.call('HGET', KEYS[1], 'storeId') ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'storeId', ARGV[2], 'doc', ARGV[3])
redis.call('SMOVE', KEYS[2], KEYS[3], ARGV[4])
return 1
";

const INSERT_STORE: &str = r"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return 0
end
redis.call('HSET', KEYS[2], 'profile', ARGV[3], 'stats', ARGV[4], 'createdAt', ARGV[5], 'updatedAt', ARGV[6])
redis.call('SADD', KEYS[3], ARGV[2])
for i = 7, #ARGV do
    redis.call('SADD', KEYS[4], ARGV[i])
end
return 1
";

const ADJUST_HELPFUL: &str = r"
if redis.call('HEXISTS', KEYS[1], 'storeId') == 0 then
    return false
end
return redis.call('HINCRBY', KEYS[1], 'helpfulCount', ARGV[1])
";

pub async fn init_redis(redis_url: &str, timeout: Duration) -> Result<ConnectionManager, AppError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(timeout)
        .set_response_timeout(timeout);

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    Ok(connection_manager)
}

fn store_key(id: StoreId) -> String {
    format!("store:{id}")
}

fn taxonomy_key(id: StoreId) -> String {
    format!("store:{id}:taxonomy")
}

fn store_surveys_key(id: StoreId) -> String {
    format!("store:{id}:surveys")
}

fn survey_key(id: SurveyId) -> String {
    format!("survey:{id}")
}

fn votes_key(id: SurveyId) -> String {
    format!("survey:{id}:votes")
}

fn encode<T: Serialize>(value: &T) -> Result<String, AppError> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, AppError> {
    Ok(serde_json::from_str(raw)?)
}

#[derive(Clone)]
pub struct RedisRepository {
    connection: ConnectionManager,
}

impl RedisRepository {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Surveys whose ids are members of the given index set.
    async fn surveys_in(&self, index: &str) -> Result<Vec<Survey>, AppError> {
        let mut con = self.connection.clone();

        let ids: Vec<String> = con.smembers(index).await?;
        let ids = ids
            .iter()
            .map(|id| id.parse::<SurveyId>())
            .collect::<Result<Vec<_>, _>>()?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hget(survey_key(*id), &["doc", "storeId", "helpfulCount"]);
        }
        let rows: Vec<(Option<String>, Option<String>, Option<u64>)> =
            pipe.query_async(&mut con).await?;

        let mut surveys = Vec::with_capacity(rows.len());
        for (id, (doc, store_id, helpful_count)) in ids.into_iter().zip(rows) {
            if let Some(survey) = Self::survey_from_row(id, doc, store_id, helpful_count)? {
                surveys.push(survey);
            }
        }

        Ok(surveys)
    }

    fn survey_from_row(
        id: SurveyId,
        doc: Option<String>,
        store_id: Option<String>,
        helpful_count: Option<u64>,
    ) -> Result<Option<Survey>, AppError> {
        let (Some(doc), Some(store_id)) = (doc, store_id) else {
            return Ok(None);
        };

        let mut survey: Survey = decode(&doc)?;
        survey.id = id;
        survey.store_id = store_id.parse()?;
        survey.helpful_count = helpful_count.unwrap_or(0);

        Ok(Some(survey))
    }
}

#[async_trait]
impl StoreRepository for RedisRepository {
    async fn find_store(&self, id: StoreId) -> Result<Option<Store>, AppError> {
        let mut con = self.connection.clone();

        let (profile, stats, created_at, updated_at): (
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = con
            .hget(store_key(id), &["profile", "stats", "createdAt", "updatedAt"])
            .await?;

        let (Some(profile), Some(created_at)) = (profile, created_at) else {
            return Ok(None);
        };

        let taxonomy: BTreeSet<String> = con.smembers(taxonomy_key(id)).await?;
        let created_at: DateTime<Utc> = decode(&created_at)?;

        Ok(Some(Store {
            id,
            profile: decode::<StoreProfile>(&profile)?,
            taxonomy,
            stats: stats.as_deref().map(decode).transpose()?.unwrap_or_default(),
            created_at,
            updated_at: updated_at
                .as_deref()
                .map(decode)
                .transpose()?
                .unwrap_or(created_at),
        }))
    }

    async fn find_store_by_identity(
        &self,
        identity: &StoreIdentity,
    ) -> Result<Option<Store>, AppError> {
        let mut con = self.connection.clone();

        let id: Option<String> = con.hget(STORE_IDENTITY, identity.key()).await?;

        match id {
            Some(id) => self.find_store(id.parse()?).await,
            None => Ok(None),
        }
    }

    async fn insert_store(&self, store: &Store) -> Result<bool, AppError> {
        let mut con = self.connection.clone();

        let script = Script::new(INSERT_STORE);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(STORE_IDENTITY)
            .key(store_key(store.id))
            .key(STORES)
            .key(taxonomy_key(store.id))
            .arg(store.profile.identity().key())
            .arg(store.id.to_string())
            .arg(encode(&store.profile)?)
            .arg(encode(&store.stats)?)
            .arg(encode(&store.created_at)?)
            .arg(encode(&store.updated_at)?);
        for code in &store.taxonomy {
            invocation.arg(code);
        }

        let inserted: i64 = invocation.invoke_async(&mut con).await?;

        Ok(inserted == 1)
    }

    async fn add_taxonomy(&self, id: StoreId, code: &str) -> Result<(), AppError> {
        let mut con = self.connection.clone();

        let _: () = con.sadd(taxonomy_key(id), code).await?;

        Ok(())
    }

    async fn write_stats(
        &self,
        id: StoreId,
        stats: &StoreStats,
        updated_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut con = self.connection.clone();
        let key = store_key(id);

        let exists: bool = con.exists(&key).await?;
        if !exists {
            return Err(AppError::NotFound("Store"));
        }

        let fields = [("stats", encode(stats)?), ("updatedAt", encode(&updated_at)?)];
        let _: () = con.hset_multiple(&key, &fields).await?;

        Ok(())
    }

    async fn list_stores(&self) -> Result<Vec<Store>, AppError> {
        let mut con = self.connection.clone();

        let ids: Vec<String> = con.smembers(STORES).await?;

        let mut stores = Vec::with_capacity(ids.len());
        for id in ids {
            match self.find_store(id.parse()?).await? {
                Some(store) => stores.push(store),
                None => warn!("Store {id} indexed but missing"),
            }
        }

        Ok(stores)
    }
}

#[async_trait]
impl SurveyRepository for RedisRepository {
    async fn find_survey(&self, id: SurveyId) -> Result<Option<Survey>, AppError> {
        let mut con = self.connection.clone();

        let (doc, store_id, helpful_count): (Option<String>, Option<String>, Option<u64>) = con
            .hget(survey_key(id), &["doc", "storeId", "helpfulCount"])
            .await?;

        Self::survey_from_row(id, doc, store_id, helpful_count)
    }

    async fn surveys_for_store(&self, store_id: StoreId) -> Result<Vec<Survey>, AppError> {
        self.surveys_in(&store_surveys_key(store_id)).await
    }

    async fn list_surveys(&self) -> Result<Vec<Survey>, AppError> {
        self.surveys_in(SURVEYS).await
    }

    async fn insert_survey(&self, survey: &Survey) -> Result<(), AppError> {
        let mut con = self.connection.clone();

        let fields = [
            ("doc", encode(survey)?),
            ("storeId", survey.store_id.to_string()),
            ("helpfulCount", "0".to_string()),
        ];

        redis::pipe()
            .atomic()
            .hset_multiple(survey_key(survey.id), &fields)
            .ignore()
            .sadd(store_surveys_key(survey.store_id), survey.id.to_string())
            .ignore()
            .sadd(SURVEYS, survey.id.to_string())
            .ignore()
            .query_async::<()>(&mut con)
            .await?;

        Ok(())
    }

    async fn replace_survey(&self, survey: &Survey) -> Result<(), AppError> {
        let mut con = self.connection.clone();
        let key = survey_key(survey.id);

        let exists: bool = con.hexists(&key, "storeId").await?;
        if !exists {
            return Err(AppError::NotFound("Survey"));
        }

        let _: () = con.hset(&key, "doc", encode(survey)?).await?;

        Ok(())
    }

    async fn move_survey(&self, survey: &Survey, from: StoreId) -> Result<(), AppError> {
        let mut con = self.connection.clone();

        let moved: i64 = Script::new(MOVE_SURVEY)
            .key(survey_key(survey.id))
            .key(store_surveys_key(from))
            .key(store_surveys_key(survey.store_id))
            .arg(from.to_string())
            .arg(survey.store_id.to_string())
            .arg(encode(survey)?)
            .arg(survey.id.to_string())
            .invoke_async(&mut con)
            .await?;

        if moved == 0 {
            return Err(AppError::Conflict("survey moved concurrently".to_string()));
        }

        Ok(())
    }

    async fn adjust_helpful(&self, id: SurveyId, delta: i64) -> Result<Option<u64>, AppError> {
        let mut con = self.connection.clone();

        let count: Option<i64> = Script::new(ADJUST_HELPFUL)
            .key(survey_key(id))
            .arg(delta)
            .invoke_async(&mut con)
            .await?;

        Ok(count.map(|count| count.max(0) as u64))
    }

    async fn helpful_count(&self, id: SurveyId) -> Result<Option<u64>, AppError> {
        let mut con = self.connection.clone();

        let (store_id, helpful_count): (Option<String>, Option<u64>) = con
            .hget(survey_key(id), &["storeId", "helpfulCount"])
            .await?;

        Ok(store_id.map(|_| helpful_count.unwrap_or(0)))
    }
}

#[async_trait]
impl VoteRepository for RedisRepository {
    async fn insert_vote(&self, vote: &Vote) -> Result<bool, AppError> {
        let mut con = self.connection.clone();

        let inserted: bool = con
            .hset_nx(
                votes_key(vote.survey_id),
                vote.voter_id.as_str(),
                encode(&vote.created_at)?,
            )
            .await?;

        Ok(inserted)
    }

    async fn delete_vote(
        &self,
        survey_id: SurveyId,
        voter_id: &VoterId,
    ) -> Result<bool, AppError> {
        let mut con = self.connection.clone();

        let deleted: i64 = con.hdel(votes_key(survey_id), voter_id.as_str()).await?;

        Ok(deleted > 0)
    }

    async fn count_votes(&self, survey_id: SurveyId) -> Result<u64, AppError> {
        let mut con = self.connection.clone();

        Ok(con.hlen(votes_key(survey_id)).await?)
    }
}

#[async_trait]
impl FailureLog for RedisRepository {
    async fn record_failure(&self, failure: &NotificationFailure) -> Result<(), AppError> {
        let mut con = self.connection.clone();

        let _: () = con.lpush(FAILED_NOTIFICATIONS, encode(failure)?).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs only when `REDIS_TEST_URL` points at a scratch instance.
    async fn scratch() -> Option<RedisRepository> {
        let url = std::env::var("REDIS_TEST_URL").ok()?;
        let connection = init_redis(&url, Duration::from_secs(2)).await.unwrap();

        Some(RedisRepository::new(connection))
    }

    fn profile(name: String) -> StoreProfile {
        StoreProfile {
            name,
            branch_name: None,
            region: "東京都".to_string(),
            area: None,
            tags: Vec::new(),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_insert_store_claims_identity_once() {
        let Some(repo) = scratch().await else {
            return;
        };

        let name = format!("store-{}", StoreId::generate());
        let mut first = Store::new(profile(name.clone()), Utc::now());
        first.taxonomy.insert("DC".to_string());
        assert!(repo.insert_store(&first).await.unwrap());

        let found = repo.find_store(first.id).await.unwrap().unwrap();
        assert_eq!(found.taxonomy, first.taxonomy);
        assert!(repo
            .list_stores()
            .await
            .unwrap()
            .iter()
            .any(|store| store.id == first.id));

        // The losing claim leaves nothing behind.
        let second = Store::new(profile(name), Utc::now());
        assert!(!repo.insert_store(&second).await.unwrap());
        assert!(repo.find_store(second.id).await.unwrap().is_none());
        assert!(repo
            .list_stores()
            .await
            .unwrap()
            .iter()
            .all(|store| store.id != second.id));

        let by_identity = repo
            .find_store_by_identity(&first.profile.identity())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_identity.id, first.id);
    }
}
