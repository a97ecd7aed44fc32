//! # Survey Commands
//!
//! Every survey mutation goes through [`SurveyCommands`]:
//!
//! validate → write survey → recalculate affected store(s) → refreshed view
//!
//! The survey write is the commit point. A failed recalculation is logged and
//! returned as a warning on the [`Outcome`], the survey write stays. Stats are
//! a projection and the next recalculation (or `recalculate-stats`) repairs
//! them.
//!
//! Store creation comes in two flavours that intentionally differ:
//! - anonymous submissions look a store up by identity and create a shell when
//!   missing, concurrent creators converge on one store
//! - admins create stores explicitly and a duplicate identity is a conflict
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    error::AppError,
    models::{
        Moderation, Store, StoreId, StoreProfile, StoreStats, Submitter, Survey, SurveyContent,
        SurveyId, SurveyStatus,
    },
    notify::{Notifier, SubmissionNotice},
    repository::Repository,
    stats,
    utils::SurveyPatch,
};

#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> Outcome<T> {
    fn new(value: T, warnings: Vec<String>) -> Self {
        Self { value, warnings }
    }
}

#[derive(Debug)]
pub struct Submission {
    pub survey: Survey,
    pub store: Store,
}

pub struct SurveyCommands {
    repository: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    require_moderation: bool,
}

impl SurveyCommands {
    pub fn new(
        repository: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
        require_moderation: bool,
    ) -> Self {
        Self {
            repository,
            notifier,
            require_moderation,
        }
    }

    async fn refresh(&self, store_id: StoreId, now: DateTime<Utc>, warnings: &mut Vec<String>) {
        if let Err(e) = stats::recalculate(self.repository.as_ref(), store_id, now).await {
            warn!("Stats for store {store_id} not refreshed: {e}");
            warnings.push(format!("stats for store {store_id} not refreshed"));
        }
    }

    async fn union_taxonomy(&self, store_id: StoreId, codes: &[String], warnings: &mut Vec<String>) {
        for code in codes {
            if let Err(e) = self.repository.add_taxonomy(store_id, code).await {
                warn!("Taxonomy {code} not added to store {store_id}: {e}");
                warnings.push(format!("taxonomy {code} not added to store {store_id}"));
            }
        }
    }

    async fn survey(&self, survey_id: SurveyId) -> Result<Survey, AppError> {
        self.repository
            .find_survey(survey_id)
            .await?
            .ok_or(AppError::NotFound("Survey"))
    }

    /// Existing stores are returned untouched.
    pub async fn resolve_store(
        &self,
        draft: StoreProfile,
        taxonomy_hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Store, AppError> {
        let identity = draft.identity();

        if let Some(store) = self.repository.find_store_by_identity(&identity).await? {
            return Ok(store);
        }

        let profile = StoreProfile {
            name: identity.name().to_string(),
            branch_name: identity.branch().map(str::to_string),
            ..draft
        };
        let mut store = Store::new(profile, now);
        if let Some(code) = taxonomy_hint {
            store.taxonomy.insert(code.to_string());
        }

        if self.repository.insert_store(&store).await? {
            info!("Created store {} ({})", store.id, store.profile.name);
            return Ok(store);
        }

        // Another request claimed the identity first.
        self.repository
            .find_store_by_identity(&identity)
            .await?
            .ok_or_else(|| AppError::Conflict("store identity claimed but unreadable".to_string()))
    }

    pub async fn create_store(
        &self,
        profile: StoreProfile,
        taxonomy: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Store, AppError> {
        let identity = profile.identity();
        let duplicate = || {
            AppError::Conflict(format!(
                "store {} ({}) already exists",
                identity.name(),
                identity.branch().unwrap_or("no branch")
            ))
        };

        if self
            .repository
            .find_store_by_identity(&identity)
            .await?
            .is_some()
        {
            return Err(duplicate());
        }

        let profile = StoreProfile {
            name: identity.name().to_string(),
            branch_name: identity.branch().map(str::to_string),
            ..profile
        };
        let mut store = Store::new(profile, now);
        store.taxonomy.extend(taxonomy);

        if !self.repository.insert_store(&store).await? {
            return Err(duplicate());
        }

        info!("Admin created store {}", store.id);
        Ok(store)
    }

    /// Anonymous path. The store is named by the submitter, not referenced.
    pub async fn submit_survey(
        &self,
        draft: StoreProfile,
        content: SurveyContent,
        submitter: Option<Submitter>,
        now: DateTime<Utc>,
    ) -> Result<Outcome<Submission>, AppError> {
        let mut warnings = Vec::new();

        let store = self
            .resolve_store(draft, content.taxonomy.first().map(String::as_str), now)
            .await?;

        let status = if self.require_moderation {
            SurveyStatus::Pending
        } else {
            SurveyStatus::Approved
        };

        let mut survey = Survey::new(store.id, content, status, now);
        survey.submitter = submitter;
        self.repository.insert_survey(&survey).await?;
        info!("Survey {} submitted for store {}", survey.id, store.id);

        self.union_taxonomy(store.id, &survey.content.taxonomy, &mut warnings)
            .await;
        self.refresh(store.id, now, &mut warnings).await;

        let store = match self.repository.find_store(store.id).await {
            Ok(Some(refreshed)) => refreshed,
            _ => store,
        };

        let notice = SubmissionNotice {
            survey_id: survey.id,
            store_id: store.id,
            store_name: store.profile.name.clone(),
            branch_name: store.profile.branch_name.clone(),
            region: store.profile.region.clone(),
            period: survey.content.period.clone(),
            taxonomy: survey.content.taxonomy.clone(),
            age: survey.content.age,
            rating: survey.content.rating,
            comment: survey.content.comment.clone(),
            submitter: survey.submitter.clone(),
        };
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.survey_submitted(notice).await;
        });

        Ok(Outcome::new(Submission { survey, store }, warnings))
    }

    /// Admin path onto an existing store.
    pub async fn create_survey(
        &self,
        store_id: StoreId,
        content: SurveyContent,
        now: DateTime<Utc>,
    ) -> Result<Outcome<Survey>, AppError> {
        let mut warnings = Vec::new();

        if self.repository.find_store(store_id).await?.is_none() {
            return Err(AppError::InvalidReference(format!(
                "store {store_id} does not exist"
            )));
        }

        let survey = Survey::new(store_id, content, SurveyStatus::Approved, now);
        self.repository.insert_survey(&survey).await?;

        self.union_taxonomy(store_id, &survey.content.taxonomy, &mut warnings)
            .await;
        self.refresh(store_id, now, &mut warnings).await;

        Ok(Outcome::new(survey, warnings))
    }

    /// Content only. The store reference is not part of [`SurveyPatch`].
    pub async fn update_survey(
        &self,
        survey_id: SurveyId,
        patch: SurveyPatch,
        now: DateTime<Utc>,
    ) -> Result<Outcome<Survey>, AppError> {
        let mut warnings = Vec::new();
        let mut survey = self.survey(survey_id).await?;

        survey.content = patch.apply(&survey.content, now)?;
        survey.updated_at = now;
        self.repository.replace_survey(&survey).await?;

        self.union_taxonomy(survey.store_id, &survey.content.taxonomy, &mut warnings)
            .await;
        self.refresh(survey.store_id, now, &mut warnings).await;

        Ok(Outcome::new(self.survey(survey_id).await?, warnings))
    }

    pub async fn set_status(
        &self,
        survey_id: SurveyId,
        status: SurveyStatus,
        reason: Option<String>,
        moderator: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Outcome<Survey>, AppError> {
        let mut warnings = Vec::new();
        let mut survey = self.survey(survey_id).await?;
        let previous = survey.status;

        survey.status = status;
        survey.moderation = Some(Moderation {
            reason: reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
            moderator,
            decided_at: now,
        });
        survey.updated_at = now;
        self.repository.replace_survey(&survey).await?;
        info!("Survey {survey_id} moved from {previous:?} to {status:?}");

        self.refresh(survey.store_id, now, &mut warnings).await;

        Ok(Outcome::new(self.survey(survey_id).await?, warnings))
    }

    /// The only way a survey's store reference changes. Both stores are
    /// recalculated independently.
    pub async fn reassign_store(
        &self,
        survey_id: SurveyId,
        target: StoreId,
        now: DateTime<Utc>,
    ) -> Result<Outcome<Survey>, AppError> {
        let mut warnings = Vec::new();
        let mut survey = self.survey(survey_id).await?;

        if self.repository.find_store(target).await?.is_none() {
            return Err(AppError::InvalidReference(format!(
                "store {target} does not exist"
            )));
        }

        let source = survey.store_id;
        if source == target {
            return Ok(Outcome::new(survey, warnings));
        }

        survey.store_id = target;
        survey.updated_at = now;
        self.repository.move_survey(&survey, source).await?;
        info!("Survey {survey_id} moved from store {source} to {target}");

        self.union_taxonomy(target, &survey.content.taxonomy, &mut warnings)
            .await;
        self.refresh(source, now, &mut warnings).await;
        self.refresh(target, now, &mut warnings).await;

        Ok(Outcome::new(self.survey(survey_id).await?, warnings))
    }

    pub async fn recalculate_store(
        &self,
        store_id: StoreId,
        now: DateTime<Utc>,
    ) -> Result<StoreStats, AppError> {
        stats::recalculate(self.repository.as_ref(), store_id, now).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

    use super::*;
    use crate::{
        listing::{StoreFilter, browse},
        memory::MemoryRepository,
        models::{NotificationFailure, StoreIdentity, Vote, VoterId},
        notify::NoopNotifier,
        repository::{FailureLog, StoreRepository, SurveyRepository, VoteRepository},
    };

    fn draft(name: &str, branch: Option<&str>) -> StoreProfile {
        StoreProfile {
            name: name.to_string(),
            branch_name: branch.map(str::to_string),
            region: "東京都".to_string(),
            area: None,
            tags: Vec::new(),
            description: None,
        }
    }

    fn content(rating: f64, earning: Option<u32>, code: &str) -> SurveyContent {
        SurveyContent {
            taxonomy: vec![code.to_string()],
            period: "2024-05".to_string(),
            rating,
            average_earning: earning,
            ..SurveyContent::default()
        }
    }

    fn commands(repo: Arc<MemoryRepository>, require_moderation: bool) -> SurveyCommands {
        SurveyCommands::new(repo, Arc::new(NoopNotifier), require_moderation)
    }

    #[tokio::test]
    async fn test_submission_creates_and_reuses_store() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = commands(repo.clone(), false);
        let now = Utc::now();

        let first = commands
            .submit_survey(draft(" Luna ", Some("")), content(4.0, Some(10), "ソープ"), None, now)
            .await
            .unwrap();
        let second = commands
            .submit_survey(draft("Luna", None), content(2.0, Some(30), "DC"), None, now)
            .await
            .unwrap();

        assert!(first.warnings.is_empty());
        assert_eq!(first.value.store.id, second.value.store.id);
        assert_eq!(first.value.store.profile.name, "Luna");
        assert_eq!(first.value.survey.status, SurveyStatus::Approved);

        let store = second.value.store;
        assert_eq!(store.stats.review_count, 2);
        assert_eq!(store.stats.avg_rating, Some(3.0));
        assert_eq!(store.stats.avg_earning, Some(20.0));
        assert!(store.taxonomy.contains("ソープ") && store.taxonomy.contains("DC"));
        assert_eq!(repo.list_stores().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_moderated_submission_is_pending() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = commands(repo, true);

        let outcome = commands
            .submit_survey(draft("Luna", None), content(4.0, None, "DC"), None, Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.value.survey.status, SurveyStatus::Pending);
        assert_eq!(outcome.value.store.stats.review_count, 0);
        assert_eq!(outcome.value.store.stats.avg_rating, None);
    }

    #[tokio::test]
    async fn test_duplicate_store_rejected() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = commands(repo.clone(), false);
        let now = Utc::now();

        commands
            .create_store(draft("Luna", Some("")), vec!["DC".to_string()], now)
            .await
            .unwrap();

        let duplicate = commands.create_store(draft(" Luna ", None), Vec::new(), now).await;
        assert!(matches!(duplicate, Err(AppError::Conflict(_))));

        commands
            .create_store(draft("Luna", Some("East")), Vec::new(), now)
            .await
            .unwrap();
        assert_eq!(repo.list_stores().await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolution_converges() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = Arc::new(commands(repo.clone(), false));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let commands = commands.clone();
                tokio::spawn(async move {
                    commands
                        .resolve_store(draft("Luna", None), Some("DC"), Utc::now())
                        .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(repo.list_stores().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reassignment_refreshes_both_stores() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = commands(repo.clone(), false);
        let now = Utc::now();

        let a = commands.create_store(draft("A", None), vec!["DC".to_string()], now).await.unwrap();
        let b = commands.create_store(draft("B", None), vec!["DC".to_string()], now).await.unwrap();

        let moved = commands.create_survey(a.id, content(5.0, Some(10), "DC"), now).await.unwrap();
        commands.create_survey(a.id, content(3.0, None, "DC"), now).await.unwrap();
        commands.create_survey(b.id, content(1.0, Some(20), "DC"), now).await.unwrap();

        // Votes survive the move.
        repo.insert_vote(&Vote {
            survey_id: moved.value.id,
            voter_id: VoterId::generate(),
            created_at: now,
        })
        .await
        .unwrap();
        repo.adjust_helpful(moved.value.id, 1).await.unwrap();

        let outcome = commands.reassign_store(moved.value.id, b.id, now).await.unwrap();
        assert_eq!(outcome.value.store_id, b.id);
        assert_eq!(outcome.value.helpful_count, 1);

        let a = repo.find_store(a.id).await.unwrap().unwrap();
        let b = repo.find_store(b.id).await.unwrap().unwrap();

        assert_eq!(a.stats.review_count, 1);
        assert_eq!(a.stats.avg_rating, Some(3.0));
        assert_eq!(a.stats.avg_earning, None);
        assert_eq!(b.stats.review_count, 2);
        assert_eq!(b.stats.avg_rating, Some(3.0));
        assert_eq!(b.stats.avg_earning, Some(15.0));
    }

    #[tokio::test]
    async fn test_reassignment_to_missing_store() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = commands(repo, false);
        let now = Utc::now();

        let store = commands.create_store(draft("A", None), vec!["DC".to_string()], now).await.unwrap();
        let survey = commands.create_survey(store.id, content(4.0, None, "DC"), now).await.unwrap();

        let result = commands.reassign_store(survey.value.id, StoreId::generate(), now).await;
        assert!(matches!(result, Err(AppError::InvalidReference(_))));

        let result = commands.create_survey(StoreId::generate(), content(4.0, None, "DC"), now).await;
        assert!(matches!(result, Err(AppError::InvalidReference(_))));
    }

    #[tokio::test]
    async fn test_status_transitions_refresh_stats() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = commands(repo.clone(), false);
        let now = Utc::now();

        let store = commands.create_store(draft("A", None), vec!["DC".to_string()], now).await.unwrap();
        let survey = commands.create_survey(store.id, content(4.0, None, "DC"), now).await.unwrap();

        let rejected = commands
            .set_status(
                survey.value.id,
                SurveyStatus::Rejected,
                Some(" spam ".to_string()),
                Some("admin".to_string()),
                now,
            )
            .await
            .unwrap();

        let moderation = rejected.value.moderation.unwrap();
        assert_eq!(moderation.reason.as_deref(), Some("spam"));

        let store = repo.find_store(store.id).await.unwrap().unwrap();
        assert_eq!(store.stats.review_count, 0);
        assert_eq!(store.stats.avg_rating, None);
        assert_eq!(store.stats.last_reviewed_at, Some(now));
    }

    #[tokio::test]
    async fn test_update_survey() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = commands(repo.clone(), false);
        let now = Utc::now();

        let store = commands.create_store(draft("A", None), vec!["DC".to_string()], now).await.unwrap();
        let survey = commands.create_survey(store.id, content(4.0, None, "DC"), now).await.unwrap();

        let empty = commands.update_survey(survey.value.id, SurveyPatch::default(), now).await;
        assert!(matches!(empty, Err(AppError::Invalid(_))));

        let patch = SurveyPatch {
            rating: Some(2.0),
            ..SurveyPatch::default()
        };
        let updated = commands.update_survey(survey.value.id, patch, now).await.unwrap();
        assert_eq!(updated.value.content.rating, 2.0);
        assert_eq!(updated.value.store_id, store.id);

        let store = repo.find_store(store.id).await.unwrap().unwrap();
        assert_eq!(store.stats.avg_rating, Some(2.0));

        let missing = commands
            .update_survey(SurveyId::generate(), SurveyPatch::default(), now)
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_taxonomy_edit_reaches_store() {
        let repo = Arc::new(MemoryRepository::new());
        let commands = commands(repo.clone(), false);
        let now = Utc::now();

        let store = commands.create_store(draft("A", None), vec!["DC".to_string()], now).await.unwrap();
        let survey = commands.create_survey(store.id, content(4.0, None, "DC"), now).await.unwrap();

        let patch = SurveyPatch {
            taxonomy: Some(vec!["soap".to_string()]),
            ..SurveyPatch::default()
        };
        let updated = commands.update_survey(survey.value.id, patch, now).await.unwrap();
        assert_eq!(updated.value.content.taxonomy, vec!["ソープ"]);

        let store = repo.find_store(store.id).await.unwrap().unwrap();
        assert!(store.taxonomy.contains("ソープ"));
        assert!(store.taxonomy.contains("DC"));

        let filter = StoreFilter {
            taxonomy: Some("soap".to_string()),
            ..StoreFilter::default()
        };
        assert_eq!(browse(vec![store], &filter).len(), 1);
    }

    struct ChannelNotifier(UnboundedSender<SubmissionNotice>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn survey_submitted(&self, notice: SubmissionNotice) {
            let _ = self.0.send(notice);
        }
    }

    #[tokio::test]
    async fn test_submission_dispatches_notification() {
        let (tx, mut rx) = unbounded_channel();
        let repo = Arc::new(MemoryRepository::new());
        let commands = SurveyCommands::new(repo, Arc::new(ChannelNotifier(tx)), false);

        let outcome = commands
            .submit_survey(draft("Luna", None), content(4.5, None, "DC"), None, Utc::now())
            .await
            .unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.survey_id, outcome.value.survey.id);
        assert_eq!(notice.store_name, "Luna");
    }

    /// Delegates to memory but refuses every stats write.
    struct BrokenStats(MemoryRepository);

    #[async_trait]
    impl StoreRepository for BrokenStats {
        async fn find_store(&self, id: StoreId) -> Result<Option<Store>, AppError> {
            self.0.find_store(id).await
        }

        async fn find_store_by_identity(
            &self,
            identity: &StoreIdentity,
        ) -> Result<Option<Store>, AppError> {
            self.0.find_store_by_identity(identity).await
        }

        async fn insert_store(&self, store: &Store) -> Result<bool, AppError> {
            self.0.insert_store(store).await
        }

        async fn add_taxonomy(&self, id: StoreId, code: &str) -> Result<(), AppError> {
            self.0.add_taxonomy(id, code).await
        }

        async fn write_stats(
            &self,
            _id: StoreId,
            _stats: &StoreStats,
            _updated_at: DateTime<Utc>,
        ) -> Result<(), AppError> {
            Err(AppError::InternalError("stats write refused".into()))
        }

        async fn list_stores(&self) -> Result<Vec<Store>, AppError> {
            self.0.list_stores().await
        }
    }

    #[async_trait]
    impl SurveyRepository for BrokenStats {
        async fn find_survey(&self, id: SurveyId) -> Result<Option<Survey>, AppError> {
            self.0.find_survey(id).await
        }

        async fn surveys_for_store(&self, store_id: StoreId) -> Result<Vec<Survey>, AppError> {
            self.0.surveys_for_store(store_id).await
        }

        async fn list_surveys(&self) -> Result<Vec<Survey>, AppError> {
            self.0.list_surveys().await
        }

        async fn insert_survey(&self, survey: &Survey) -> Result<(), AppError> {
            self.0.insert_survey(survey).await
        }

        async fn replace_survey(&self, survey: &Survey) -> Result<(), AppError> {
            self.0.replace_survey(survey).await
        }

        async fn move_survey(&self, survey: &Survey, from: StoreId) -> Result<(), AppError> {
            self.0.move_survey(survey, from).await
        }

        async fn adjust_helpful(&self, id: SurveyId, delta: i64) -> Result<Option<u64>, AppError> {
            self.0.adjust_helpful(id, delta).await
        }

        async fn helpful_count(&self, id: SurveyId) -> Result<Option<u64>, AppError> {
            self.0.helpful_count(id).await
        }
    }

    #[async_trait]
    impl VoteRepository for BrokenStats {
        async fn insert_vote(&self, vote: &Vote) -> Result<bool, AppError> {
            self.0.insert_vote(vote).await
        }

        async fn delete_vote(
            &self,
            survey_id: SurveyId,
            voter_id: &VoterId,
        ) -> Result<bool, AppError> {
            self.0.delete_vote(survey_id, voter_id).await
        }

        async fn count_votes(&self, survey_id: SurveyId) -> Result<u64, AppError> {
            self.0.count_votes(survey_id).await
        }
    }

    #[async_trait]
    impl FailureLog for BrokenStats {
        async fn record_failure(&self, failure: &NotificationFailure) -> Result<(), AppError> {
            self.0.record_failure(failure).await
        }
    }

    #[tokio::test]
    async fn test_stats_failure_is_a_warning() {
        let repo = Arc::new(BrokenStats(MemoryRepository::new()));
        let commands = SurveyCommands::new(repo.clone(), Arc::new(NoopNotifier), false);

        let outcome = commands
            .submit_survey(draft("Luna", None), content(4.0, None, "DC"), None, Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.warnings.len(), 1);
        assert!(repo.find_survey(outcome.value.survey.id).await.unwrap().is_some());
    }
}
