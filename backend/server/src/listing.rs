//! # Browsing
//!
//! Read-side queries over stores and surveys. Everything here is a pure
//! function over records already loaded from the repository.
//!
//! - Public store listing: stores with at least one approved review.
//! - Admin store search: every store, including empty shells.
//! - Survey feeds: public (approved only) and the admin queue (any status).
//!
//! Listings are paged with `page` (1-based) and `limit`.
use std::{cmp::Ordering, collections::HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    models::{Store, StoreId, Survey, SurveyStatus},
    taxonomy::canonical_industry,
};

pub const DEFAULT_STORE_LIMIT: usize = 20;
pub const DEFAULT_SURVEY_LIMIT: usize = 10;
pub const DEFAULT_QUEUE_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;

/// Size of the "new" and "high-rated" survey strips.
pub const FEATURED_LIMIT: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Rating,
    Earning,
    #[default]
    Newest,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFilter {
    #[serde(alias = "prefecture")]
    pub region: Option<String>,
    #[serde(alias = "industry")]
    pub taxonomy: Option<String>,
    /// Comma separated, every tag must be present.
    pub tags: Option<String>,
    pub keyword: Option<String>,
    #[serde(default)]
    pub sort: SortOrder,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurveySort {
    #[default]
    Newest,
    Helpful,
    Earning,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyQuery {
    #[serde(alias = "prefecture")]
    pub region: Option<String>,
    #[serde(alias = "industry")]
    pub taxonomy: Option<String>,
    pub store_name: Option<String>,
    pub store_id: Option<StoreId>,
    /// Comma separated, every tag must be present.
    pub tags: Option<String>,
    pub keyword: Option<String>,
    /// Ignored by the public feed, which only ever shows approved surveys.
    pub status: Option<SurveyStatus>,
    #[serde(default)]
    pub sort: SurveySort,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

/// Zero or missing values fall back to the first page and the default size.
pub fn paginate<T>(
    items: Vec<T>,
    page: Option<usize>,
    limit: Option<usize>,
    default_limit: usize,
) -> Page<T> {
    let page = page.filter(|p| *p > 0).unwrap_or(1);
    let limit = limit
        .filter(|l| *l > 0)
        .unwrap_or(default_limit)
        .min(MAX_LIMIT);
    let total = items.len();

    let items = items
        .into_iter()
        .skip((page - 1).saturating_mul(limit))
        .take(limit)
        .collect();

    Page {
        items,
        page,
        limit,
        total,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn tag_list(raw: Option<&str>) -> Vec<&str> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Missing averages sort last.
fn descending(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn store_matches(store: &Store, filter: &StoreFilter) -> bool {
    if let Some(region) = non_empty(filter.region.as_deref())
        && store.profile.region != region
    {
        return false;
    }

    let taxonomy = filter
        .taxonomy
        .as_deref()
        .map(canonical_industry)
        .filter(|t| !t.is_empty());
    if let Some(code) = taxonomy
        && !store.taxonomy.contains(&code)
    {
        return false;
    }

    let tags = tag_list(filter.tags.as_deref());
    if !tags
        .iter()
        .all(|tag| store.profile.tags.iter().any(|t| t == tag))
    {
        return false;
    }

    match non_empty(filter.keyword.as_deref()) {
        Some(keyword) => [
            Some(store.profile.name.as_str()),
            store.profile.branch_name.as_deref(),
            store.profile.area.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|field| contains_folded(field, keyword)),
        None => true,
    }
}

fn sort_stores(stores: &mut [Store], sort: SortOrder) {
    stores.sort_by(|a, b| {
        let order = match sort {
            SortOrder::Rating => descending(a.stats.avg_rating, b.stats.avg_rating),
            SortOrder::Earning => descending(a.stats.avg_earning, b.stats.avg_earning),
            SortOrder::Newest => b.stats.last_reviewed_at.cmp(&a.stats.last_reviewed_at),
        };

        order.then_with(|| a.profile.name.cmp(&b.profile.name))
    });
}

/// Stores with at least one approved review that match the filter.
pub fn browse(stores: Vec<Store>, filter: &StoreFilter) -> Vec<Store> {
    let mut stores: Vec<Store> = stores
        .into_iter()
        .filter(|store| store.stats.review_count > 0)
        .filter(|store| store_matches(store, filter))
        .collect();

    sort_stores(&mut stores, filter.sort);
    stores
}

/// Admin search. Unlike [`browse`], stores without reviews are included.
pub fn search_stores(stores: Vec<Store>, filter: &StoreFilter) -> Vec<Store> {
    let mut stores: Vec<Store> = stores
        .into_iter()
        .filter(|store| store_matches(store, filter))
        .collect();

    sort_stores(&mut stores, filter.sort);
    stores
}

/// Approved only, newest first.
pub fn public_surveys(surveys: Vec<Survey>) -> Vec<Survey> {
    let mut surveys: Vec<Survey> = surveys
        .into_iter()
        .filter(|survey| survey.status.is_public())
        .collect();

    sort_surveys(&mut surveys, SurveySort::Newest);
    surveys
}

fn sort_surveys(surveys: &mut [Survey], sort: SurveySort) {
    surveys.sort_by(|a, b| {
        let order = match sort {
            SurveySort::Newest => Ordering::Equal,
            SurveySort::Helpful => b.helpful_count.cmp(&a.helpful_count),
            SurveySort::Earning => b
                .content
                .average_earning
                .unwrap_or(0)
                .cmp(&a.content.average_earning.unwrap_or(0)),
        };

        order.then_with(|| b.created_at.cmp(&a.created_at))
    });
}

fn survey_matches(
    survey: &Survey,
    store: Option<&Store>,
    query: &SurveyQuery,
    status: Option<SurveyStatus>,
) -> bool {
    if status.is_some_and(|status| survey.status != status) {
        return false;
    }

    if query.store_id.is_some_and(|id| survey.store_id != id) {
        return false;
    }

    if let Some(region) = non_empty(query.region.as_deref())
        && store.is_none_or(|store| store.profile.region != region)
    {
        return false;
    }

    if let Some(name) = non_empty(query.store_name.as_deref())
        && store.is_none_or(|store| !contains_folded(&store.profile.name, name))
    {
        return false;
    }

    let taxonomy = query
        .taxonomy
        .as_deref()
        .map(canonical_industry)
        .filter(|t| !t.is_empty());
    if let Some(code) = taxonomy
        && !survey.content.taxonomy.contains(&code)
    {
        return false;
    }

    // A survey without its own tags inherits the store's.
    let tags = tag_list(query.tags.as_deref());
    if !tags.is_empty() {
        let own = &survey.content.tags;
        let effective = match store {
            Some(store) if own.is_empty() => &store.profile.tags,
            _ => own,
        };
        if !tags.iter().all(|tag| effective.iter().any(|t| t == tag)) {
            return false;
        }
    }

    match non_empty(query.keyword.as_deref()) {
        Some(keyword) => [
            survey.content.comment.as_str(),
            survey.content.customer_note.as_str(),
            survey.content.staff_note.as_str(),
            survey.content.environment_note.as_str(),
            store.map(|store| store.profile.name.as_str()).unwrap_or(""),
        ]
        .into_iter()
        .any(|field| contains_folded(field, keyword)),
        None => true,
    }
}

/// Filtered and sorted. `status` restricts the feed to one status, `None`
/// keeps every status.
pub fn select_surveys(
    surveys: Vec<Survey>,
    stores: &HashMap<StoreId, Store>,
    query: &SurveyQuery,
    status: Option<SurveyStatus>,
) -> Vec<Survey> {
    let mut surveys: Vec<Survey> = surveys
        .into_iter()
        .filter(|survey| survey_matches(survey, stores.get(&survey.store_id), query, status))
        .collect();

    sort_surveys(&mut surveys, query.sort);
    surveys
}

/// Top approved surveys for the home page strips.
pub fn featured(surveys: Vec<Survey>, sort: SurveySort) -> Vec<Survey> {
    let mut surveys: Vec<Survey> = surveys
        .into_iter()
        .filter(|survey| survey.status.is_public())
        .collect();

    sort_surveys(&mut surveys, sort);
    surveys.truncate(FEATURED_LIMIT);
    surveys
}
