use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, SET_COOKIE},
    },
    middleware::{Next, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::{
    auth::bearer,
    error::AppError,
    helpful,
    listing::{
        DEFAULT_QUEUE_LIMIT, DEFAULT_STORE_LIMIT, DEFAULT_SURVEY_LIMIT, StoreFilter, SurveyQuery,
        SurveySort, browse, featured, paginate, public_surveys, search_stores, select_surveys,
    },
    models::{Store, StoreId, Survey, SurveyId, SurveyStatus},
    state::AppState,
    utils::{
        ContentPayload, HelpfulPayload, MAX_BODY_BYTES, ReassignPayload, StatusPayload,
        StoreCreatePayload, SubmissionPayload, SurveyPatch, parse_json,
    },
    voter::cookie_values,
};

type SharedState = Arc<AppState>;

const ADMIN_MODERATOR: &str = "admin";

pub fn router(state: SharedState) -> Router {
    let admin = Router::new()
        .route(
            "/stores",
            get(admin_stores_handler).post(create_store_handler),
        )
        .route("/stores/{id}", get(admin_store_handler))
        .route("/stores/{id}/surveys", post(create_survey_handler))
        .route("/stores/{id}/recalculate", post(recalculate_handler))
        .route("/surveys", get(admin_surveys_handler))
        .route(
            "/surveys/{id}",
            get(admin_survey_handler).patch(update_survey_handler),
        )
        .route("/surveys/{id}/status", put(status_handler))
        .route("/surveys/{id}/store", put(reassign_handler))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_handler))
        .route("/stores", get(stores_handler))
        .route("/stores/{id}", get(store_handler))
        .route("/stores/{id}/surveys", get(store_surveys_handler))
        .route("/surveys", get(feed_handler).post(submit_handler))
        .route("/surveys/new", get(newest_handler))
        .route("/surveys/high-rated", get(high_rated_handler))
        .route("/surveys/{id}", get(survey_handler))
        .route("/surveys/{id}/helpful", post(helpful_handler))
        .nest("/admin", admin)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

async fn require_admin(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer)
        .ok_or(AppError::Unauthorized)?;

    let expected = state.config.admin_token.as_bytes();
    if expected.is_empty() || !bool::from(token.as_bytes().ct_eq(expected)) {
        warn!("Rejected admin request to {}", request.uri().path());
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}

/// Ids in public paths that do not parse are simply not found.
fn survey_path(raw: &str) -> Result<SurveyId, AppError> {
    raw.parse().map_err(|_| AppError::NotFound("Survey"))
}

fn store_path(raw: &str) -> Result<StoreId, AppError> {
    raw.parse().map_err(|_| AppError::NotFound("Store"))
}

/// Drops the contact address and reduces attribution to a display name.
fn public_survey(survey: &Survey) -> Result<Value, AppError> {
    let mut value = serde_json::to_value(survey)?;

    if let Some(object) = value.as_object_mut() {
        object.remove("contactEmail");
        object.remove("moderation");
        object.remove("submitter");
        if let Some(submitter) = &survey.submitter {
            object.insert("reviewer".to_string(), json!(submitter.display_name()));
        }
    }

    Ok(value)
}

/// Public view plus the store name and region the feed cards show.
fn feed_item(survey: &Survey, stores: &HashMap<StoreId, Store>) -> Result<Value, AppError> {
    let mut value = public_survey(survey)?;

    if let (Some(object), Some(store)) = (value.as_object_mut(), stores.get(&survey.store_id)) {
        object.insert("storeName".to_string(), json!(store.profile.name));
        object.insert("branchName".to_string(), json!(store.profile.branch_name));
        object.insert("region".to_string(), json!(store.profile.region));
    }

    Ok(value)
}

async fn store_index(state: &AppState) -> Result<HashMap<StoreId, Store>, AppError> {
    Ok(state
        .repository
        .list_stores()
        .await?
        .into_iter()
        .map(|store| (store.id, store))
        .collect())
}

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn stores_handler(
    State(state): State<SharedState>,
    Query(filter): Query<StoreFilter>,
) -> Result<impl IntoResponse, AppError> {
    let stores = browse(state.repository.list_stores().await?, &filter);

    Ok(Json(paginate(
        stores,
        filter.page,
        filter.limit,
        DEFAULT_STORE_LIMIT,
    )))
}

pub async fn store_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let store = state
        .repository
        .find_store(store_path(&id)?)
        .await?
        .ok_or(AppError::NotFound("Store"))?;

    Ok(Json(store))
}

pub async fn store_surveys_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let store_id = store_path(&id)?;
    if state.repository.find_store(store_id).await?.is_none() {
        return Err(AppError::NotFound("Store"));
    }

    let surveys = public_surveys(state.repository.surveys_for_store(store_id).await?)
        .iter()
        .map(public_survey)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(surveys))
}

pub async fn feed_handler(
    State(state): State<SharedState>,
    Query(query): Query<SurveyQuery>,
) -> Result<impl IntoResponse, AppError> {
    let stores = store_index(&state).await?;
    let surveys = select_surveys(
        state.repository.list_surveys().await?,
        &stores,
        &query,
        Some(SurveyStatus::Approved),
    );

    let page = paginate(surveys, query.page, query.limit, DEFAULT_SURVEY_LIMIT);
    let items = page
        .items
        .iter()
        .map(|survey| feed_item(survey, &stores))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(json!({
        "items": items,
        "page": page.page,
        "limit": page.limit,
        "total": page.total,
    })))
}

async fn featured_feed(state: &AppState, sort: SurveySort) -> Result<Json<Vec<Value>>, AppError> {
    let stores = store_index(state).await?;

    featured(state.repository.list_surveys().await?, sort)
        .iter()
        .map(|survey| feed_item(survey, &stores))
        .collect::<Result<Vec<_>, _>>()
        .map(Json)
}

pub async fn newest_handler(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, AppError> {
    featured_feed(&state, SurveySort::Newest).await
}

pub async fn high_rated_handler(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, AppError> {
    featured_feed(&state, SurveySort::Helpful).await
}

pub async fn survey_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let survey = state
        .repository
        .find_survey(survey_path(&id)?)
        .await?
        .filter(|survey| survey.status.is_public())
        .ok_or(AppError::NotFound("Survey"))?;

    Ok(Json(public_survey(&survey)?))
}

pub async fn submit_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let submitter = match &state.verifier {
        Some(verifier) => Some(verifier.from_headers(&headers)?),
        None => None,
    };

    let now = Utc::now();
    let payload: SubmissionPayload = parse_json(&body)?;
    let (draft, content) = payload.split(now)?;

    let outcome = state
        .commands
        .submit_survey(draft, content, submitter, now)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "survey": public_survey(&outcome.value.survey)?,
            "store": outcome.value.store,
            "warnings": outcome.warnings,
        })),
    ))
}

pub async fn helpful_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let payload = HelpfulPayload::from_body(&body)?;
    let survey_id = survey_path(&id)?;

    let now = Utc::now();
    let (voter_id, set_cookie) = state.voters.ensure(&cookie_values(&headers), now);

    let count = helpful::toggle(
        state.repository.as_ref(),
        survey_id,
        &voter_id,
        payload.helpful,
        now,
    )
    .await?;

    let mut response = Json(json!({
        "helpfulCount": count,
        "helpful": payload.helpful,
    }))
    .into_response();

    if let Some(cookie) = set_cookie {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => warn!("Voter cookie not attachable: {e}"),
        }
    }

    Ok(response)
}

pub async fn admin_stores_handler(
    State(state): State<SharedState>,
    Query(filter): Query<StoreFilter>,
) -> Result<impl IntoResponse, AppError> {
    let stores = search_stores(state.repository.list_stores().await?, &filter);

    Ok(Json(paginate(
        stores,
        filter.page,
        filter.limit,
        DEFAULT_STORE_LIMIT,
    )))
}

/// Store plus every survey attached to it, any status, newest first.
pub async fn admin_store_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let store = state
        .repository
        .find_store(store_path(&id)?)
        .await?
        .ok_or(AppError::NotFound("Store"))?;

    let mut surveys = state.repository.surveys_for_store(store.id).await?;
    surveys.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(Json(json!({ "store": store, "surveys": surveys })))
}

/// Moderation queue. `status=pending` narrows it to what still needs a decision.
pub async fn admin_surveys_handler(
    State(state): State<SharedState>,
    Query(query): Query<SurveyQuery>,
) -> Result<impl IntoResponse, AppError> {
    let stores = store_index(&state).await?;
    let surveys = select_surveys(
        state.repository.list_surveys().await?,
        &stores,
        &query,
        query.status,
    );

    Ok(Json(paginate(
        surveys,
        query.page,
        query.limit,
        DEFAULT_QUEUE_LIMIT,
    )))
}

pub async fn create_store_handler(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: StoreCreatePayload = parse_json(&body)?;
    let (profile, taxonomy) = payload.validate()?;

    let store = state
        .commands
        .create_store(profile, taxonomy, Utc::now())
        .await?;

    Ok((StatusCode::CREATED, Json(store)))
}

pub async fn create_survey_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let store_id: StoreId = id.parse()?;
    let now = Utc::now();
    let content = parse_json::<ContentPayload>(&body)?.validate(now)?;

    let outcome = state.commands.create_survey(store_id, content, now).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "survey": outcome.value, "warnings": outcome.warnings })),
    ))
}

pub async fn recalculate_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state
        .commands
        .recalculate_store(store_path(&id)?, Utc::now())
        .await?;

    Ok(Json(stats))
}

pub async fn admin_survey_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let survey = state
        .repository
        .find_survey(survey_path(&id)?)
        .await?
        .ok_or(AppError::NotFound("Survey"))?;

    Ok(Json(survey))
}

pub async fn update_survey_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let patch: SurveyPatch = parse_json(&body)?;

    let outcome = state
        .commands
        .update_survey(survey_path(&id)?, patch, Utc::now())
        .await?;

    Ok(Json(json!({ "survey": outcome.value, "warnings": outcome.warnings })))
}

pub async fn status_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: StatusPayload = parse_json(&body)?;

    let outcome = state
        .commands
        .set_status(
            survey_path(&id)?,
            payload.status,
            payload.reason,
            Some(ADMIN_MODERATOR.to_string()),
            Utc::now(),
        )
        .await?;

    Ok(Json(json!({ "survey": outcome.value, "warnings": outcome.warnings })))
}

pub async fn reassign_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: ReassignPayload = parse_json(&body)?;

    let outcome = state
        .commands
        .reassign_store(survey_path(&id)?, payload.store_id()?, Utc::now())
        .await?;

    Ok(Json(json!({ "survey": outcome.value, "warnings": outcome.warnings })))
}
