use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use yarn_cache::{PeerInfo, UserAgent, is_global_view};
use yarn_jobs::{DispatchError, FetchFeedTask, Pod, TaskState};
use yarn_types::urls::normalize_url;
use yarn_types::{Twt, VERSION};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

// ── Request/response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WhoFollowsQuery {
    pub uri: String,
}

#[derive(Debug, Deserialize)]
pub struct ExternalRequest {
    pub nick: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub task: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ViewPage {
    pub twts: Vec<Twt>,
    pub page: usize,
    pub pages: usize,
    pub total: usize,
}

/// Slice one 1-based page out of `twts`.
pub fn paginate(twts: Vec<Twt>, q: &PageQuery) -> ViewPage {
    let size = q.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let total = twts.len();
    let pages = total.div_ceil(size).max(1);
    let page = q.page.unwrap_or(1).clamp(1, pages);
    let twts = twts.into_iter().skip((page - 1) * size).take(size).collect();
    ViewPage {
        twts,
        page,
        pages,
        total,
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET /info: what this pod is, for peers.
pub async fn info(State(pod): State<Pod>) -> Json<PeerInfo> {
    Json(PeerInfo {
        name: pod.conf.name.clone(),
        description: pod.conf.description.clone(),
        software_version: VERSION.to_owned(),
    })
}

/// GET /twt/{hash}: a single twt from the cache, falling back to the archive.
pub async fn twt(State(pod): State<Pod>, Path(hash): Path<String>) -> Result<Json<Twt>, StatusCode> {
    if let Some(twt) = pod.cache.lookup(&hash).await {
        return Ok(Json(twt));
    }
    if !pod.archive.has(&hash).await {
        return Err(StatusCode::NOT_FOUND);
    }
    match pod.archive.get(&hash).await {
        Ok(Some(twt)) => Ok(Json(twt)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("error reading archived twt {}: {:#}", hash, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /user/{nick}/twtxt.txt: the raw feed. Whoever fetches it is
/// recorded as a follower and, if it is a pod, as a peer.
pub async fn feed(
    State(pod): State<Pod>,
    Path(nick): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    if !pod.feeds.exists(&nick).await {
        return Err(StatusCode::NOT_FOUND);
    }
    let body = pod.feeds.read(&nick).await.map_err(|e| {
        warn!("error reading feed {}: {:#}", nick, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if let Some(ua) = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .and_then(UserAgent::parse)
    {
        debug!("{} fetched feed {}", ua.client(), nick);
        let cache = pod.cache.clone();
        tokio::spawn(async move {
            cache.observe_follower(&ua, &nick).await;
            cache.observe_peer(&ua).await;
        });
    }

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body))
}

/// GET /whoFollows?uri=: local users following `uri`, as nick → feed URL.
pub async fn who_follows(
    State(pod): State<Pod>,
    Query(q): Query<WhoFollowsQuery>,
) -> Result<Json<BTreeMap<String, String>>, StatusCode> {
    let uri = normalize_url(&q.uri);
    if uri.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let followed = pod.db.get_followed_feeds().map_err(|e| {
        warn!("error loading follows: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let followers = followed
        .iter()
        .find(|(url, _)| normalize_url(url) == uri)
        .map(|(_, users)| {
            users
                .iter()
                .map(|u| (u.clone(), pod.conf.url_for_user(u)))
                .collect()
        })
        .unwrap_or_default();
    Ok(Json(followers))
}

/// POST /external: queue a fetch of a feed the pod does not follow.
pub async fn external(
    State(pod): State<Pod>,
    Json(req): Json<ExternalRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let url = normalize_url(&req.url);
    if url.is_empty() || req.nick.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if pod.conf.is_blacklisted(&url) {
        return Err(StatusCode::FORBIDDEN);
    }
    let task = FetchFeedTask::new(pod.fetcher.clone(), req.nick.trim(), &url);
    match pod.dispatcher.dispatch(task).await {
        Ok(id) => Ok((StatusCode::ACCEPTED, Json(ExternalResponse { task: id }))),
        Err(DispatchError::Stopped) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// GET /task/{id}
pub async fn task(State(pod): State<Pod>, Path(id): Path<Uuid>) -> Result<Json<TaskState>, StatusCode> {
    pod.dispatcher
        .lookup(&id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /view/{key}?page=&size=: global views only; per-user views stay private.
pub async fn view(
    State(pod): State<Pod>,
    Path(key): Path<String>,
    Query(q): Query<PageQuery>,
) -> Result<Json<ViewPage>, StatusCode> {
    if !is_global_view(&key) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(paginate(pod.cache.get_by_view(&key).await, &q)))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use yarn_types::Twter;

    use super::*;

    fn twts(n: usize) -> Vec<Twt> {
        let at = DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z").unwrap();
        (0..n)
            .map(|i| Twt::make(Twter::new("bob", "https://b.example/twtxt.txt"), at, &format!("twt {i}")))
            .collect()
    }

    #[test]
    fn pages_are_clamped() {
        let page = paginate(twts(45), &PageQuery { page: Some(3), size: Some(20) });
        assert_eq!((page.page, page.pages, page.total, page.twts.len()), (3, 3, 45, 5));

        let page = paginate(twts(45), &PageQuery { page: Some(9), size: None });
        assert_eq!(page.page, 3);

        let page = paginate(Vec::new(), &PageQuery::default());
        assert_eq!((page.page, page.pages, page.twts.len()), (1, 1, 0));

        let page = paginate(twts(5), &PageQuery { page: Some(0), size: Some(1000) });
        assert_eq!((page.page, page.twts.len()), (1, 5));
    }
}
