use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use regex::Regex;
use yarn_cache::{Cache, Feed, Fetcher, UserAgent};
use yarn_storage::{DiskArchive, ExternalAvatars, FeedStore};
use yarn_types::{Config, Twt, Twter};

const LAST_MODIFIED: &str = "Wed, 21 Oct 2020 07:28:00 GMT";

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

fn ago(hours: i64) -> String {
    (Utc::now() - TimeDelta::hours(hours)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn feed_body(lines: &[(&str, &str)]) -> String {
    let mut body = String::from("# nick = bob\n");
    for (at, text) in lines {
        body.push_str(&format!("{at}\t{text}\n"));
    }
    body
}

async fn fetcher(dir: &std::path::Path, tweak: impl FnOnce(&mut Config)) -> Fetcher {
    let mut conf = Config {
        base_url: "https://pod.example".into(),
        data: dir.to_path_buf(),
        debug: true,
        ..Config::default()
    };
    tweak(&mut conf);
    conf.validate().unwrap();
    let conf = Arc::new(conf);

    let cache = Cache::new(Arc::clone(&conf)).unwrap();
    let archive = Arc::new(DiskArchive::new(conf.archive_dir()).await.unwrap());
    let feeds = Arc::new(FeedStore::new(conf.feeds_dir()).await.unwrap());
    let avatars = Arc::new(ExternalAvatars::new(conf.external_dir()).await.unwrap());
    Fetcher::new(cache, archive, feeds, avatars)
}

#[derive(Clone)]
struct Remote {
    hits: Arc<AtomicUsize>,
    conditional: Arc<AtomicUsize>,
    body: Arc<String>,
}

async fn remote_feed(State(remote): State<Remote>, headers: HeaderMap) -> impl IntoResponse {
    remote.hits.fetch_add(1, Ordering::SeqCst);
    if headers.get(header::IF_MODIFIED_SINCE).is_some_and(|v| v == LAST_MODIFIED) {
        remote.conditional.fetch_add(1, Ordering::SeqCst);
        return StatusCode::NOT_MODIFIED.into_response();
    }
    (
        [(header::LAST_MODIFIED, LAST_MODIFIED), (header::CONTENT_TYPE, "text/plain")],
        remote.body.as_str().to_owned(),
    )
        .into_response()
}

fn remote(body: String) -> Remote {
    Remote {
        hits: Arc::new(AtomicUsize::new(0)),
        conditional: Arc::new(AtomicUsize::new(0)),
        body: Arc::new(body),
    }
}

#[tokio::test]
async fn not_modified_keeps_cached_twts() {
    let dir = tempfile::tempdir().unwrap();
    let body = feed_body(&[(&ago(1), "newest"), (&ago(2), "older")]);
    let state = remote(body);
    let base = serve(
        Router::new()
            .route("/twtxt.txt", get(remote_feed))
            .with_state(state.clone()),
    )
    .await;
    let url = format!("{base}/twtxt.txt");
    let f = fetcher(dir.path(), |_| {}).await;

    f.fetch_twts(vec![Feed::new("bob", &url)], &BTreeMap::new()).await;
    let first = f.cache().get_by_url(&url).await;
    assert_eq!(first.len(), 2);
    assert_eq!(f.cache().last_modified(&url).await.as_deref(), Some(LAST_MODIFIED));
    for twt in &first {
        assert!(f.archive().has(twt.hash()).await);
    }

    f.fetch_twts(vec![Feed::new("bob", &url)], &BTreeMap::new()).await;
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    assert_eq!(state.conditional.load(Ordering::SeqCst), 1);
    assert_eq!(f.cache().get_by_url(&url).await, first);
    assert_eq!(f.cache().twt_count().await, 2);
}

#[tokio::test]
async fn old_and_future_twts_stay_out_of_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let future = (Utc::now() + TimeDelta::days(2)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let body = feed_body(&[(&future, "from the future"), (&ago(1), "now"), (&ago(24 * 30), "ancient")]);
    let base = serve(
        Router::new()
            .route("/twtxt.txt", get(remote_feed))
            .with_state(remote(body)),
    )
    .await;
    let url = format!("{base}/twtxt.txt");
    let f = fetcher(dir.path(), |_| {}).await;

    f.fetch_twts(vec![Feed::new("bob", &url)], &BTreeMap::new()).await;
    let cached = f.cache().get_by_url(&url).await;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].literal_text(), "now");
    assert_eq!(f.archive().count().await.unwrap(), 2);
}

#[tokio::test]
async fn redirects_rekey_the_feed() {
    let dir = tempfile::tempdir().unwrap();
    let body = feed_body(&[(&ago(1), "moved house")]);
    let base = serve(
        Router::new()
            .route("/old.txt", get(|| async { Redirect::permanent("/new.txt") }))
            .route("/new.txt", get(remote_feed))
            .with_state(remote(body)),
    )
    .await;
    let f = fetcher(dir.path(), |_| {}).await;

    let old = format!("{base}/old.txt");
    let new = format!("{base}/new.txt");
    f.fetch_twts(vec![Feed::new("bob", &old)], &BTreeMap::new()).await;
    assert!(!f.cache().is_cached(&old).await);
    assert_eq!(f.cache().get_by_url(&new).await.len(), 1);
}

#[tokio::test]
async fn oversized_feeds_are_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let filler = "x".repeat(200);
    let body = feed_body(&[(&ago(1), "fits"), (&ago(2), &filler), (&ago(3), &filler)]);
    let base = serve(
        Router::new()
            .route("/twtxt.txt", get(remote_feed))
            .with_state(remote(body)),
    )
    .await;
    let url = format!("{base}/twtxt.txt");
    let f = fetcher(dir.path(), |c| c.max_fetch_limit = 256).await;

    f.fetch_twts(vec![Feed::new("bob", &url)], &BTreeMap::new()).await;
    assert_eq!(f.cache().metrics().snapshot().cache_limited, 1);
    let cached = f.cache().get_by_url(&url).await;
    assert!(!cached.is_empty());
    assert_eq!(cached[0].literal_text(), "fits");
}

#[tokio::test]
async fn blacklisted_feeds_are_never_requested() {
    let dir = tempfile::tempdir().unwrap();
    let state = remote(feed_body(&[(&ago(1), "spam")]));
    let base = serve(
        Router::new()
            .route("/twtxt.txt", get(remote_feed))
            .with_state(state.clone()),
    )
    .await;
    let f = fetcher(dir.path(), |c| {
        c.blacklisted_feeds = vec![Regex::new(r"127\.0\.0\.1").unwrap()];
    })
    .await;

    f.fetch_twts(vec![Feed::new("spam", &format!("{base}/twtxt.txt"))], &BTreeMap::new())
        .await;
    assert_eq!(state.hits.load(Ordering::SeqCst), 0);
    assert_eq!(f.cache().metrics().snapshot().cache_sources, 0);
}

#[tokio::test]
async fn user_agent_names_the_single_follower() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(std::sync::Mutex::new(String::new()));
    let app = {
        let seen = Arc::clone(&seen);
        Router::new().route(
            "/twtxt.txt",
            get(move |headers: HeaderMap| {
                let seen = Arc::clone(&seen);
                async move {
                    let ua = headers
                        .get(header::USER_AGENT)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_owned();
                    *seen.lock().unwrap() = ua;
                    "2021-01-01T00:00:00Z\thi\n"
                }
            }),
        )
    };
    let base = serve(app).await;
    let url = format!("{base}/twtxt.txt");
    let f = fetcher(dir.path(), |_| {}).await;

    let hints = BTreeMap::from([(url.clone(), vec!["alice".to_owned()])]);
    f.fetch_twts(vec![Feed::new("bob", &url)], &hints).await;

    let ua = seen.lock().unwrap().clone();
    let parsed = UserAgent::parse(&ua).unwrap();
    assert!(parsed.is_pod());
    assert!(ua.ends_with("(+https://pod.example/user/alice/twtxt.txt; @alice)"));
}

// ── Peers ───────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Pod {
    info_hits: Arc<AtomicUsize>,
    root: Arc<Twt>,
}

async fn pod_info(State(pod): State<Pod>) -> impl IntoResponse {
    pod.info_hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    axum::Json(serde_json::json!({
        "name": "remote",
        "description": "a remote pod",
        "software_version": "0.9.0",
    }))
}

async fn pod_twt(State(pod): State<Pod>, Path(hash): Path<String>) -> impl IntoResponse {
    if hash == pod.root.hash() {
        axum::Json(pod.root.as_ref().clone()).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn pod(root: Twt) -> (String, Pod) {
    let state = Pod {
        info_hits: Arc::new(AtomicUsize::new(0)),
        root: Arc::new(root),
    };
    let base = serve(
        Router::new()
            .route("/info", get(pod_info))
            .route("/twt/{hash}", get(pod_twt))
            .with_state(state.clone()),
    )
    .await;
    (base, state)
}

fn twt(uri: &str, at: &str, text: &str) -> Twt {
    Twt::make(Twter::new("x", uri), DateTime::parse_from_rfc3339(at).unwrap(), text)
}

#[tokio::test]
async fn concurrent_sightings_fetch_info_once() {
    let dir = tempfile::tempdir().unwrap();
    let (base, state) = pod(twt("https://x.example", "2021-01-01T00:00:00Z", "root")).await;
    let f = fetcher(dir.path(), |_| {}).await;
    let started = Utc::now();

    let ua = UserAgent::parse(&format!("yarnd/0.9 (+{base}/user/bar/twtxt.txt; @bar)")).unwrap();
    let cache = f.cache().clone();
    tokio::join!(cache.observe_peer(&ua), cache.observe_peer(&ua));

    assert_eq!(state.info_hits.load(Ordering::SeqCst), 1);
    let peers = cache.get_peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].uri, base);
    assert_eq!(peers[0].name, "remote");
    assert_eq!(peers[0].software_version, "0.9.0");
    assert!(peers[0].last_seen.unwrap() >= started);

    // Fresh metadata is not refetched.
    cache.observe_peer(&ua).await;
    assert_eq!(state.info_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_peer_leaves_no_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let f = fetcher(dir.path(), |c| c.request_timeout = Duration::from_secs(2)).await;
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    f.cache().add_peer(&base).await;
    assert!(f.cache().get_peer(&base).await.is_none());
}

#[tokio::test]
async fn missing_roots_converge_from_peers() {
    let dir = tempfile::tempdir().unwrap();
    let root = twt("https://x.example/twtxt.txt", "2021-01-01T00:00:00Z", "the root");
    let (base, _) = pod(root.clone()).await;
    let f = fetcher(dir.path(), |_| {}).await;

    let reply_url = format!("{base}/user/bob/twtxt.txt");
    let reply = twt(&reply_url, "2021-01-02T00:00:00Z", &format!("(#{}) replying", root.hash()));
    f.cache().update_feed(&reply_url, "", vec![reply.clone()]).await;
    f.cache().refresh().await;
    f.cache().add_peer(&base).await;
    assert_eq!(f.cache().lookup(root.hash()).await, None);

    assert_eq!(f.converge().await, 1);
    assert_eq!(f.cache().lookup(root.hash()).await, Some(root.clone()));
    assert!(f.archive().has(root.hash()).await);
    let thread = f.cache().get_by_view(&format!("subject:{}", root.hash())).await;
    assert_eq!(thread, vec![reply, root]);

    // Nothing left to find.
    assert_eq!(f.converge().await, 0);
}
