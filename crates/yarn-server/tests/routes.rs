use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{SubsecRound, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;
use yarn_jobs::Pod;
use yarn_types::{Config, Twt};

async fn pod(dir: &std::path::Path) -> Pod {
    let mut conf = Config {
        base_url: "https://pod.example".into(),
        data: dir.to_path_buf(),
        name: "testpod".into(),
        description: "a pod under test".into(),
        ..Config::default()
    };
    conf.validate().unwrap();
    Pod::open(conf).await.unwrap()
}

async fn get(pod: &Pod, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    request(pod, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn request(pod: &Pod, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let res = yarn_server::router(pod.clone()).oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let body = res.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn info_describes_the_pod() {
    let dir = tempfile::tempdir().unwrap();
    let pod = pod(dir.path()).await;

    let (status, headers, body) = get(&pod, "/info").await;
    assert_eq!(status, StatusCode::OK);
    let info = json(&body);
    assert_eq!(info["name"], "testpod");
    assert_eq!(info["description"], "a pod under test");
    assert!(
        headers["powered-by"].to_str().unwrap().starts_with("yarnd/"),
        "{:?}",
        headers["powered-by"]
    );
}

#[tokio::test]
async fn twts_come_from_cache_then_archive() {
    let dir = tempfile::tempdir().unwrap();
    let pod = pod(dir.path()).await;
    pod.db.create_user("alice", false, Utc::now()).unwrap();
    let posted = pod.publisher.publish("alice", None, "hello #yarn", None).await.unwrap();

    let (status, _, body) = get(&pod, &format!("/twt/{}", posted.hash())).await;
    assert_eq!(status, StatusCode::OK);
    let twt: Twt = serde_json::from_slice(&body).unwrap();
    assert_eq!(twt.hash(), posted.hash());

    let at = Utc::now().trunc_subsecs(0).fixed_offset();
    let archived = Twt::make(pod.conf.local_twter("old"), at, "only on disk");
    pod.archive.archive(&archived).await.unwrap();
    let (status, _, _) = get(&pod, &format!("/twt/{}", archived.hash())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = get(&pod, "/twt/zzzzzzz").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn feed_fetch_records_follower() {
    let dir = tempfile::tempdir().unwrap();
    let pod = pod(dir.path()).await;
    pod.db.create_user("alice", false, Utc::now()).unwrap();
    pod.publisher.publish("alice", None, "first", None).await.unwrap();

    let req = Request::get("/user/alice/twtxt.txt")
        .header(header::USER_AGENT, "twtxt/1.2.3 (+https://b.example/twtxt.txt; @bob)")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = request(&pod, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));
    assert!(String::from_utf8(body).unwrap().contains("\tfirst\n"));

    let mut followers = pod.cache.get_followers("alice").await;
    for _ in 0..50 {
        if !followers.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        followers = pod.cache.get_followers("alice").await;
    }
    assert_eq!(
        followers.get("https://b.example/twtxt.txt").map(|f| f.nick.as_str()),
        Some("bob")
    );

    let (status, _, _) = get(&pod, "/user/nobody/twtxt.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn who_follows_lists_local_followers() {
    let dir = tempfile::tempdir().unwrap();
    let pod = pod(dir.path()).await;
    for user in ["alice", "carol"] {
        pod.db.create_user(user, false, Utc::now()).unwrap();
        pod.db.follow(user, "bob", "https://b.example/twtxt.txt").unwrap();
    }

    let (status, _, body) = get(&pod, "/whoFollows?followers=2&uri=https%3A%2F%2Fb.example%2Ftwtxt.txt").await;
    assert_eq!(status, StatusCode::OK);
    let map = json(&body);
    assert_eq!(map["alice"], "https://pod.example/user/alice/twtxt.txt");
    assert_eq!(map["carol"], "https://pod.example/user/carol/twtxt.txt");
}

#[tokio::test]
async fn views_are_paged() {
    let dir = tempfile::tempdir().unwrap();
    let pod = pod(dir.path()).await;
    pod.db.create_user("alice", false, Utc::now()).unwrap();
    pod.publisher.publish("alice", None, "one #paged", None).await.unwrap();

    let (status, _, body) = get(&pod, "/view/tag:paged?page=1&size=10").await;
    assert_eq!(status, StatusCode::OK);
    let page = json(&body);
    assert_eq!(page["total"], 1);
    assert_eq!(page["twts"].as_array().unwrap().len(), 1);

    let (_, _, body) = get(&pod, "/view/tag:nothing").await;
    assert_eq!(json(&body)["total"], 0);

    // The post rebuilt alice's timeline; it is not served to strangers.
    assert_eq!(pod.cache.get_by_view("user:alice").await.len(), 1);
    for key in ["user:alice", "mentions:alice", "uview:alice:local"] {
        let (status, _, _) = get(&pod, &format!("/view/{key}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{key}");
    }
}

#[tokio::test]
async fn external_fetch_is_tracked_as_task() {
    let dir = tempfile::tempdir().unwrap();
    let pod = pod(dir.path()).await;

    let req = Request::post("/external")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"nick":"ghost","url":"http://127.0.0.1:9/twtxt.txt"}"#))
        .unwrap();
    let (status, _, body) = request(&pod, req).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = json(&body)["task"].as_str().unwrap().to_owned();

    let mut state = serde_json::Value::Null;
    for _ in 0..200 {
        let (status, _, body) = get(&pod, &format!("/task/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        state = json(&body);
        if state["state"] == "failed" || state["state"] == "complete" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state["state"], "failed", "{state}");
    assert_eq!(state["name"], "FetchFeed");

    let (status, _, _) = get(&pod, &format!("/task/{}", uuid::Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = get(&pod, "/task/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
