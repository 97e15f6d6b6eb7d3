//! HTTP surface of `yarnd`: the federation endpoints other pods and feed
//! readers talk to.

pub mod routes;

use axum::{
    Router,
    http::HeaderValue,
    response::Response,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use yarn_jobs::Pod;
use yarn_types::{SOFTWARE, VERSION};

/// Advertise the pod software so fetchers can discover us as a peer.
async fn powered_by(mut res: Response) -> Response {
    if let Ok(value) = HeaderValue::from_str(&format!("{SOFTWARE}/{VERSION}")) {
        res.headers_mut().insert("powered-by", value);
    }
    res
}

pub fn router(pod: Pod) -> Router {
    Router::new()
        .route("/info", get(routes::info))
        .route("/health", get(routes::health))
        .route("/twt/{hash}", get(routes::twt))
        .route("/user/{nick}/twtxt.txt", get(routes::feed))
        .route("/whoFollows", get(routes::who_follows))
        .route("/external", post(routes::external))
        .route("/task/{id}", get(routes::task))
        .route("/view/{key}", get(routes::view))
        .layer(axum::middleware::map_response(powered_by))
        .layer(TraceLayer::new_for_http())
        .with_state(pod)
}
