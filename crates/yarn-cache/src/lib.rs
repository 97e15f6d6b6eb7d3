//! The federated side of a pod: the in-memory feed cache and its views,
//! the fetch and convergence engines, peer and follower tracking, and the
//! post path that feeds local twts straight into the cache.

pub mod cache;
pub mod converge;
pub mod error;
pub mod fetch;
pub mod followers;
pub mod gopher;
pub mod metrics;
pub mod peers;
pub mod persist;
pub mod publish;
pub mod views;

pub use cache::{Cache, Cached};
pub use error::{FetchError, PublishError};
pub use fetch::{Feed, Fetcher, read_limited};
pub use followers::{FOLLOWER_MAX_AGE, Follower};
pub use metrics::{Metrics, MetricsSnapshot};
pub use peers::{Peer, PeerInfo, UserAgent};
pub use publish::Publisher;
pub use views::{UserContext, is_global_view};
