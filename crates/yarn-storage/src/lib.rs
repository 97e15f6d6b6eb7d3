//! On-disk state of a pod: authored feed files, the twt archive and the
//! external avatar cache.

pub mod archive;
pub mod avatars;
pub mod feeds;

pub use archive::DiskArchive;
pub use avatars::ExternalAvatars;
pub use feeds::FeedStore;
