//! Background work for a pod: cron-style jobs, the ad-hoc task pool and
//! the shared [`Pod`] context both run against.

pub mod dispatcher;
pub mod feedsources;
pub mod jobs;
pub mod pod;
pub mod schedule;
pub mod scheduler;
pub mod tasks;

pub use dispatcher::{DispatchError, Dispatcher, Task, TaskData, TaskState, TaskStatus};
pub use feedsources::{FeedSource, FeedSources};
pub use jobs::{Job, PodStats};
pub use pod::{LogNotifier, Notifier, Pod};
pub use schedule::{Schedule, ScheduleError};
pub use scheduler::Scheduler;
pub use tasks::FetchFeedTask;
