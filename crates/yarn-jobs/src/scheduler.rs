use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::schedule::Schedule;

type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Entry {
    name: String,
    schedule: Schedule,
    run: JobFn,
}

/// Runs registered jobs on their schedules. Each job runs serially with
/// itself; a run in progress is allowed to finish on stop.
pub struct Scheduler {
    entries: Vec<Entry>,
    token: CancellationToken,
    running: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            token: CancellationToken::new(),
            running: Mutex::new(JoinSet::new()),
        }
    }

    pub fn add<F, Fut>(&mut self, name: &str, schedule: Schedule, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.entries.push(Entry {
            name: name.to_owned(),
            schedule,
            run: Arc::new(move || Box::pin(job())),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Spawn one driver per job.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        for entry in &self.entries {
            let name = entry.name.clone();
            let schedule = entry.schedule.clone();
            let run = Arc::clone(&entry.run);
            let token = self.token.clone();
            running.spawn(drive(name, schedule, run, token));
        }
        info!("Scheduler started with {} jobs", self.entries.len());
    }

    /// Stop scheduling new runs and wait for runs in progress.
    pub async fn stop(&self) {
        self.token.cancel();
        let mut running = self.running.lock().await;
        while let Some(res) = running.join_next().await {
            if let Err(e) = res {
                warn!("job driver failed: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn drive(name: String, schedule: Schedule, run: JobFn, token: CancellationToken) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            warn!("job {} has no upcoming run", name);
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        debug!("Running job {}", name);
        run().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn runs_jobs_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        {
            let count = Arc::clone(&count);
            scheduler.add("tick", Schedule::Every(Duration::from_millis(20)), move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(scheduler.names(), vec!["tick"]);

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop().await;

        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {seen} times");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
