//! Background tasks
//!
//! Long-lived loops (delivery retries, outbox harvest, backtrack batching,
//! fact maintenance) run under a [`Supervisor`] that hands each a stop
//! signal. HTTP requests in flight are counted by [`InflightTracker`] so the
//! binary can drain them before exiting.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::data::Database;
use crate::federation::{KeyResolver, Normalizer};

/// Interval between pruning passes over cached key facts.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(50 * 60);

/// Owns named background tasks and their shared stop signal.
pub struct Supervisor {
    stop: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            tasks: Vec::new(),
        }
    }

    /// Spawn `task` with its own stop receiver.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.stop.subscribe()));
        tracing::debug!(task = name, "Background task spawned");
        self.tasks.push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Signal stop and wait for every task, at most `grace` in total.
    ///
    /// Returns the names of tasks that did not finish in time; they are
    /// aborted.
    pub async fn shutdown(self, grace: Duration) -> Vec<&'static str> {
        self.stop.send_replace(true);
        let deadline = tokio::time::Instant::now() + grace;
        let mut overran = Vec::new();

        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Background task stopped"),
                Ok(Err(error)) => tracing::error!(task = name, %error, "Background task failed"),
                Err(_) => {
                    tracing::warn!(task = name, "Background task overran shutdown grace");
                    handle.abort();
                    overran.push(name);
                }
            }
        }
        overran
    }
}

/// Waits for `interval` or a stop signal. Returns false on stop.
async fn pause(interval: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = stop.changed() => false,
    }
}

/// Periodically import recent posts from every followed actor's outbox.
pub async fn harvest_sweep(
    db: Arc<Database>,
    normalizer: Arc<Normalizer>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    while pause(interval, &mut stop).await {
        let follows = match db.list_follows().await {
            Ok(follows) => follows,
            Err(error) => {
                tracing::error!(%error, "Unable to list follows for harvest");
                continue;
            }
        };

        let mut imported = 0;
        for (owner_id, actor) in follows {
            if *stop.borrow() {
                break;
            }
            let owner = match db.get_user(&owner_id).await {
                Ok(Some(owner)) => owner,
                Ok(None) => continue,
                Err(error) => {
                    tracing::error!(%error, "Unable to load follow owner");
                    continue;
                }
            };
            match normalizer.harvest_outbox(&owner, &actor).await {
                Ok(posts) => imported += posts.len(),
                Err(error) => tracing::info!(%actor, %error, "Outbox harvest failed"),
            }
        }
        tracing::info!(imported, "Outbox harvest finished");
    }
    tracing::debug!("Harvest sweep stopped");
}

/// Prune stale key facts every [`MAINTENANCE_INTERVAL`].
pub async fn maintenance_sweep(keys: Arc<KeyResolver>, mut stop: watch::Receiver<bool>) {
    while pause(MAINTENANCE_INTERVAL, &mut stop).await {
        if let Err(error) = keys.prune().await {
            tracing::error!(%error, "Key fact pruning failed");
        }
    }
    tracing::debug!("Maintenance sweep stopped");
}

/// Counts HTTP requests currently being served.
#[derive(Clone, Default)]
pub struct InflightTracker {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

pub struct InflightGuard(InflightTracker);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl InflightTracker {
    pub fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Count work until the returned guard drops. Shutdown waits for it.
    pub fn enter(&self) -> InflightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InflightGuard(self.clone())
    }

    /// Resolves once no request is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Let `server` finish its connections and wait for in-flight work.
///
/// Returns `Ok(false)` when `deadline` passes first.
pub async fn drain<F>(
    server: F,
    inflight: &InflightTracker,
    deadline: tokio::time::Instant,
) -> std::io::Result<bool>
where
    F: Future<Output = std::io::Result<()>>,
{
    let finished = tokio::time::timeout_at(deadline, async {
        server.await?;
        inflight.wait_idle().await;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match finished {
        Ok(result) => result.map(|()| true),
        Err(_) => Ok(false),
    }
}

/// Axum middleware counting in-flight requests.
pub async fn track_inflight(
    State(tracker): State<InflightTracker>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = tracker.enter();
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_tasks_that_overrun() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("polite", |mut stop| async move {
            let _ = stop.changed().await;
        });
        supervisor.spawn("stubborn", |_stop| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(supervisor.names(), vec!["polite", "stubborn"]);

        let overran = supervisor.shutdown(Duration::from_secs(5)).await;
        assert_eq!(overran, vec!["stubborn"]);
    }

    #[tokio::test]
    async fn pause_returns_false_once_stopped() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        assert!(!pause(Duration::from_secs(3600), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_on_connections_that_never_close() {
        let tracker = InflightTracker::default();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

        let drained = drain(std::future::pending(), &tracker, deadline).await.unwrap();
        assert!(!drained);
        assert!(tokio::time::Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_requests_after_the_server_stops() {
        let tracker = InflightTracker::default();
        let guard = tracker.enter();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(guard);
        });
        assert!(drain(async { Ok(()) }, &tracker, deadline).await.unwrap());

        let stuck = tracker.enter();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        assert!(!drain(async { Ok(()) }, &tracker, deadline).await.unwrap());
        drop(stuck);
    }

    #[tokio::test]
    async fn inflight_tracker_waits_for_requests() {
        let tracker = InflightTracker::default();
        tokio_test::assert_ready!(tokio_test::task::spawn(tracker.wait_idle()).poll());

        let guard = tracker.enter();
        assert_eq!(tracker.current(), 1);

        let mut waiting = tokio_test::task::spawn(tracker.wait_idle());
        tokio_test::assert_pending!(waiting.poll());

        drop(guard);
        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());
        assert_eq!(tracker.current(), 0);
    }
}
