//! Backtrack batching
//!
//! Remembers which remote actors fetched which local objects so later
//! deletes and updates can be sent back to them. Records are buffered in
//! memory and written in one transaction.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::data::Database;

/// How often buffered records are written out.
pub const TRACK_FLUSH_INTERVAL: Duration = Duration::from_secs(4 * 60);

const CHANNEL_CAPACITY: usize = 4096;

enum Command {
    Record { object_uri: String, fetcher: String },
    Flush(oneshot::Sender<()>),
}

/// Cheap handle used by request handlers and the delivery engine.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<Command>,
}

impl TrackerHandle {
    /// Note that `fetcher` retrieved `object_uri`. Dropped when the buffer is full.
    pub fn record(&self, object_uri: &str, fetcher: &str) {
        let command = Command::Record {
            object_uri: object_uri.to_string(),
            fetcher: fetcher.to_string(),
        };
        if self.tx.try_send(command).is_err() {
            tracing::debug!(%object_uri, %fetcher, "Track buffer unavailable, dropping record");
        }
    }

    /// Write out everything recorded so far. Returns once the batch is stored,
    /// or immediately when the tracker is not running.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).await.is_err() {
            return;
        }
        let _ = wait.await;
    }
}

/// The batching task.
pub struct Tracker {
    db: Arc<Database>,
    rx: mpsc::Receiver<Command>,
    pending: HashSet<(String, String)>,
}

impl Tracker {
    pub fn new(db: Arc<Database>) -> (TrackerHandle, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let tracker = Self {
            db,
            rx,
            pending: HashSet::new(),
        };
        (TrackerHandle { tx }, tracker)
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TRACK_FLUSH_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.write().await,
                command = self.rx.recv() => match command {
                    Some(Command::Record { object_uri, fetcher }) => {
                        self.pending.insert((object_uri, fetcher));
                    }
                    Some(Command::Flush(done)) => {
                        self.write().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = stop.changed() => break,
            }
        }

        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Record { object_uri, fetcher } => {
                    self.pending.insert((object_uri, fetcher));
                }
                Command::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        self.write().await;
        tracing::debug!("Tracker stopped");
    }

    async fn write(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch: Vec<(String, String)> = self.pending.drain().collect();
        let count = batch.len();
        match self.db.record_tracks(batch).await {
            Ok(()) => tracing::debug!(count, "Stored backtrack records"),
            Err(error) => tracing::warn!(%error, count, "Failed to store backtrack records"),
        }
    }
}
