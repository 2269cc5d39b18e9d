//! Run-scoped result store
//!
//! The store is an actor: one task owns the record list and the snapshot
//! file, and every mutation arrives as a message. Workers talk to it
//! through a cloneable [`StoreHandle`].
//!
//! After each accepted append the whole list is rewritten to the snapshot
//! file as a pretty-printed JSON array. Write failures are logged and the
//! record stays in memory.

use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use wafer_common::{Error, Result, WaferRecord};

const COMMAND_BUFFER: usize = 64;

/// Result of an append request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored; `total` is the record count including this one
    Accepted { total: usize },
    /// The wafer cap was already reached; the record was discarded
    CapReached,
    /// The store task is gone
    Closed,
}

enum StoreCommand {
    Append {
        record: Box<WaferRecord>,
        reply: oneshot::Sender<AppendOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<WaferRecord>>,
    },
}

/// Cloneable access to a running [`ResultStore`]
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
    count: watch::Receiver<usize>,
    cap: Option<usize>,
}

impl StoreHandle {
    /// Append one record (waits for the write to finish)
    pub async fn append(&self, record: WaferRecord) -> AppendOutcome {
        let (reply, response) = oneshot::channel();
        let command = StoreCommand::Append {
            record: Box::new(record),
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return AppendOutcome::Closed;
        }
        response.await.unwrap_or(AppendOutcome::Closed)
    }

    /// Copy of every stored record in arrival order
    pub async fn snapshot(&self) -> Result<Vec<WaferRecord>> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(StoreCommand::Snapshot { reply })
            .await
            .map_err(|_| Error::Internal("Result store closed".to_string()))?;
        response
            .await
            .map_err(|_| Error::Internal("Result store closed".to_string()))
    }

    /// Current record count (lock-free)
    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }
}

/// Owner of a run's records and snapshot file
pub struct ResultStore {
    records: Vec<WaferRecord>,
    results_file: PathBuf,
    cap: Option<usize>,
    rx: mpsc::Receiver<StoreCommand>,
    count_tx: watch::Sender<usize>,
}

impl ResultStore {
    /// Start the store task
    ///
    /// The task runs until every handle is dropped and then yields the
    /// final record list.
    pub fn spawn(
        results_file: PathBuf,
        cap: Option<usize>,
    ) -> (StoreHandle, JoinHandle<Vec<WaferRecord>>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (count_tx, count) = watch::channel(0);

        let handle = StoreHandle {
            tx,
            count,
            cap,
        };
        let store = Self {
            records: Vec::new(),
            results_file,
            cap,
            rx,
            count_tx,
        };

        info!(results_file = %store.results_file.display(), ?cap, "Result store started");
        (handle, tokio::spawn(store.run()))
    }

    async fn run(mut self) -> Vec<WaferRecord> {
        while let Some(command) = self.rx.recv().await {
            match command {
                StoreCommand::Append { record, reply } => {
                    let outcome = self.append(*record).await;
                    let _ = reply.send(outcome);
                }
                StoreCommand::Snapshot { reply } => {
                    let _ = reply.send(self.records.clone());
                }
            }
        }
        debug!(records = self.records.len(), "Result store closed");
        self.records
    }

    async fn append(&mut self, record: WaferRecord) -> AppendOutcome {
        if self.cap.is_some_and(|cap| self.records.len() >= cap) {
            debug!(wafer_id = %record.wafer_id, "Wafer cap reached, record discarded");
            return AppendOutcome::CapReached;
        }

        self.records.push(record);
        let total = self.records.len();
        self.count_tx.send_replace(total);
        self.persist().await;
        AppendOutcome::Accepted { total }
    }

    /// Rewrite the snapshot file with the full list
    async fn persist(&self) {
        let json = match serde_json::to_vec_pretty(&self.records) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize results");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.results_file, json).await {
            error!(
                results_file = %self.results_file.display(),
                error = %e,
                "Failed to save results"
            );
        }
    }
}
