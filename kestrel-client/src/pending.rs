//! Records between submission and completion
//!
//! Every record accepted by a channel holds a [`PendingTicket`]. Tickets are
//! numbered in submission order and released when the record's writer is
//! answered, wherever the record travelled in between. A flush remembers the
//! next number and waits until every lower ticket is gone.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::Result;

#[derive(Debug, Default)]
struct PendingState {
    next: u64,
    outstanding: BTreeSet<u64>,
}

#[derive(Debug)]
pub(crate) struct PendingRecords {
    state: Mutex<PendingState>,
    /// Lowest ticket still outstanding, or the next ticket when none is
    low_water: watch::Sender<u64>,
}

impl PendingRecords {
    pub fn new() -> Arc<Self> {
        let (low_water, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(PendingState::default()),
            low_water,
        })
    }

    pub fn register(self: &Arc<Self>) -> PendingTicket {
        let mut state = self.state.lock();
        let id = state.next;
        state.next += 1;
        state.outstanding.insert(id);
        PendingTicket {
            id,
            pending: self.clone(),
        }
    }

    /// Number the next registered record will get.
    pub fn mark(&self) -> u64 {
        self.state.lock().next
    }

    /// Waits until every record registered before `mark` has completed.
    pub async fn wait_for(&self, mark: u64, cancel: &CancellationToken) -> Result<()> {
        let mut low_water = self.low_water.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            reached = low_water.wait_for(|low| *low >= mark) => {
                reached.map(|_| ()).map_err(|_| ClientError::Closed)
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        state.outstanding.remove(&id);
        let low = state.outstanding.first().copied().unwrap_or(state.next);
        self.low_water.send_replace(low);
    }
}

/// Held by a record until its writer is answered
#[derive(Debug)]
pub(crate) struct PendingTicket {
    id: u64,
    pending: Arc<PendingRecords>,
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        self.pending.release(self.id);
    }
}
