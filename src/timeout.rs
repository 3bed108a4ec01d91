use ahash::AHashMap as HashMap;
use crossbeam_channel as channel;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::errors::{GridTxError, Result};
use crate::transaction::state::TxState;
use crate::transaction::Transaction;

enum TimeoutCommand {
    Track(Instant, Weak<Transaction>),
    Stop,
}

/// Background worker that rolls back transactions past their deadline.
pub struct TimeoutProcessor {
    sender: channel::Sender<TimeoutCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutProcessor {
    pub fn start() -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("gridtx-timeout".to_string())
            .spawn(move || run(receiver))
            .map_err(|e| GridTxError::Other(format!("failed to spawn timeout worker: {}", e)))?;
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Starts tracking `tx` if it has a deadline.
    pub fn track(&self, tx: &Arc<Transaction>) {
        if let Some(deadline) = tx.deadline() {
            if self
                .sender
                .send(TimeoutCommand::Track(deadline, Arc::downgrade(tx)))
                .is_err()
            {
                warn!("Timeout worker is gone, tx {} will not time out", tx.xid());
            }
        }
    }

    /// Stops the worker. Calling it again has no effect.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = self.sender.send(TimeoutCommand::Stop);
            if handle.join().is_err() {
                warn!("Timeout worker panicked");
            }
        }
    }
}

fn run(receiver: channel::Receiver<TimeoutCommand>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut tracked: HashMap<u64, Weak<Transaction>> = HashMap::new();
    let mut seq = 0u64;

    loop {
        let cmd = match deadlines.peek() {
            Some(Reverse((deadline, _))) => match receiver.recv_deadline(*deadline) {
                Ok(cmd) => Some(cmd),
                Err(channel::RecvTimeoutError::Timeout) => None,
                Err(channel::RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match cmd {
            Some(TimeoutCommand::Track(deadline, tx)) => {
                seq += 1;
                deadlines.push(Reverse((deadline, seq)));
                tracked.insert(seq, tx);
            }
            Some(TimeoutCommand::Stop) => break,
            None => {}
        }

        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(tx) = tracked.remove(&id).and_then(|w| w.upgrade()) {
                on_timeout(&tx);
            }
        }
    }
    info!("Timeout worker stopped");
}

fn on_timeout(tx: &Arc<Transaction>) {
    match tx.state() {
        TxState::Active | TxState::Prepared | TxState::MarkedRollback => {
            debug!("Tx {} timed out in state {:?}, rolling back", tx.xid(), tx.state());
            tx.interrupt();
            if let Err(e) = tx.rollback() {
                debug!("Rollback of timed out tx {} skipped: {}", tx.xid(), e);
            }
        }
        TxState::Preparing => {
            // The preparing thread notices the deadline itself.
            tx.interrupt();
        }
        _ => {}
    }
}
