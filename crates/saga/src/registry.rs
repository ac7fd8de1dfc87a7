//! Live instance drivers and their mailboxes.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use common::InstanceId;
use tokio::sync::{mpsc, watch};

use crate::state::SagaStatus;

/// A message for a running instance driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The saga-level deadline of a step expired.
    TimedOut { step_index: usize },
    Abort { reason: String, requested_by: String },
}

struct Entry {
    mailbox: mpsc::UnboundedSender<Signal>,
    status: watch::Receiver<SagaStatus>,
}

/// Handed to the single driver of an instance.
pub struct InstanceHandle {
    pub mailbox: mpsc::UnboundedReceiver<Signal>,
    pub status: watch::Sender<SagaStatus>,
}

/// Tracks which instances have a driver in this process.
///
/// At most one driver per instance: [`claim`](Self::claim) fails while a
/// previous claim has not been released.
#[derive(Default)]
pub struct InstanceRegistry {
    entries: Mutex<HashMap<InstanceId, Entry>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, instance_id: InstanceId, status: SagaStatus) -> Option<InstanceHandle> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&instance_id) {
            return None;
        }
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(status);
        entries.insert(
            instance_id,
            Entry {
                mailbox: mailbox_tx,
                status: status_rx,
            },
        );
        Some(InstanceHandle {
            mailbox: mailbox_rx,
            status: status_tx,
        })
    }

    pub fn release(&self, instance_id: InstanceId) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&instance_id);
    }

    /// Delivers a signal. Returns false when no driver is live.
    pub fn signal(&self, instance_id: InstanceId, signal: Signal) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&instance_id)
            .is_some_and(|entry| entry.mailbox.send(signal).is_ok())
    }

    /// Status updates published by the live driver.
    pub fn subscribe(&self, instance_id: InstanceId) -> Option<watch::Receiver<SagaStatus>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&instance_id).map(|entry| entry.status.clone())
    }

    pub fn is_live(&self, instance_id: InstanceId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&instance_id)
    }

    pub fn active_ids(&self) -> Vec<InstanceId> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}
