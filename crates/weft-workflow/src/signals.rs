//! Signal bus: named broadcast channels for application signals plus a
//! reserved per-execution control namespace (pause, resume, cancel).
//!
//! Each application channel is a `watch` cell holding the most recently
//! delivered signal, so every waiter subscribed at delivery time observes
//! the same `Arc<Signal>` instance. Waiters only see signals delivered after
//! they subscribed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use weft_core::Payload;

/// Prefix of the control namespace; application keys may not use it
pub const CONTROL_PREFIX: &str = "__control/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("Signal key {0} is reserved for engine control")]
    Reserved(String),

    #[error("Signal key must not be empty")]
    EmptyKey,

    #[error("Timed out waiting for signal {0}")]
    Timeout(String),

    #[error("Wait for signal {0} was canceled")]
    Canceled(String),
}

/// A delivered application signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: String,
    pub key: String,
    pub payload: Payload,
    pub sent_at: DateTime<Utc>,
}

/// Control state of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

pub fn control_key(workflow_exec_id: &str) -> String {
    format!("{}{}", CONTROL_PREFIX, workflow_exec_id)
}

#[derive(Default)]
pub struct SignalBus {
    channels: DashMap<String, watch::Sender<Option<Arc<Signal>>>>,
    controls: DashMap<String, watch::Sender<ControlSignal>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a payload to every current waiter on `key`.
    /// Returns the delivered signal; with no waiters it is dropped.
    pub fn send(&self, key: &str, payload: Payload) -> Result<Arc<Signal>, SignalError> {
        validate_key(key)?;
        let signal = Arc::new(Signal {
            id: Uuid::new_v4().to_string(),
            key: key.to_string(),
            payload,
            sent_at: Utc::now(),
        });

        match self.channels.get(key) {
            Some(tx) => {
                tx.send_replace(Some(signal.clone()));
                debug!(signal_key = %key, waiters = tx.receiver_count(), "Signal delivered");
            }
            None => debug!(signal_key = %key, "Signal sent with no waiters"),
        }
        Ok(signal)
    }

    /// Register interest in `key`; later deliveries become visible
    pub fn subscribe(&self, key: &str) -> Result<SignalWaiter, SignalError> {
        validate_key(key)?;
        let mut rx = self
            .channels
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        rx.borrow_and_update();
        Ok(SignalWaiter {
            key: key.to_string(),
            rx,
        })
    }

    /// Subscribe and wait for the next matching signal
    pub async fn wait<F>(
        &self,
        key: &str,
        token: &CancellationToken,
        deadline: Instant,
        accept: F,
    ) -> Result<Arc<Signal>, SignalError>
    where
        F: Fn(&Signal) -> bool,
    {
        self.subscribe(key)?.wait(token, deadline, accept).await
    }

    /// Number of waiters currently subscribed to `key`
    pub fn waiter_count(&self, key: &str) -> usize {
        self.channels
            .get(key)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn control_sender(&self, workflow_exec_id: &str) -> watch::Sender<ControlSignal> {
        self.controls
            .entry(workflow_exec_id.to_string())
            .or_insert_with(|| watch::channel(ControlSignal::Run).0)
            .clone()
    }

    /// Observe the control state of an execution
    pub fn control(&self, workflow_exec_id: &str) -> watch::Receiver<ControlSignal> {
        self.control_sender(workflow_exec_id).subscribe()
    }

    pub fn control_state(&self, workflow_exec_id: &str) -> ControlSignal {
        self.controls
            .get(workflow_exec_id)
            .map(|tx| *tx.borrow())
            .unwrap_or(ControlSignal::Run)
    }

    /// Publish a control signal. Cancel is sticky; returns whether the state changed.
    pub fn send_control(&self, workflow_exec_id: &str, signal: ControlSignal) -> bool {
        let tx = self.control_sender(workflow_exec_id);
        let changed = tx.send_if_modified(|current| {
            if *current == ControlSignal::Cancel || *current == signal {
                return false;
            }
            *current = signal;
            true
        });
        if changed {
            info!(
                signal_key = %control_key(workflow_exec_id),
                control = ?signal,
                "Control signal published"
            );
        }
        changed
    }

    pub fn pause(&self, workflow_exec_id: &str) -> bool {
        self.send_control(workflow_exec_id, ControlSignal::Pause)
    }

    pub fn resume(&self, workflow_exec_id: &str) -> bool {
        self.send_control(workflow_exec_id, ControlSignal::Run)
    }

    pub fn cancel(&self, workflow_exec_id: &str) -> bool {
        self.send_control(workflow_exec_id, ControlSignal::Cancel)
    }

    /// Executions with a live control entry
    pub fn tracked_executions(&self) -> usize {
        self.controls.len()
    }

    /// Drop per-execution state and channels nobody waits on any more
    pub fn release_execution(&self, workflow_exec_id: &str) {
        self.controls.remove(workflow_exec_id);
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

fn validate_key(key: &str) -> Result<(), SignalError> {
    if key.trim().is_empty() {
        return Err(SignalError::EmptyKey);
    }
    if key.starts_with(CONTROL_PREFIX) {
        return Err(SignalError::Reserved(key.to_string()));
    }
    Ok(())
}

/// A subscription to one application channel
pub struct SignalWaiter {
    key: String,
    rx: watch::Receiver<Option<Arc<Signal>>>,
}

impl SignalWaiter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the next accepted signal, the deadline, or cancellation
    pub async fn wait<F>(
        mut self,
        token: &CancellationToken,
        deadline: Instant,
        accept: F,
    ) -> Result<Arc<Signal>, SignalError>
    where
        F: Fn(&Signal) -> bool,
    {
        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(SignalError::Canceled(self.key.clone())),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SignalError::Timeout(self.key.clone()))
                }
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped: nothing more can arrive
                        tokio::time::sleep_until(deadline).await;
                        return Err(SignalError::Timeout(self.key.clone()));
                    }
                    let delivered = self.rx.borrow_and_update().clone();
                    if let Some(signal) = delivered {
                        if accept(&signal) {
                            return Ok(signal);
                        }
                        debug!(signal_key = %self.key, "Signal ignored by wait condition");
                    }
                }
            }
        }
    }
}
