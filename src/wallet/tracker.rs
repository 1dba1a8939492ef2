//! ConfirmationTracker - wallet events in, depth-reached callbacks out.
//!
//! Every (txid, direction) gets one watch task with its own channel. The task
//! reports back once the confirmation count reaches the target; the tracker
//! loop then runs the callback, at most once per key, even if the chain
//! client repeats events or depth updates. Fired keys are persisted through
//! [`TrackerState`] so a restart does not forward twice.

use crate::chain::{ChainClient, Direction, TransactionDetails, WalletEvent};
use crate::config::ForwardPolicy;
use crate::error::ServiceResult;
use crate::runtime::Shutdown;
use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackKey {
    pub txid: Txid,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerState {
    #[serde(default)]
    pub fired: BTreeSet<TrackKey>,
    #[serde(default)]
    pub forwards_triggered: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTransaction {
    pub key: TrackKey,
    pub required_depth: u32,
    pub observed: bool,
}

/// Human/machine readable record of what the service did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Activity {
    /// A transaction touching the wallet was seen; now waiting for depth.
    Seen { txid: Txid, direction: Direction, required_depth: u32, details: Option<TransactionDetails> },
    /// Depth reached.
    Confirmed { txid: Txid, direction: Direction, confirmations: u32, details: Option<TransactionDetails> },
    Forwarded { txid: Txid, destination: String, amount_sat: u64, fee_sat: u64, persisted: bool },
    WaitingForFunds { destination: String, amount_sat: u64, required: u64, available: u64 },
    ForwardSkipped { trigger: Txid, reason: String },
    /// The chain stopped reporting the transaction before it reached depth.
    Dropped { txid: Txid, direction: Direction },
    ForwardFailed { reason: String },
}

/// What the tracker does when an incoming transaction qualifies.
#[async_trait]
pub trait ForwardAction: Send + Sync + 'static {
    async fn forward_on_confirmation(&self, trigger: Txid) -> ServiceResult<()>;
}

#[derive(Debug)]
enum WatchOutcome {
    Reached { key: TrackKey, confirmations: u32 },
    /// The confirmation channel closed first (evicted or replaced).
    Closed { key: TrackKey },
}

pub struct ConfirmationTracker<C: ChainClient> {
    chain: Arc<C>,
    action: Arc<dyn ForwardAction>,
    policy: ForwardPolicy,
    depth: u32,
    state: Arc<Mutex<TrackerState>>,
    tracked: HashMap<TrackKey, TrackedTransaction>,
    activity: broadcast::Sender<Activity>,
    shutdown: Shutdown,
}

impl<C: ChainClient> ConfirmationTracker<C> {
    pub fn new(
        chain: Arc<C>,
        action: Arc<dyn ForwardAction>,
        policy: ForwardPolicy,
        depth: u32,
        state: Arc<Mutex<TrackerState>>,
        activity: broadcast::Sender<Activity>,
        shutdown: Shutdown,
    ) -> Self {
        Self { chain, action, policy, depth: depth.max(1), state, tracked: HashMap::new(), activity, shutdown }
    }

    /// Subscribes immediately, so no event between this call and the first
    /// poll of the task is lost.
    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.chain.subscribe();
        tokio::spawn(self.run(events))
    }

    async fn run(mut self, mut events: broadcast::Receiver<WalletEvent>) {
        let (reached_tx, mut reached_rx) = mpsc::channel::<WatchOutcome>(64);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event, &reached_tx),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Tracker lagged behind wallet events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(outcome) = reached_rx.recv() => match outcome {
                    WatchOutcome::Reached { key, confirmations } => self.on_depth_reached(key, confirmations),
                    WatchOutcome::Closed { key } => self.on_watch_closed(key),
                },
            }
        }
        tracing::debug!(pending = self.tracked.len(), "Confirmation tracker stopped");
    }

    fn on_event(&mut self, event: WalletEvent, reached: &mpsc::Sender<WatchOutcome>) {
        let key = TrackKey { txid: event.txid, direction: event.direction };
        if self.tracked.contains_key(&key) || self.lock_state().fired.contains(&key) {
            tracing::debug!(txid = %key.txid, direction = %key.direction, "Already tracked");
            return;
        }

        let required_depth = match key.direction {
            Direction::Incoming => self.depth,
            Direction::Outgoing => 1,
        };
        self.tracked.insert(key, TrackedTransaction { key, required_depth, observed: false });

        match key.direction {
            Direction::Incoming => tracing::info!(txid = %key.txid, received = event.received, "Coins received, waiting for {} confirmation(s)", required_depth),
            Direction::Outgoing => tracing::info!(txid = %key.txid, sent = event.sent, "Waiting for confirmation"),
        }
        let _ = self.activity.send(Activity::Seen {
            txid: key.txid,
            direction: key.direction,
            required_depth,
            details: self.details(key.txid),
        });

        let mut confirmations = self.chain.watch_confirmations(key.txid);
        let reached = reached.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let wait = async {
                loop {
                    let current = *confirmations.borrow_and_update();
                    if current >= required_depth {
                        return Some(current);
                    }
                    if confirmations.changed().await.is_err() {
                        return None;
                    }
                }
            };
            tokio::select! {
                _ = shutdown.wait() => {}
                outcome = wait => {
                    let outcome = match outcome {
                        Some(confirmations) => WatchOutcome::Reached { key, confirmations },
                        None => WatchOutcome::Closed { key },
                    };
                    let _ = reached.send(outcome).await;
                }
            }
        });
    }

    /// Forget a transaction whose watch closed. It is not marked fired, so
    /// a later event for it is tracked again.
    fn on_watch_closed(&mut self, key: TrackKey) {
        if self.tracked.remove(&key).is_none() {
            return;
        }
        tracing::info!(txid = %key.txid, direction = %key.direction, "Transaction dropped before confirmation");
        let _ = self.activity.send(Activity::Dropped { txid: key.txid, direction: key.direction });
    }

    fn on_depth_reached(&mut self, key: TrackKey, confirmations: u32) {
        let Some(mut tracked) = self.tracked.remove(&key) else {
            tracing::debug!(txid = %key.txid, "Duplicate depth notification ignored");
            return;
        };
        tracked.observed = true;

        let forward = {
            let mut state = self.lock_state();
            if !state.fired.insert(key) {
                return;
            }
            let forward = key.direction == Direction::Incoming
                && (self.policy == ForwardPolicy::EveryConfirmation || state.forwards_triggered == 0);
            if forward {
                state.forwards_triggered += 1;
            }
            forward
        };

        match key.direction {
            Direction::Incoming => tracing::info!(txid = %key.txid, confirmations, "Confirmation received"),
            Direction::Outgoing => tracing::info!(txid = %key.txid, "CONFIRMED"),
        }
        let _ = self.activity.send(Activity::Confirmed {
            txid: key.txid,
            direction: key.direction,
            confirmations,
            details: self.details(key.txid),
        });

        if key.direction == Direction::Outgoing {
            return;
        }
        if !forward {
            let _ = self.activity.send(Activity::ForwardSkipped {
                trigger: key.txid,
                reason: "already forwarded once (loop mode off)".into(),
            });
            return;
        }

        // The forward runs in its own task; a failure or panic there stays there.
        let action = self.action.clone();
        let activity = self.activity.clone();
        let trigger = key.txid;
        let handle = tokio::spawn(async move { action.forward_on_confirmation(trigger).await });
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(%trigger, "Forward not completed: {}", e);
                    let _ = activity.send(Activity::ForwardFailed { reason: e.to_string() });
                }
                Err(e) => {
                    tracing::error!(%trigger, "Forward task panicked: {}", e);
                    let _ = activity.send(Activity::ForwardFailed { reason: e.to_string() });
                }
            }
        });
    }

    fn details(&self, txid: Txid) -> Option<TransactionDetails> {
        match self.chain.transaction(txid) {
            Ok(details) => details,
            Err(e) => {
                tracing::debug!(%txid, "No details: {}", e);
                None
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
