//! Change notifier hub.
//!
//! One task owns the subscriber registry. Handles talk to it over two
//! channels: a control channel for registration and shutdown, and a bounded
//! event queue. Publishing never blocks; when the queue is full the event is
//! dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event::ChangeEvent;
use crate::config::NotifierConfig;

/// Subscriber identifier.
pub type SubscriberId = u64;

enum Command {
    Subscribe {
        id: SubscriberId,
        outbox: mpsc::Sender<ChangeEvent>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    Count(oneshot::Sender<usize>),
    Shutdown,
}

/// A live subscription. Events arrive in publish order.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    /// This subscription's ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event. `None` once the subscriber was dropped by
    /// the hub or the hub shut down.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Handle to the notifier hub. Cheap to clone.
#[derive(Clone)]
pub struct ChangeNotifier {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::Sender<ChangeEvent>,
    next_id: Arc<AtomicU64>,
    outbox_capacity: usize,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ChangeNotifier {
    /// Spawn the hub task. Must be called inside a tokio runtime.
    pub fn new(config: &NotifierConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::channel(config.queue_capacity.max(1));
        let task = tokio::spawn(run_hub(command_rx, event_rx, config.send_timeout()));
        info!(
            outbox_capacity = config.outbox_capacity,
            send_timeout_ms = config.send_timeout_ms,
            queue_capacity = config.queue_capacity,
            "Change notifier started"
        );
        Self {
            commands,
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            outbox_capacity: config.outbox_capacity.max(1),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Register a new subscriber.
    ///
    /// Events published after this call returns are delivered to it.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, receiver) = mpsc::channel(self.outbox_capacity);
        // If the hub is gone the outbox is dropped here and the receiver
        // reports end-of-stream straight away.
        let _ = self.commands.send(Command::Subscribe { id, outbox });
        Subscription { id, receiver }
    }

    /// Remove a subscriber. Unknown IDs are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.commands.send(Command::Unsubscribe { id });
    }

    /// Queue an event for fan-out. Never blocks the caller; the event is
    /// dropped if the queue is full.
    pub fn publish(&self, event: ChangeEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    event_type = event.event_type.as_str(),
                    "Event queue full, event dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Notifier is shut down, event dropped");
            }
        }
    }

    /// Number of registered subscribers (0 after shutdown).
    pub async fn subscriber_count(&self) -> usize {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(Command::Count(reply)).is_err() {
            return 0;
        }
        answer.await.unwrap_or(0)
    }

    /// Stop the hub and close every outbox.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Notifier task ended abnormally: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("outbox_capacity", &self.outbox_capacity)
            .finish()
    }
}

async fn run_hub(
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::Receiver<ChangeEvent>,
    send_timeout: Duration,
) {
    let mut subscribers: BTreeMap<SubscriberId, mpsc::Sender<ChangeEvent>> = BTreeMap::new();

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => {
                // A new subscriber registers at once so it misses nothing
                // published after subscribe() returned. Other commands see
                // the effect of every event queued so far.
                if !matches!(command, Some(Command::Subscribe { .. })) {
                    while let Ok(event) = events.try_recv() {
                        fan_out(&mut subscribers, event, send_timeout).await;
                    }
                }
                match command {
                    Some(Command::Subscribe { id, outbox }) => {
                        subscribers.entry(id).or_insert(outbox);
                        debug!(id, total = subscribers.len(), "Subscriber registered");
                    }
                    Some(Command::Unsubscribe { id }) => {
                        if subscribers.remove(&id).is_some() {
                            debug!(id, total = subscribers.len(), "Subscriber removed");
                        }
                    }
                    Some(Command::Count(reply)) => {
                        let _ = reply.send(subscribers.len());
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
            Some(event) = events.recv() => {
                fan_out(&mut subscribers, event, send_timeout).await;
            }
        }
    }

    info!(
        remaining = subscribers.len(),
        "Change notifier stopped"
    );
}

async fn fan_out(
    subscribers: &mut BTreeMap<SubscriberId, mpsc::Sender<ChangeEvent>>,
    event: ChangeEvent,
    send_timeout: Duration,
) {
    let mut dropped = Vec::new();

    for (id, outbox) in subscribers.iter() {
        let pending = match outbox.try_send(event.clone()) {
            Ok(()) => continue,
            Err(TrySendError::Closed(_)) => {
                dropped.push(*id);
                continue;
            }
            Err(TrySendError::Full(pending)) => pending,
        };

        match outbox.send_timeout(pending, send_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(id, "Subscriber outbox stayed full, dropping subscriber");
                dropped.push(*id);
            }
            Err(SendTimeoutError::Closed(_)) => dropped.push(*id),
        }
    }

    for id in dropped {
        subscribers.remove(&id);
        debug!(id, "Subscriber dropped");
    }
}
