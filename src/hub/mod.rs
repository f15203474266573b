//! Fan-out of [`ProgressEvent`]s to live subscribers.
//!
//! A single loop owns the subscriber registry and serialises register,
//! unregister and publish requests. Each subscriber has a bounded mailbox;
//! a subscriber whose mailbox is full when an event arrives is dropped
//! instead of slowing the pipeline down. Progress delivery is therefore
//! at-most-once and best-effort.

pub mod session;

use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::job::ProgressEvent;

/// Capacity of the register/unregister command channel
const COMMAND_CAPACITY: usize = 64;

/// Sizing of the hub's channels
#[derive(Debug, Clone, Copy)]
pub struct HubOptions {
    /// Events buffered between publishers and the fan-out loop
    pub broadcast_capacity: usize,
    /// Events buffered per subscriber before it is considered too slow
    pub subscriber_capacity: usize,
}

impl HubOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broadcast_capacity: config.broadcast_capacity.max(1),
            subscriber_capacity: config.subscriber_capacity.max(1),
        }
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

enum Command {
    Register {
        reply: oneshot::Sender<(Uuid, mpsc::Receiver<ProgressEvent>)>,
    },
    Unregister(Uuid),
    Count(oneshot::Sender<usize>),
}

/// Cloneable handle to a running hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<ProgressEvent>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register { .. } => f.write_str("Register"),
            Command::Unregister(id) => write!(f, "Unregister({id})"),
            Command::Count(_) => f.write_str("Count"),
        }
    }
}

/// Spawn the hub loop and return a handle to it.
///
/// The loop ends once every handle has been dropped.
pub fn spawn(options: HubOptions) -> HubHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (events, event_rx) = mpsc::channel(options.broadcast_capacity.max(1));
    tokio::spawn(run(command_rx, event_rx, options.subscriber_capacity.max(1)));
    HubHandle { commands, events }
}

async fn run(
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::Receiver<ProgressEvent>,
    subscriber_capacity: usize,
) {
    let mut subscribers: HashMap<Uuid, mpsc::Sender<ProgressEvent>> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Register { reply }) => {
                    let id = Uuid::new_v4();
                    let (tx, rx) = mpsc::channel(subscriber_capacity);
                    if reply.send((id, rx)).is_ok() {
                        subscribers.insert(id, tx);
                        info!("Progress subscriber {} connected, total: {}", id, subscribers.len());
                    }
                }
                Some(Command::Unregister(id)) => {
                    // dropping the sender closes the mailbox
                    if subscribers.remove(&id).is_some() {
                        info!("Progress subscriber {} disconnected, total: {}", id, subscribers.len());
                    }
                }
                Some(Command::Count(reply)) => {
                    let _ = reply.send(subscribers.len());
                }
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => fan_out(&mut subscribers, &event),
                None => break,
            },
        }
    }

    debug!("Progress hub stopped with {} subscribers", subscribers.len());
}

fn fan_out(subscribers: &mut HashMap<Uuid, mpsc::Sender<ProgressEvent>>, event: &ProgressEvent) {
    subscribers.retain(|id, mailbox| match mailbox.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Dropping slow progress subscriber {}", id);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Progress subscriber {} already gone", id);
            false
        }
    });
}

impl HubHandle {
    /// Add a subscriber with a fresh bounded mailbox.
    ///
    /// Returns `None` when the hub has stopped.
    pub async fn register(&self) -> Option<Subscriber> {
        let (reply, response) = oneshot::channel();
        self.commands.send(Command::Register { reply }).await.ok()?;
        let (id, mailbox) = response.await.ok()?;
        Some(Subscriber {
            id,
            mailbox,
            hub: self.clone(),
        })
    }

    /// Remove a subscriber and close its mailbox. Unknown ids are ignored.
    pub async fn unregister(&self, id: Uuid) {
        let _ = self.commands.send(Command::Unregister(id)).await;
    }

    /// Queue an event for fan-out without waiting.
    ///
    /// When the hub is saturated the event is dropped.
    pub fn publish(&self, event: ProgressEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!("Progress hub saturated, dropping event for task {}", event.task_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Count(reply)).await.is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }
}

/// A registered receiver of progress events
#[derive(Debug)]
pub struct Subscriber {
    id: Uuid,
    mailbox: mpsc::Receiver<ProgressEvent>,
    hub: HubHandle,
}

impl Subscriber {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the hub has closed this mailbox
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.mailbox.recv().await
    }

    /// Unregister and wait until the hub has processed the removal
    pub async fn close(self) {
        self.hub.unregister(self.id).await;
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // best effort; a missed request is cleaned up by the next fan-out
        let _ = self.hub.commands.try_send(Command::Unregister(self.id));
    }
}
