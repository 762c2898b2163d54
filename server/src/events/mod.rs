//! Event bus
//!
//! Typed publish/subscribe over a tokio channel. Components get an
//! `EventEmitter` to publish with and register handlers per topic at
//! initialization. Publishing never waits on handlers: events are queued
//! and delivered by the dispatcher, either on demand (`run_until_idle`)
//! or from a background task (`spawn`).
//!
//! Handlers usually hold emitters of their own, so the channel never
//! closes by itself. A spawned dispatcher runs until its
//! `DispatcherHandle` is shut down or dropped.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Topic an event is published under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    WorkspaceDeleted,
    WorkspaceBlobDeleted,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::WorkspaceDeleted => "workspace.deleted",
            EventName::WorkspaceBlobDeleted => "workspace.blob.deleted",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    /// A workspace is being torn down
    #[serde(rename = "workspace.deleted", rename_all = "camelCase")]
    WorkspaceDeleted { workspace_id: String },
    /// One blob of a deleted workspace should go away
    #[serde(rename = "workspace.blob.deleted", rename_all = "camelCase")]
    WorkspaceBlobDeleted { workspace_id: String, name: String },
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::WorkspaceDeleted { .. } => EventName::WorkspaceDeleted,
            Event::WorkspaceBlobDeleted { .. } => EventName::WorkspaceBlobDeleted,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Cloneable publishing handle
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventEmitter {
    /// Queue an event. Never blocks; if the bus is gone the event is dropped.
    pub fn emit(&self, event: Event) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::warn!("Event bus closed, dropping {} event", name);
        }
    }

    /// Whether the dispatcher is gone and emitted events are dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type HandlerMap = HashMap<EventName, Vec<Arc<dyn EventHandler>>>;

pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    handlers: HandlerMap,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            handlers: HashMap::new(),
        }
    }

    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
        }
    }

    /// Register a handler for one topic
    pub fn subscribe(&mut self, name: EventName, handler: Arc<dyn EventHandler>) {
        tracing::debug!("Subscribing handler to {}", name);
        self.handlers.entry(name).or_default().push(handler);
    }

    /// Deliver queued events, including ones emitted while dispatching,
    /// until the queue is empty. Returns the number of events delivered.
    pub async fn run_until_idle(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.rx.try_recv() {
            dispatch(&self.handlers, &event).await;
            delivered += 1;
        }
        delivered
    }

    /// Move the bus onto a background task.
    ///
    /// The task delivers events until `DispatcherHandle::shutdown` is
    /// called or the handle is dropped. Either way it first delivers
    /// whatever is still queued, then stops and closes every emitter.
    pub fn spawn(self) -> DispatcherHandle {
        let EventBus {
            tx,
            mut rx,
            handlers,
        } = self;
        drop(tx);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            tracing::info!("Starting event dispatcher");

            let mut delivered = 0;
            loop {
                tokio::select! {
                    maybe_event = rx.recv() => match maybe_event {
                        Some(event) => {
                            dispatch(&handlers, &event).await;
                            delivered += 1;
                        }
                        None => break,
                    },
                    requested = &mut shutdown_rx => {
                        if requested.is_err() {
                            tracing::warn!("Dispatcher handle dropped, stopping event dispatcher");
                        }
                        // Finish what is already queued
                        while let Ok(event) = rx.try_recv() {
                            dispatch(&handlers, &event).await;
                            delivered += 1;
                        }
                        break;
                    }
                }
            }

            tracing::info!("Event dispatcher stopped after {} events", delivered);
            delivered
        });

        DispatcherHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a dispatcher started with `EventBus::spawn`.
/// Dropping it stops the dispatcher after the queue drains.
#[must_use = "dropping the handle stops the dispatcher"]
pub struct DispatcherHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<usize>,
}

impl DispatcherHandle {
    /// Drain queued events, stop the dispatcher and return how many
    /// events it delivered in total
    pub async fn shutdown(self) -> Result<usize> {
        // The task may already have stopped on its own
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| AppError::EventBus(format!("Dispatcher task failed: {}", e)))
    }
}

/// Run every handler of the event's topic. A failing handler is logged
/// and does not affect the others.
async fn dispatch(handlers: &HandlerMap, event: &Event) {
    let name = event.name();

    let Some(listeners) = handlers.get(&name) else {
        tracing::debug!("No handlers for {} event", name);
        return;
    };

    for handler in listeners {
        if let Err(e) = handler.handle(event).await {
            tracing::error!("Handler for {} failed: {}", name, e);
        }
    }
}
