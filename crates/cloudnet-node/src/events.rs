// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed, synchronous event publishing.
//!
//! Handlers are registered per [`EventKind`] and run in registration order on
//! the publishing task. Cancellable events are vetoed through the
//! [`EventOutcome`] every handler receives; the publisher inspects it after
//! all handlers ran.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use cloudnet_protocol::ChannelMessage;

use crate::cluster::{NetworkClusterNode, NetworkClusterNodeInfoSnapshot};
use crate::lifecycle::ServiceLifeCycle;
use crate::service::{ServiceId, ServiceInfoSnapshot};
use crate::task::ServiceTask;

/// Discriminant of [`CloudEvent`], used as registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelMessageReceived,
    NodeInfoSnapshotUpdated,
    ServiceTaskAdded,
    ServiceTaskRemoved,
    ServiceLifecyclePre,
    ServiceLifecycleChanged,
    ServiceInfoUpdated,
    NodeDrainChanged,
    ClusterNodeAdded,
    ClusterNodeRemoved,
    NodeDisconnected,
}

/// Events raised inside a node.
#[derive(Debug, Clone)]
pub enum CloudEvent {
    /// Any channel message arrived from a peer. Handlers may answer queries.
    ChannelMessageReceived {
        message: ChannelMessage,
        query: bool,
    },
    NodeInfoSnapshotUpdated {
        snapshot: NetworkClusterNodeInfoSnapshot,
    },
    ServiceTaskAdded {
        task: ServiceTask,
    },
    ServiceTaskRemoved {
        task: ServiceTask,
    },
    /// About to change a service lifecycle. Cancellable.
    ServiceLifecyclePre {
        service_id: ServiceId,
        from: ServiceLifeCycle,
        to: ServiceLifeCycle,
    },
    ServiceLifecycleChanged {
        service_id: ServiceId,
        from: ServiceLifeCycle,
        to: ServiceLifeCycle,
    },
    /// A local or remote service snapshot was replaced.
    ServiceInfoUpdated {
        snapshot: ServiceInfoSnapshot,
    },
    NodeDrainChanged {
        draining: bool,
    },
    ClusterNodeAdded {
        node: NetworkClusterNode,
    },
    ClusterNodeRemoved {
        node: NetworkClusterNode,
    },
    /// The link to a known peer went away.
    NodeDisconnected {
        unique_id: String,
    },
}

impl CloudEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CloudEvent::ChannelMessageReceived { .. } => EventKind::ChannelMessageReceived,
            CloudEvent::NodeInfoSnapshotUpdated { .. } => EventKind::NodeInfoSnapshotUpdated,
            CloudEvent::ServiceTaskAdded { .. } => EventKind::ServiceTaskAdded,
            CloudEvent::ServiceTaskRemoved { .. } => EventKind::ServiceTaskRemoved,
            CloudEvent::ServiceLifecyclePre { .. } => EventKind::ServiceLifecyclePre,
            CloudEvent::ServiceLifecycleChanged { .. } => EventKind::ServiceLifecycleChanged,
            CloudEvent::ServiceInfoUpdated { .. } => EventKind::ServiceInfoUpdated,
            CloudEvent::NodeDrainChanged { .. } => EventKind::NodeDrainChanged,
            CloudEvent::ClusterNodeAdded { .. } => EventKind::ClusterNodeAdded,
            CloudEvent::ClusterNodeRemoved { .. } => EventKind::ClusterNodeRemoved,
            CloudEvent::NodeDisconnected { .. } => EventKind::NodeDisconnected,
        }
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, CloudEvent::ServiceLifecyclePre { .. })
    }
}

/// Mutable result of one publication, shared by all handlers.
#[derive(Debug, Default)]
pub struct EventOutcome {
    cancellable: bool,
    cancelled: bool,
    response: Option<Bytes>,
}

impl EventOutcome {
    /// Veto the event. Ignored for events that are not cancellable.
    pub fn cancel(&mut self) {
        if self.cancellable {
            self.cancelled = true;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Answer a [`CloudEvent::ChannelMessageReceived`] query. Last writer wins.
    pub fn respond(&mut self, content: impl Into<Bytes>) {
        self.response = Some(content.into());
    }

    pub fn response(&self) -> Option<&Bytes> {
        self.response.as_ref()
    }

    pub fn into_response(self) -> Option<Bytes> {
        self.response
    }
}

type EventHandler = Arc<dyn Fn(&CloudEvent, &mut EventOutcome) + Send + Sync>;

/// Identifies a registered handler for [`EventManager::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Registry of event handlers.
#[derive(Default)]
pub struct EventManager {
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Handlers run in registration order.
    pub fn register<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&CloudEvent, &mut EventOutcome) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(handler_id, _)| *handler_id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Run every handler registered for the event's kind.
    pub fn publish(&self, event: &CloudEvent) -> EventOutcome {
        // snapshot the list so handlers may register or unregister while running
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        let mut outcome = EventOutcome {
            cancellable: event.is_cancellable(),
            ..Default::default()
        };
        for handler in handlers {
            handler(event, &mut outcome);
        }
        outcome
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self
            .handlers
            .read()
            .map(|handlers| handlers.values().map(Vec::len).sum())
            .unwrap_or(0);
        f.debug_struct("EventManager")
            .field("handlers", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_handlers_run_in_registration_order() {
        let events = EventManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            events.register(EventKind::NodeDrainChanged, move |_, _| {
                seen.lock().unwrap().push(i);
            });
        }
        // other kinds are not invoked
        let seen_other = seen.clone();
        events.register(EventKind::ClusterNodeAdded, move |_, _| {
            seen_other.lock().unwrap().push(99);
        });

        events.publish(&CloudEvent::NodeDrainChanged { draining: true });
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cancellation_only_for_cancellable_events() {
        let events = EventManager::new();
        events.register(EventKind::ServiceLifecyclePre, |_, outcome| outcome.cancel());
        events.register(EventKind::NodeDrainChanged, |_, outcome| outcome.cancel());

        let service_id = ServiceId::new(
            "Lobby",
            "Node-1",
            vec![],
            crate::service::ServiceEnvironmentType::MinecraftServer,
        );
        let outcome = events.publish(&CloudEvent::ServiceLifecyclePre {
            service_id,
            from: ServiceLifeCycle::Prepared,
            to: ServiceLifeCycle::Running,
        });
        assert!(outcome.is_cancelled());

        let outcome = events.publish(&CloudEvent::NodeDrainChanged { draining: false });
        assert!(!outcome.is_cancelled());
    }

    #[test]
    fn test_unregister() {
        let events = EventManager::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let id = events.register(EventKind::NodeDrainChanged, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.publish(&CloudEvent::NodeDrainChanged { draining: true });
        assert!(events.unregister(id));
        assert!(!events.unregister(id));
        events.publish(&CloudEvent::NodeDrainChanged { draining: true });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_can_answer_query() {
        let events = EventManager::new();
        events.register(EventKind::ChannelMessageReceived, |event, outcome| {
            if let CloudEvent::ChannelMessageReceived { message, query: true } = event
                && message.channel() == "bridge"
            {
                outcome.respond(Bytes::from_static(b"pong"));
            }
        });

        let outcome = events.publish(&CloudEvent::ChannelMessageReceived {
            message: ChannelMessage::new("bridge", "ping", Bytes::new()),
            query: true,
        });
        assert_eq!(outcome.into_response(), Some(Bytes::from_static(b"pong")));
    }
}
