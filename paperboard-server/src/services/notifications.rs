//! Best-effort fan-out of device state changes to websocket subscribers.
//!
//! Publishing never blocks and never fails the caller: a subscriber whose
//! buffer is full misses the event, and closed subscribers are pruned on the
//! next publish to their device.

use crate::models::PlaylistItem;
use crate::services::sleep_window::SleepState;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    ItemAdded {
        device_id: i32,
        item_id: i32,
        item: PlaylistItem,
        timestamp: String,
    },
    ItemUpdated {
        device_id: i32,
        item_id: i32,
        item: PlaylistItem,
        timestamp: String,
    },
    ItemRemoved {
        device_id: i32,
        item_id: i32,
        timestamp: String,
    },
    /// `item_ids` is the default playlist in display order.
    ItemsReordered {
        device_id: i32,
        item_ids: Vec<i32>,
        timestamp: String,
    },
    DeviceSettingsUpdated {
        device_id: i32,
        settings: SleepState,
        timestamp: String,
    },
    PlaylistIndexChanged {
        device_id: i32,
        item_id: Option<i32>,
        timestamp: String,
    },
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl DeviceEvent {
    pub fn item_added(device_id: i32, item: PlaylistItem, at: DateTime<Utc>) -> Self {
        Self::ItemAdded { device_id, item_id: item.id, item, timestamp: stamp(at) }
    }

    pub fn item_updated(device_id: i32, item: PlaylistItem, at: DateTime<Utc>) -> Self {
        Self::ItemUpdated { device_id, item_id: item.id, item, timestamp: stamp(at) }
    }

    pub fn item_removed(device_id: i32, item_id: i32, at: DateTime<Utc>) -> Self {
        Self::ItemRemoved { device_id, item_id, timestamp: stamp(at) }
    }

    pub fn items_reordered(device_id: i32, item_ids: Vec<i32>, at: DateTime<Utc>) -> Self {
        Self::ItemsReordered { device_id, item_ids, timestamp: stamp(at) }
    }

    pub fn settings_updated(device_id: i32, settings: SleepState, at: DateTime<Utc>) -> Self {
        Self::DeviceSettingsUpdated { device_id, settings, timestamp: stamp(at) }
    }

    pub fn index_changed(device_id: i32, item_id: Option<i32>, at: DateTime<Utc>) -> Self {
        Self::PlaylistIndexChanged { device_id, item_id, timestamp: stamp(at) }
    }

    pub fn device_id(&self) -> i32 {
        match self {
            Self::ItemAdded { device_id, .. }
            | Self::ItemUpdated { device_id, .. }
            | Self::ItemRemoved { device_id, .. }
            | Self::ItemsReordered { device_id, .. }
            | Self::DeviceSettingsUpdated { device_id, .. }
            | Self::PlaylistIndexChanged { device_id, .. } => *device_id,
        }
    }
}

pub type SubscriberId = u64;

pub struct Subscription {
    pub id: SubscriberId,
    pub device_id: i32,
    pub events: Receiver<DeviceEvent>,
}

pub struct NotificationHub {
    buffer_size: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<i32, Vec<(SubscriberId, Sender<DeviceEvent>)>>>,
}

impl NotificationHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<i32, Vec<(SubscriberId, Sender<DeviceEvent>)>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self, device_id: i32) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers().entry(device_id).or_default().push((id, tx));
        Subscription { id, device_id, events: rx }
    }

    pub fn unsubscribe(&self, device_id: i32, id: SubscriberId) {
        let mut subscribers = self.subscribers();
        if let Some(list) = subscribers.get_mut(&device_id) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subscribers.remove(&device_id);
            }
        }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        let device_id = event.device_id();
        let mut subscribers = self.subscribers();
        let Some(list) = subscribers.get_mut(&device_id) else {
            return 0;
        };

        let mut delivered = 0;
        list.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Subscriber {} for device {} is lagging; event dropped", id, device_id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if list.is_empty() {
            subscribers.remove(&device_id);
        }
        delivered
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = DeviceEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// For events read back after a committed change. A failed read only
    /// costs the notification.
    pub fn publish_loaded<E: Display>(&self, event: Result<DeviceEvent, E>) -> usize {
        match event {
            Ok(event) => self.publish(event),
            Err(e) => {
                tracing::warn!("Skipping device event: {}", e);
                0
            }
        }
    }

    pub fn subscriber_count(&self, device_id: i32) -> usize {
        self.subscribers().get(&device_id).map_or(0, Vec::len)
    }
}
