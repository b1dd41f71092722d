//! In-flight deliveries
//!
//! A delivery is in flight from the moment it is handed to the recipient
//! until the recipient acknowledges or rejects it, or it expires. Entries
//! are keyed by (recipient, delivery id): an acknowledgement only ever
//! resolves a delivery addressed to the client that sent it.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::client::ClientId;
use crate::protocol::DeliverMessage;

pub type InFlightKey = (ClientId, Uuid);

#[derive(Debug, Clone)]
pub struct InFlightDelivery {
    pub recipient: ClientId,
    pub deliver: DeliverMessage,
    /// How many times this delivery has been re-sent so far.
    pub redeliveries: u32,
    /// Set once the delivery has actually been written to the recipient.
    pub sent_at: Option<Instant>,
}

impl InFlightDelivery {
    pub fn new(recipient: ClientId, deliver: DeliverMessage, redeliveries: u32) -> Self {
        Self {
            recipient,
            deliver,
            redeliveries,
            sent_at: None,
        }
    }

    pub fn entry_key(&self) -> InFlightKey {
        (self.recipient, self.deliver.id)
    }
}

#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: DashMap<InFlightKey, InFlightDelivery>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, delivery: InFlightDelivery) {
        self.entries.insert(delivery.entry_key(), delivery);
    }

    /// Removes and returns the matching entry.
    pub fn resolve(&self, recipient: ClientId, id: Uuid) -> Option<InFlightDelivery> {
        self.entries.remove(&(recipient, id)).map(|(_, delivery)| delivery)
    }

    /// Stamps the send time of an entry. Returns `false` if there is none.
    pub fn touch(&self, recipient: ClientId, id: Uuid, at: Instant) -> bool {
        match self.entries.get_mut(&(recipient, id)) {
            Some(mut delivery) => {
                delivery.sent_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Removes and returns every entry addressed to `recipient`.
    pub fn remove_client(&self, recipient: ClientId) -> Vec<InFlightDelivery> {
        let keys: Vec<InFlightKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == recipient)
            .map(|entry| *entry.key())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|(_, delivery)| delivery))
            .collect()
    }

    /// Keys of entries sent at least `timeout` before `now`. Entries that
    /// were never stamped are not considered.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<InFlightKey> {
        self.entries
            .iter()
            .filter(|entry| {
                entry
                    .sent_at
                    .is_some_and(|sent_at| now.saturating_duration_since(sent_at) >= timeout)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn contains(&self, recipient: ClientId, id: Uuid) -> bool {
        self.entries.contains_key(&(recipient, id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
