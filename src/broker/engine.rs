//! Broker engine
//!
//! This module contains the broker responsible for:
//! - registering clients and greeting them
//! - managing topics and subscriber sets
//! - fanning a publish out into one delivery per subscriber
//! - tracking deliveries until they are acknowledged, rejected or expired
//!
//! Concurrency notes:
//! - The broker is shared as `Arc<Broker>`; every registry is a `DashMap`,
//!   so there is no global lock. Map guards are never held across an
//!   `.await`: subscriber lists and client handles are copied out first.
//! - Fan-out sends are awaited together, a subscriber whose outbound side is
//!   full does not hold back delivery to the others.
//! - Rejected and expired deliveries are re-sent to the same subscriber at
//!   most `max_redeliveries` times, then dead-lettered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::inflight::{InFlightDelivery, InFlightRegistry};
use crate::broker::topic::{self, Topic};
use crate::client::{ClientId, MessageClient};
use crate::config::BrokerSettings;
use crate::protocol::{
    AcknowledgeMessage, ClientEnvelope, DeliverMessage, GreetingMessage, Message, PublishMessage,
    RejectMessage, ServerEnvelope,
};
use crate::utils::error::{BrokerError, CloseReason, FatalError};

pub struct Broker {
    clients: DashMap<ClientId, Arc<dyn MessageClient>>,
    topics: DashMap<String, Topic>,
    in_flight: InFlightRegistry,
    dead_letters: AtomicU64,
    settings: BrokerSettings,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            clients: DashMap::new(),
            topics: DashMap::new(),
            in_flight: InFlightRegistry::new(),
            dead_letters: AtomicU64::new(0),
            settings,
        }
    }

    /// Registers `client` and sends it a greeting.
    ///
    /// Returns `Ok(false)` without greeting again when a client with the same
    /// id is already registered. If the greeting cannot be sent the client
    /// stays registered and the error is returned; the caller unregisters.
    pub async fn register_client(&self, client: Arc<dyn MessageClient>) -> Result<bool, FatalError> {
        let id = client.id();
        match self.clients.entry(id) {
            Entry::Occupied(_) => {
                warn!("Client {id} is already registered");
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                slot.insert(client.clone());
            }
        }
        info!("Registered client {id}");

        let greeting = ServerEnvelope::for_message(Message::Greeting(GreetingMessage::create()));
        client.send_message(greeting).await?;
        Ok(true)
    }

    /// Removes the client from the registry and from every topic. Deliveries
    /// still in flight to it are dead-lettered. Safe for unknown ids.
    pub fn unregister_client(&self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();

        for mut topic in self.topics.iter_mut() {
            if topic.unsubscribe(&id) {
                debug!("Unsubscribed {id} from topic {}", topic.name);
            }
        }

        for delivery in self.in_flight.remove_client(id) {
            self.dead_letter(&delivery, "recipient disconnected");
        }

        if removed {
            info!("Unregistered client {id}");
        }
        removed
    }

    /// Dispatches one envelope received from `client`.
    pub async fn handle_message(
        &self,
        client: &dyn MessageClient,
        envelope: ClientEnvelope,
    ) -> Result<(), BrokerError> {
        let id = client.id();
        if !self.clients.contains_key(&id) {
            return Err(BrokerError::ClientNotRegistered(id));
        }

        match envelope.message {
            Message::Hello(hello) => {
                debug!("Hello {} from {id}", hello.id);
            }
            Message::Subscribe(subscribe) => self.subscribe(id, &subscribe.topic),
            Message::Unsubscribe(unsubscribe) => self.unsubscribe(id, &unsubscribe.topic),
            Message::Publish(publish) => self.publish(id, publish).await,
            Message::Acknowledge(ack) => self.acknowledge(id, ack),
            Message::Reject(reject) => self.reject(id, reject).await,
            other => {
                warn!("Unexpected {} message from {id}", other.tag());
                client
                    .disconnect(CloseReason::protocol(format!(
                        "unexpected message type: {}",
                        other.tag()
                    )))
                    .await;
            }
        }
        Ok(())
    }

    /// Subscribes a client to a topic, creating the topic on first use.
    pub fn subscribe(&self, id: ClientId, topic: &str) {
        let added = self
            .topics
            .entry(topic::normalize(topic))
            .or_insert_with(|| Topic::new(topic))
            .subscribe(id);
        if added {
            info!("{id} subscribed to {topic}");
        }
    }

    /// Unsubscribes a client from a topic. Unknown topics are ignored.
    pub fn unsubscribe(&self, id: ClientId, topic: &str) {
        if let Some(mut entry) = self.topics.get_mut(&topic::normalize(topic)) {
            if entry.unsubscribe(&id) {
                info!("{id} unsubscribed from {topic}");
            }
        }
    }

    /// Sends one delivery of `publish` to every current subscriber of its topic.
    pub async fn publish(&self, publisher: ClientId, publish: PublishMessage) {
        let subscribers = self
            .topics
            .entry(topic::normalize(&publish.topic))
            .or_insert_with(|| Topic::new(&publish.topic))
            .snapshot();

        let recipients: Vec<Arc<dyn MessageClient>> = subscribers
            .iter()
            .filter_map(|id| self.clients.get(id).map(|client| Arc::clone(client.value())))
            .collect();

        debug!(
            "{publisher} published {} to {} ({} recipients)",
            publish.id,
            publish.topic,
            recipients.len()
        );

        let sends = recipients
            .into_iter()
            .map(|client| self.deliver(client, DeliverMessage::from_publish(&publish), 0));
        join_all(sends).await;
    }

    /// Resolves the matching in-flight delivery. Unknown ids are reported.
    pub fn acknowledge(&self, sender: ClientId, ack: AcknowledgeMessage) {
        match self.in_flight.resolve(sender, ack.id) {
            Some(delivery) => {
                if topic::normalize(&delivery.deliver.topic) != topic::normalize(&ack.topic) {
                    debug!(
                        "Acknowledge {} from {sender} names topic {}, delivery was on {}",
                        ack.id, ack.topic, delivery.deliver.topic
                    );
                }
                debug!("{sender} acknowledged {}", ack.id);
            }
            None => warn!("{sender} acknowledged unknown delivery {}", ack.id),
        }
    }

    /// Resolves the matching in-flight delivery and redelivers it if the
    /// redelivery limit allows. Unknown ids are reported.
    pub async fn reject(&self, sender: ClientId, reject: RejectMessage) {
        match self.in_flight.resolve(sender, reject.id) {
            Some(delivery) => {
                debug!("{sender} rejected {}", reject.id);
                self.redeliver_or_dead_letter(delivery, "rejected").await;
            }
            None => warn!("{sender} rejected unknown delivery {}", reject.id),
        }
    }

    /// Hook called once a server envelope has been written for `client`.
    /// Starts the acknowledgement timer of a delivery.
    pub fn notify_message_sent(&self, client: ClientId, envelope: &ServerEnvelope) {
        if let Message::Deliver(deliver) = &envelope.message {
            self.in_flight.touch(client, deliver.id, Instant::now());
        }
    }

    /// Treats deliveries older than the acknowledgement timeout as rejected.
    /// Returns how many were expired.
    pub async fn expire_in_flight(&self) -> usize {
        self.expire_in_flight_at(Instant::now()).await
    }

    pub async fn expire_in_flight_at(&self, now: Instant) -> usize {
        if self.settings.ack_timeout_ms == 0 {
            return 0;
        }
        let timeout = Duration::from_millis(self.settings.ack_timeout_ms);

        // entries acknowledged since the scan resolve to nothing
        let expired: Vec<InFlightDelivery> = self
            .in_flight
            .expired(now, timeout)
            .into_iter()
            .filter_map(|(recipient, id)| self.in_flight.resolve(recipient, id))
            .collect();
        let count = expired.len();

        let retries = expired
            .into_iter()
            .map(|delivery| self.redeliver_or_dead_letter(delivery, "acknowledgement timed out"));
        join_all(retries).await;
        count
    }

    /// Runs [`Broker::expire_in_flight`] every `expiry_interval_ms` until
    /// `cancel` fires.
    pub fn start_expiry_loop(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_millis(self.settings.expiry_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = self.expire_in_flight().await;
                        if expired > 0 {
                            debug!("Expired {expired} unacknowledged deliveries");
                        }
                    }
                }
            }
            debug!("Expiry loop stopped");
        })
    }

    pub fn is_registered(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Current subscribers of a topic, empty if the topic does not exist.
    pub fn subscribers(&self, topic: &str) -> Vec<ClientId> {
        self.topics
            .get(&topic::normalize(topic))
            .map(|topic| topic.snapshot())
            .unwrap_or_default()
    }

    pub fn is_in_flight(&self, recipient: ClientId, id: Uuid) -> bool {
        self.in_flight.contains(recipient, id)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn dead_letter_count(&self) -> u64 {
        self.dead_letters.load(Ordering::Relaxed)
    }

    /// Records `deliver` as in flight and hands it to `client`. The entry is
    /// dropped again if the send fails.
    async fn deliver(&self, client: Arc<dyn MessageClient>, deliver: DeliverMessage, redeliveries: u32) {
        let recipient = client.id();
        let id = deliver.id;
        self.in_flight
            .insert(InFlightDelivery::new(recipient, deliver.clone(), redeliveries));

        let envelope = ServerEnvelope::for_message(Message::Deliver(deliver));
        if let Err(e) = client.send_message(envelope).await {
            self.in_flight.resolve(recipient, id);
            error!("Failed to deliver {id} to {recipient}: {e}");
        }
    }

    async fn redeliver_or_dead_letter(&self, delivery: InFlightDelivery, cause: &str) {
        if delivery.redeliveries < self.settings.max_redeliveries {
            let client = self
                .clients
                .get(&delivery.recipient)
                .map(|client| Arc::clone(client.value()));
            if let Some(client) = client {
                let attempt = delivery.redeliveries + 1;
                info!(
                    "Redelivering {} to {} ({cause}, attempt {attempt})",
                    delivery.deliver.id, delivery.recipient
                );
                let mut deliver = delivery.deliver;
                deliver.timestamp = Utc::now();
                self.deliver(client, deliver, attempt).await;
                return;
            }
        }
        self.dead_letter(&delivery, cause);
    }

    fn dead_letter(&self, delivery: &InFlightDelivery, cause: &str) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Dead-lettered delivery {} on {} for {} ({cause}, {} redeliveries)",
            delivery.deliver.id, delivery.deliver.topic, delivery.recipient, delivery.redeliveries
        );
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}
