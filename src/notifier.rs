//! The notifier actor and its public handles.
//!
//! [`Notifier`] is a cheap clonable handle to a single actor task that
//! owns the database connection and all subscription state. The actor
//! processes one message at a time, so no two state mutations ever
//! race, and at most one `LISTEN`/`UNLISTEN` command is in flight: the
//! command is awaited to completion before the next mailbox message is
//! taken, and the caller's reply is sent only after the database
//! acknowledged it.
//!
//! Subscribers hold a [`Subscription`]; dropping it is the termination
//! event that triggers liveness cleanup.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;

use crate::channel::{self, Topic};
use crate::config::RelayConfig;
use crate::driver::{Driver, DriverEvent, PgDriver};
use crate::error::RelayError;
use crate::registry::{ListenerId, MonitorGuard, Registry};

/// A notification as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// Name of the relay instance that received the notification.
    pub source: String,
    /// Topic the notification was published under.
    pub topic: Topic,
    /// Raw payload string, exactly as published.
    pub payload: String,
}

/// Mailbox message for the actor.
#[derive(Debug)]
enum Message {
    Listen {
        listener: ListenerId,
        sender: UnboundedSender<Envelope>,
        topics: Vec<Topic>,
        reply: oneshot::Sender<()>,
    },
    Unlisten {
        listener: ListenerId,
        topics: Vec<Topic>,
        reply: oneshot::Sender<()>,
    },
    Notify {
        topic: Topic,
        payloads: Vec<String>,
    },
    Down {
        listener: ListenerId,
    },
}

/// Handle to a running notifier actor.
///
/// Cloning is cheap; all clones talk to the same actor. The actor exits
/// once every `Notifier` clone and every [`Subscription`] is dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: UnboundedSender<Message>,
    config: Arc<RelayConfig>,
}

impl Notifier {
    /// Starts the actor with the production [`PgDriver`]. The connection
    /// is established in the background with automatic reconnection;
    /// subscriptions made before the first connect are registered
    /// locally and LISTENed as soon as the connection is up.
    #[must_use]
    pub fn start(config: RelayConfig) -> Self {
        let driver = PgDriver::new(&config);
        Self::start_with_driver(config, driver)
    }

    /// Starts the actor with a custom [`Driver`]. This is the seam used
    /// by the crate's own tests; embedders with their own connection
    /// primitive can use it too.
    #[must_use]
    pub fn start_with_driver<D>(config: RelayConfig, driver: D) -> Self
    where
        D: Driver + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);

        let actor = Actor {
            config: Arc::clone(&config),
            driver,
            rx,
            tx: tx.downgrade(),
            registry: Registry::default(),
            connected: false,
        };
        tokio::spawn(async move {
            match actor.run().await {
                Ok(()) => tracing::debug!("notifier drained and stopped"),
                Err(error) => tracing::error!(error = %error, "notifier terminated"),
            }
        });

        Self { tx, config }
    }

    /// Registers a new subscriber for `topics` and returns its
    /// [`Subscription`].
    ///
    /// Resolves once the registration took effect: immediately when the
    /// connection is down or no new channel was needed, otherwise after
    /// the database acknowledged the batched `LISTEN`. From that point
    /// on, no notification published to these topics can be missed due
    /// to a registration race (while the connection stays up).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Shutdown`] if the actor is no longer
    /// running.
    pub async fn listen(&self, topics: Vec<Topic>) -> Result<Subscription, RelayError> {
        let listener = ListenerId::new();
        let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(Message::Listen {
                listener,
                sender: envelope_tx.clone(),
                topics,
                reply: reply_tx,
            })
            .map_err(|_| RelayError::Shutdown)?;
        reply_rx.await.map_err(|_| RelayError::Shutdown)?;

        Ok(Subscription {
            listener,
            tx: self.tx.clone(),
            envelope_tx,
            envelope_rx,
        })
    }

    /// Publishes a batch of pre-serialized payloads to a topic.
    ///
    /// Fire-and-forget: the call returns once the request is queued; the
    /// actor executes one notify query per batch on the shared
    /// connection. Batches published while the connection is down are
    /// dropped — delivery across an outage is out of scope for the
    /// underlying notify mechanism.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Shutdown`] if the actor is no longer
    /// running.
    pub fn notify(&self, topic: Topic, payloads: Vec<String>) -> Result<(), RelayError> {
        if payloads.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Message::Notify { topic, payloads })
            .map_err(|_| RelayError::Shutdown)
    }

    /// Returns the configuration the actor was started with.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// One subscriber's registration, delivery stream included.
///
/// Dropping the `Subscription` is the subscriber's termination signal:
/// the actor removes its interest and UNLISTENs channels nobody else
/// wants.
#[derive(Debug)]
pub struct Subscription {
    listener: ListenerId,
    tx: UnboundedSender<Message>,
    envelope_tx: UnboundedSender<Envelope>,
    envelope_rx: UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// Receives the next notification for this subscriber.
    ///
    /// Already-delivered notifications are drained first; returns `None`
    /// once the actor has stopped and nothing is buffered.
    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::select! {
            biased;
            envelope = self.envelope_rx.recv() => envelope,
            () = self.tx.closed() => None,
        }
    }

    /// Adds topics to this subscription. Re-listening to a topic the
    /// subscription already holds is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Shutdown`] if the actor is no longer
    /// running.
    pub async fn listen(&self, topics: Vec<Topic>) -> Result<(), RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Message::Listen {
                listener: self.listener,
                sender: self.envelope_tx.clone(),
                topics,
                reply: reply_tx,
            })
            .map_err(|_| RelayError::Shutdown)?;
        reply_rx.await.map_err(|_| RelayError::Shutdown)
    }

    /// Removes topics from this subscription. Resolves after the
    /// matching `UNLISTEN` took effect when one was needed. Topics the
    /// subscription never held are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Shutdown`] if the actor is no longer
    /// running.
    pub async fn unlisten(&self, topics: Vec<Topic>) -> Result<(), RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Message::Unlisten {
                listener: self.listener,
                topics,
                reply: reply_tx,
            })
            .map_err(|_| RelayError::Shutdown)?;
        reply_rx.await.map_err(|_| RelayError::Shutdown)
    }
}

/// Which side of the select woke the actor.
enum Wake {
    Mailbox(Option<Message>),
    Driver(DriverEvent),
}

/// The actor: single owner of registry, connection status and driver.
struct Actor<D> {
    config: Arc<RelayConfig>,
    driver: D,
    rx: UnboundedReceiver<Message>,
    /// Weak so monitor tasks never keep the mailbox open on their own;
    /// the actor drains and exits when all public handles are gone.
    tx: WeakUnboundedSender<Message>,
    registry: Registry,
    connected: bool,
}

impl<D: Driver> Actor<D> {
    async fn run(mut self) -> Result<(), RelayError> {
        loop {
            let wake = tokio::select! {
                message = self.rx.recv() => Wake::Mailbox(message),
                event = self.driver.recv() => Wake::Driver(event),
            };
            match wake {
                Wake::Mailbox(Some(message)) => self.on_message(message).await?,
                Wake::Mailbox(None) => return Ok(()),
                Wake::Driver(event) => self.on_event(event).await?,
            }
        }
    }

    async fn on_message(&mut self, message: Message) -> Result<(), RelayError> {
        match message {
            Message::Listen {
                listener,
                sender,
                topics,
                reply,
            } => {
                let channels = self.channel_names(&topics);
                let delta = self.registry.add_listener(listener, &sender, channels, || {
                    spawn_monitor(listener, &sender, self.tx.clone())
                });
                if self.connected && !delta.is_empty() {
                    self.driver.execute(&channel::listen_sql(&delta)).await?;
                }
                let _ = reply.send(());
            }
            Message::Unlisten {
                listener,
                topics,
                reply,
            } => {
                let channels = self.channel_names(&topics);
                let delta = self.registry.remove_listener_channels(listener, &channels);
                if self.connected && !delta.is_empty() {
                    self.driver.execute(&channel::unlisten_sql(&delta)).await?;
                }
                let _ = reply.send(());
            }
            Message::Notify { topic, payloads } => {
                if !self.connected {
                    tracing::warn!(
                        topic = %topic,
                        payloads = payloads.len(),
                        "dropping publish while disconnected"
                    );
                    return Ok(());
                }
                let channel = channel::channel_name(&self.config.channel_prefix, &topic);
                self.driver.notify(&channel, &payloads).await?;
            }
            Message::Down { listener } => {
                let delta = self.registry.remove_listener(listener);
                if self.connected && !delta.is_empty() {
                    tracing::debug!(%listener, channels = delta.len(), "listener down");
                    self.driver.execute(&channel::unlisten_sql(&delta)).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_event(&mut self, event: DriverEvent) -> Result<(), RelayError> {
        match event {
            DriverEvent::Connected => {
                self.connected = true;
                if !self.registry.is_empty() {
                    let channels = self.registry.channel_names();
                    tracing::info!(channels = channels.len(), "resubscribing after connect");
                    self.driver.execute(&channel::listen_sql(&channels)).await?;
                }
            }
            DriverEvent::Disconnected => {
                // Registry state is kept; LISTENs are rebuilt on reconnect.
                self.connected = false;
            }
            DriverEvent::Notification { channel, payload } => {
                if self.registry.subscribers_of(&channel).is_empty() {
                    // Unsubscribe races are expected; not an error.
                    tracing::trace!(%channel, "notification without subscribers");
                    return Ok(());
                }
                let topic = channel::channel_topic(&self.config.channel_prefix, &channel)
                    .ok_or_else(|| RelayError::UnknownChannel(channel.clone()))?;
                for sender in self.registry.senders_of(&channel) {
                    let _ = sender.send(Envelope {
                        source: self.config.name.clone(),
                        topic: topic.clone(),
                        payload: payload.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn channel_names(&self, topics: &[Topic]) -> Vec<String> {
        topics
            .iter()
            .map(|topic| channel::channel_name(&self.config.channel_prefix, topic))
            .collect()
    }
}

/// Spawns the watch task that turns "subscriber dropped its receiver"
/// into a `Down` message. The returned guard aborts the task when the
/// listener's registry entry is removed.
fn spawn_monitor(
    listener: ListenerId,
    sender: &UnboundedSender<Envelope>,
    tx: WeakUnboundedSender<Message>,
) -> MonitorGuard {
    let sender = sender.clone();
    let handle = tokio::spawn(async move {
        sender.closed().await;
        if let Some(tx) = tx.upgrade() {
            let _ = tx.send(Message::Down { listener });
        }
    });
    MonitorGuard::new(handle.abort_handle())
}
