//! Inbound event ingestion
//!
//! `Ingestor` turns `(topic, bytes)` pairs into buffered messages. Payloads
//! that are not JSON objects are kept as raw bytes rather than rejected.
//! Two sources feed it:
//!
//! - `MqttIngest`: one broker connection, QoS 0 subscriptions renewed on
//!   every (re)connect, reconnecting with a doubling delay
//! - `NatsIngest`: NATS core subscriptions, one task per subject pattern

use crate::buffer::PersistentBuffer;
use crate::config::{BusConfig, MqttConfig};
use crate::error::{RelayError, Result};
use crate::types::{Message, Payload};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Entry point for inbound events
#[derive(Clone)]
pub struct Ingestor {
    buffer: Arc<PersistentBuffer>,
}

impl Ingestor {
    /// Create an ingestor writing into `buffer`
    pub fn new(buffer: Arc<PersistentBuffer>) -> Self {
        Self { buffer }
    }

    /// Buffer one inbound event
    ///
    /// Only storage failures are returned; unparseable payloads are wrapped.
    pub async fn ingest(&self, topic: &str, raw: &[u8]) -> Result<Message> {
        let payload = Payload::parse(raw);
        if payload.is_raw() {
            tracing::debug!(topic, bytes = raw.len(), "Payload is not a JSON object, storing raw");
        }
        self.buffer.add(topic, payload).await
    }

    /// Ingest every item of `stream` until it ends or `shutdown` flips to true
    ///
    /// Storage errors are logged per event and do not stop the stream.
    /// Returns the number of events buffered.
    pub async fn forward<S>(&self, stream: S, mut shutdown: watch::Receiver<bool>) -> usize
    where
        S: Stream<Item = (String, Bytes)>,
    {
        tokio::pin!(stream);
        let mut accepted = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                item = stream.next() => {
                    let Some((topic, raw)) = item else { break };
                    match self.ingest(&topic, &raw).await {
                        Ok(_) => accepted += 1,
                        Err(e) => tracing::error!(
                            topic = %topic,
                            error = %e,
                            "Failed to add message to buffer"
                        ),
                    }
                }
            }
        }

        accepted
    }
}

/// Forwarding tasks sharing one shutdown signal
struct Forwarders {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<usize>>,
}

impl Forwarders {
    /// Subscribe to each subject in turn and forward it on its own task
    ///
    /// If any subscription fails, the tasks already started are stopped and
    /// joined before the error is returned.
    async fn start<F, Fut, S>(
        subjects: &[String],
        ingestor: &Ingestor,
        mut subscribe: F,
    ) -> Result<Self>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<S>>,
        S: Stream<Item = (String, Bytes)> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let mut forwarders = Self {
            shutdown,
            tasks: Vec::with_capacity(subjects.len()),
        };

        for subject in subjects {
            let stream = match subscribe(subject.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(
                        subject = %subject,
                        started = forwarders.tasks.len(),
                        "Subscribe failed, stopping started subscriptions"
                    );
                    forwarders.stop().await;
                    return Err(e);
                }
            };

            tracing::info!(subject = %subject, "Subscribed");

            let ingestor = ingestor.clone();
            let rx = rx.clone();
            let subject = subject.clone();
            forwarders.tasks.push(tokio::spawn(async move {
                let count = ingestor.forward(stream, rx).await;
                tracing::info!(subject = %subject, count, "Subscription closed");
                count
            }));
        }

        Ok(forwarders)
    }

    /// Signal every task and sum what they buffered
    async fn stop(self) -> usize {
        let _ = self.shutdown.send(true);
        let mut total = 0;
        for task in self.tasks {
            match task.await {
                Ok(count) => total += count,
                Err(e) => tracing::warn!(error = %e, "Ingest task failed"),
            }
        }
        total
    }
}

/// NATS core subscriptions feeding an `Ingestor`
pub struct NatsIngest {
    client: async_nats::Client,
    forwarders: Forwarders,
}

impl NatsIngest {
    /// Connect to the bus and start one forwarding task per subject
    pub async fn start(config: &BusConfig, ingestor: Ingestor) -> Result<Self> {
        let client = connect(config).await?;

        let forwarders = Forwarders::start(&config.subjects, &ingestor, |subject| {
            let client = client.clone();
            async move {
                let subscriber = client
                    .subscribe(subject.clone())
                    .await
                    .map_err(|e| RelayError::Subscribe {
                        subject,
                        reason: e.to_string(),
                    })?;
                Ok::<_, RelayError>(
                    subscriber.map(|msg| (msg.subject.to_string(), msg.payload)),
                )
            }
        })
        .await?;

        Ok(Self { client, forwarders })
    }

    /// The underlying NATS client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Stop forwarding; an event being added completes first
    ///
    /// Returns the total number of events buffered by all subscriptions.
    pub async fn shutdown(self) -> usize {
        self.forwarders.stop().await
    }
}

async fn connect(config: &BusConfig) -> Result<async_nats::Client> {
    let mut opts = async_nats::ConnectOptions::new()
        .name(&config.client_name)
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .event_callback(|event| async move {
            tracing::info!(event = %event, "NATS connection event");
        });

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    let client = opts
        .connect(&config.url)
        .await
        .map_err(|e| RelayError::Connection(format!("{}: {}", config.url, e)))?;

    tracing::info!(url = %config.url, "Connected to NATS");
    Ok(client)
}

/// Doubling delay between reconnect attempts, reset by a successful connect
#[derive(Debug, Clone)]
struct ReconnectDelay {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl ReconnectDelay {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial.min(max),
        }
    }

    /// Delay to wait now; doubles the following one up to `max`
    fn advance(&mut self) -> Duration {
        let delay = self.next;
        self.next = delay.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}

/// MQTT broker subscription feeding an `Ingestor`
///
/// The connection is made in the background and retried forever; topics are
/// subscribed at QoS 0 on every CONNACK, since the session is not persisted
/// on the broker.
pub struct MqttIngest {
    client: AsyncClient,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<usize>,
}

impl MqttIngest {
    /// Start the event loop task
    ///
    /// Fails only on an unusable broker address or client id.
    pub fn start(config: &MqttConfig, topics: &[String], ingestor: Ingestor) -> Result<Self> {
        let (host, port) = config.endpoint()?;
        config.check_client_id()?;

        let mut options = MqttOptions::new(config.client_id.clone(), host.clone(), port);
        options.set_keep_alive(config.keep_alive());
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        // Room for every SUBSCRIBE queued on a CONNACK
        let (client, event_loop) = AsyncClient::new(options, topics.len().max(10));
        let (shutdown, rx) = watch::channel(false);

        let delay =
            ReconnectDelay::new(config.reconnect_interval(), config.max_reconnect_interval());
        let task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            topics.to_vec(),
            ingestor,
            delay,
            rx,
        ));

        tracing::info!(host = %host, port, client_id = %config.client_id, "MQTT ingest started");
        Ok(Self {
            client,
            shutdown,
            task,
        })
    }

    /// The underlying MQTT client
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Stop the event loop; an event being added completes first
    ///
    /// Returns the number of events buffered.
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "MQTT ingest task failed");
                0
            }
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    topics: Vec<String>,
    ingestor: Ingestor,
    mut delay: ReconnectDelay,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut accepted = 0;
    let mut connected = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected = true;
                    delay.reset();
                    tracing::info!("MQTT connected");
                    for topic in &topics {
                        match client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                            Ok(()) => tracing::info!(topic = %topic, "Subscribed"),
                            Err(e) => tracing::error!(topic = %topic, error = %e, "Failed to subscribe"),
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match ingestor.ingest(&publish.topic, &publish.payload).await {
                        Ok(_) => accepted += 1,
                        Err(e) => tracing::error!(
                            topic = %publish.topic,
                            error = %e,
                            "Failed to add message to buffer"
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let wait = delay.advance();
                    if connected {
                        tracing::warn!(error = %e, "MQTT connection lost");
                        connected = false;
                    } else {
                        tracing::warn!(error = %e, retry_secs = wait.as_secs(), "MQTT connect failed");
                    }

                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    tracing::info!(count = accepted, "MQTT ingest stopped");
    accepted
}
