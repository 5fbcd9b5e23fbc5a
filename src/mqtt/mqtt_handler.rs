//! Bridge session: one MQTT connection feeding one state aggregator
//!
//! # State Machine
//!
//! ```text
//! Configured ──subscribe──► Subscribed ──start──► Running ──shutdown──► (status)
//! ```
//!
//! # Data Flow
//!
//! ```text
//! broker ─[status/*]→ ingest ─→ StateAggregator ─→ watch<DeviceState>
//!                                     ▲
//! BridgeHandle ─[CommandRequest]→ CommandBuilder ─[set/*]→ broker
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Packet, QoS};
use statum::{machine, state};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message_manager::{ingest, MQTTMessage};
use crate::command::{Command, CommandBuilder, Outbound};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::state::{DeviceInfo, DeviceState, StateAggregator};
use crate::topics::TopicLayout;

/// Aggregator shared between the session task and its handle
pub type SharedAggregator = Arc<Mutex<StateAggregator>>;

const REQUEST_CAPACITY: usize = 32;
const COMMAND_CAPACITY: usize = 32;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_ERROR_MESSAGES: usize = 20;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub connections: usize,
    pub messages_received: usize,
    pub messages_rejected: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl MQTTStatus {
    fn record_error(&mut self, message: String) {
        if self.error_messages.len() == MAX_ERROR_MESSAGES {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

/// A command plus the channel its publish result is reported on
#[derive(Debug)]
pub struct CommandRequest {
    pub command: Command,
    pub response_tx: oneshot::Sender<Result<(), BridgeError>>,
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Configured, // Client and aggregator created, nothing sent yet
    Subscribed, // Status topics requested
    Running,    // Event loop, liveness tick and commands active
}

#[machine]
pub struct BridgeSession<S: SessionState> {
    config: BridgeConfig,
    topics: TopicLayout,
    builder: CommandBuilder,
    client: AsyncClient,
    eventloop: EventLoop,
    aggregator: SharedAggregator,
    status: MQTTStatus,
}

impl<S: SessionState> BridgeSession<S> {
    pub fn status(&self) -> &MQTTStatus {
        &self.status
    }

    pub fn topics(&self) -> &TopicLayout {
        &self.topics
    }

    /// Queues an outbound message without waiting on the event loop
    fn publish(&mut self, outbound: &Outbound) -> Result<(), BridgeError> {
        let payload = outbound.payload_bytes().map_err(BridgeError::Encode)?;
        self.client
            .try_publish(outbound.topic.clone(), QoS::AtMostOnce, false, payload)?;
        self.status.messages_sent += 1;
        debug!("Published to {}: {}", outbound.topic, outbound.payload);
        Ok(())
    }
}

impl BridgeSession<Configured> {
    pub fn create(config: BridgeConfig, aggregator: SharedAggregator) -> Self {
        info!(
            "Creating bridge session for '{}' on {}:{}",
            config.device_name, config.mqtt.host, config.mqtt.port
        );

        let topics = TopicLayout::new(config.topic_prefix.clone());
        let builder = CommandBuilder::new(topics.clone(), config.pitmaster_contract);
        let (client, eventloop) = AsyncClient::new(config.mqtt.to_options(), REQUEST_CAPACITY);

        Self::new(
            config,
            topics,
            builder,
            client,
            eventloop,
            aggregator,
            MQTTStatus::default(),
        )
    }

    /// Requests the status topics and transitions to Subscribed
    pub async fn subscribe(mut self) -> Result<BridgeSession<Subscribed>, BridgeError> {
        for (topic, kind) in self.topics.inbound() {
            self.client.subscribe(topic.clone(), QoS::AtMostOnce).await?;
            info!("Subscribed to {} ({})", topic, kind);
        }
        self.status.connection_state = ConnectionState::Connecting;
        Ok(self.transition())
    }
}

impl BridgeSession<Subscribed> {
    /// Optionally asks the device for a full dump, then transitions to Running
    pub fn start(mut self) -> Result<BridgeSession<Running>, BridgeError> {
        if self.config.startup.request_full_state {
            let outbound = self
                .builder
                .build(&Command::RequestFullState, &DeviceState::default())?;
            self.publish(&outbound)?;
            info!("Requested full state on {}", outbound.topic);
        }
        Ok(self.transition())
    }
}

impl BridgeSession<Running> {
    /// Main loop; returns the final connection status once shut down
    ///
    /// Stops when the token is cancelled or every command sender is gone.
    pub async fn run_until_shutdown(
        mut self,
        mut commands: mpsc::Receiver<CommandRequest>,
        shutdown: CancellationToken,
    ) -> MQTTStatus {
        info!("Bridge for '{}' running", self.config.device_name);

        let mut liveness_tick = tokio::time::interval(self.config.liveness.check_interval());
        liveness_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received for '{}'", self.config.device_name);
                    break;
                }

                event = self.eventloop.poll() => {
                    self.handle_event(event).await;
                }

                _ = liveness_tick.tick() => {
                    self.check_liveness().await;
                }

                request = commands.recv() => match request {
                    Some(CommandRequest { command, response_tx }) => {
                        let result = self.execute(&command).await;
                        if let Err(e) = &result {
                            warn!("Command {:?} failed: {}", command, e);
                        }
                        if response_tx.send(result).is_err() {
                            debug!("Command requester went away before the result was sent");
                        }
                    }
                    None => {
                        info!("Command channel closed, stopping bridge");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        self.status.connection_state = ConnectionState::Disconnected;
        self.status
    }

    async fn handle_event(&mut self, event: Result<Event, ConnectionError>) {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(
                    "Connected to broker {}:{}",
                    self.config.mqtt.host, self.config.mqtt.port
                );
                if self.status.connections > 0 && !ack.session_present {
                    self.resubscribe();
                }
                self.status.connections += 1;
                self.status.connection_state = ConnectionState::Connected;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = MQTTMessage::from_publish(&publish);
                self.handle_message(&message).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                self.status.connection_state = if self.status.connections > 0 {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Failed
                };
                self.status.record_error(e.to_string());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    fn resubscribe(&mut self) {
        for (topic, _) in self.topics.inbound() {
            if let Err(e) = self.client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                warn!("Failed to resubscribe to {}: {}", topic, e);
                self.status.record_error(e.to_string());
            }
        }
    }

    async fn handle_message(&mut self, message: &MQTTMessage) {
        self.status.last_activity = Some(chrono::Local::now());

        let result = {
            let mut aggregator = self.aggregator.lock().await;
            ingest(&mut aggregator, &self.topics, message)
        };

        match result {
            Ok(Some(kind)) => {
                self.status.messages_received += 1;
                debug!("Merged {} fragment from {}", kind, message.topic());
            }
            Ok(None) => {}
            Err(e) => {
                self.status.messages_rejected += 1;
                error!("Dropping message {}: {}", message, e);
                self.status.record_error(e.to_string());
            }
        }
    }

    async fn check_liveness(&mut self) {
        let transition = self.aggregator.lock().await.check_liveness(Utc::now());
        if let Some(transition) = transition {
            warn!("'{}' is offline: {}", self.config.device_name, transition);
        }
    }

    /// Publishes one command, then applies its optimistic mutations
    ///
    /// Nothing is written locally when the publish fails.
    async fn execute(&mut self, command: &Command) -> Result<(), BridgeError> {
        let outbound = {
            let aggregator = self.aggregator.lock().await;
            self.builder.build(command, aggregator.state())?
        };

        self.publish(&outbound)?;
        info!("Sent {:?} to {}", command, outbound.topic);

        let mut aggregator = self.aggregator.lock().await;
        for (path, value) in outbound.optimistic {
            aggregator.apply_optimistic(path, value);
        }
        Ok(())
    }
}

/// Owner-side handle of a running bridge session
///
/// Spawns the session task and exposes commands, snapshots and shutdown.
pub struct BridgeHandle {
    device_name: String,
    topics: TopicLayout,
    aggregator: SharedAggregator,
    snapshots: watch::Receiver<DeviceState>,
    command_tx: mpsc::Sender<CommandRequest>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<MQTTStatus>>,
}

impl BridgeHandle {
    /// Validates the config, connects the session and starts its task
    pub async fn spawn(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let (snapshot_tx, snapshot_rx) = watch::channel(DeviceState::default());
        let mut aggregator = StateAggregator::new();
        aggregator.subscribe(Box::new(move |state: &DeviceState| {
            snapshot_tx.send_replace(state.clone());
        }));
        let aggregator: SharedAggregator = Arc::new(Mutex::new(aggregator));

        let session = BridgeSession::create(config.clone(), aggregator.clone())
            .subscribe()
            .await?
            .start()?;
        let topics = session.topics().clone();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { session.run_until_shutdown(command_rx, token).await });

        info!("Bridge task spawned for '{}'", config.device_name);
        Ok(Self {
            device_name: config.device_name,
            topics,
            aggregator,
            snapshots: snapshot_rx,
            command_tx,
            shutdown,
            task: Some(task),
        })
    }

    /// Publishes a command and waits for the publish result
    pub async fn send(&self, command: Command) -> Result<(), BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(CommandRequest {
                command,
                response_tx,
            })
            .await
            .map_err(|e| BridgeError::ChannelError(format!("bridge task stopped: {}", e)))?;

        response_rx
            .await
            .map_err(|e| BridgeError::ChannelError(format!("no response from bridge: {}", e)))?
    }

    /// Receiver that observes every document change
    pub fn snapshots(&self) -> watch::Receiver<DeviceState> {
        self.snapshots.clone()
    }

    pub async fn snapshot(&self) -> DeviceState {
        self.aggregator.lock().await.snapshot()
    }

    pub async fn device_info(&self) -> DeviceInfo {
        let aggregator = self.aggregator.lock().await;
        DeviceInfo::from_state(&self.device_name, self.topics.prefix(), aggregator.state())
    }

    /// Waits until the first fragment has been merged, up to `timeout`
    pub async fn wait_for_first_data(&self, timeout: Duration) -> bool {
        let mut snapshots = self.snapshots.clone();
        let ready = tokio::time::timeout(timeout, snapshots.wait_for(|state| !state.is_empty()))
            .await
            .is_ok_and(|result| result.is_ok());
        ready
    }

    /// Stops the session task and returns its final status
    pub async fn shutdown(mut self) -> Option<MQTTStatus> {
        self.shutdown.cancel();
        let task = self.task.take()?;
        match task.await {
            Ok(status) => Some(status),
            Err(e) => {
                error!("Bridge task ended abnormally: {}", e);
                None
            }
        }
    }
}
