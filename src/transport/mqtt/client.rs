//! Impure I/O: socket, dialer, driver task and per-work-item contexts
//!
//! A [`Socket`] owns the inbound queue, the lifecycle callbacks and the
//! pending SUBACK callbacks. A [`Dialer`] binds it to a broker URL and, once
//! started, creates the rumqttc client and spawns the driver task that polls
//! the event loop. Every (re)connection re-sends the same CONNECT.
//!
//! Work items talk to the socket through [`MqttContext`]s. Each inbound
//! PUBLISH is handed to exactly one context.

use super::connection::{
    configure_mqtt_options_v4, configure_mqtt_options_v5, parse_broker_url, BrokerAddress,
    ConnectMessage, ConnectionState, MqttError, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{LinkEvent, MessageHandler, TRANSPORT_LOST_REASON};
use super::tls::{init_dialer_tls, TlsSettings};
use crate::config::{ClientConfig, ConfigError, ProtocolVersion, TopicQos};
use crate::error::RelayError;
use crate::message::Message;
use crate::observability::metrics;
use crate::persistence::{OfflineStore, PersistenceConfig};
use crate::transport::RelayContext;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rumqttc::tokio_rustls::rustls;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Lifecycle callback receiving the CONNACK or DISCONNECT reason code
pub type LifecycleCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Completion for one SUBSCRIBE; `None` when no SUBACK will arrive
pub type SubAckCallback = Box<dyn FnOnce(Option<SubAckPacket>) + Send>;

/// Raw SUBACK contents handed to a subscribe callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    /// Granted QoS or failure code, index-aligned with the request
    pub reason_codes: Vec<u8>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn qos_v4(qos: u8) -> rumqttc::QoS {
    match qos {
        0 => rumqttc::QoS::AtMostOnce,
        1 => rumqttc::QoS::AtLeastOnce,
        _ => rumqttc::QoS::ExactlyOnce,
    }
}

fn qos_v5(qos: u8) -> rumqttc::v5::mqttbytes::QoS {
    use rumqttc::v5::mqttbytes::QoS;
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// rumqttc request handle for either protocol version
#[derive(Clone)]
enum AnyClient {
    V4(rumqttc::AsyncClient),
    V5(rumqttc::v5::AsyncClient),
}

impl AnyClient {
    async fn publish(&self, msg: &Message) -> Result<(), MqttError> {
        match self {
            AnyClient::V4(client) => client
                .publish(msg.topic(), qos_v4(msg.qos()), msg.retain(), msg.payload().to_vec())
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e))),
            AnyClient::V5(client) => client
                .publish(msg.topic(), qos_v5(msg.qos()), msg.retain(), msg.payload_bytes())
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e))),
        }
    }

    async fn subscribe_many(&self, topics: &[TopicQos]) -> Result<(), MqttError> {
        match self {
            AnyClient::V4(client) => {
                let filters = topics
                    .iter()
                    .map(|t| rumqttc::SubscribeFilter::new(t.topic.clone(), qos_v4(t.qos)));
                client
                    .subscribe_many(filters)
                    .await
                    .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
            }
            AnyClient::V5(client) => {
                let filters = topics.iter().map(|t| {
                    rumqttc::v5::mqttbytes::v5::Filter::new(t.topic.clone(), qos_v5(t.qos))
                });
                client
                    .subscribe_many(filters)
                    .await
                    .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let result = match self {
            AnyClient::V4(client) => client.disconnect().await.map_err(|e| e.to_string()),
            AnyClient::V5(client) => client.disconnect().await.map_err(|e| e.to_string()),
        };
        result.map_err(MqttError::DisconnectFailed)
    }
}

enum PollError {
    /// Broker answered CONNECT with a failure code
    Refused(u8),
    Transport(String),
}

enum AnyEventLoop {
    V4(rumqttc::EventLoop),
    V5(rumqttc::v5::EventLoop),
}

impl AnyEventLoop {
    async fn poll(&mut self) -> Result<LinkEvent, PollError> {
        match self {
            AnyEventLoop::V4(event_loop) => match event_loop.poll().await {
                Ok(event) => Ok(MessageHandler::route_v4_event(&event)),
                Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                    Err(PollError::Refused(code as u8))
                }
                Err(e) => Err(PollError::Transport(e.to_string())),
            },
            AnyEventLoop::V5(event_loop) => match event_loop.poll().await {
                Ok(event) => Ok(MessageHandler::route_v5_event(&event)),
                Err(rumqttc::v5::ConnectionError::ConnectionRefused(code)) => {
                    Err(PollError::Refused(code as u8))
                }
                Err(e) => Err(PollError::Transport(e.to_string())),
            },
        }
    }
}

#[derive(Default)]
struct Callbacks {
    on_connect: Option<LifecycleCallback>,
    on_disconnect: Option<LifecycleCallback>,
}

struct SocketShared {
    version: ProtocolVersion,
    client: OnceCell<AnyClient>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    state_tx: watch::Sender<ConnectionState>,
    callbacks: StdMutex<Callbacks>,
    pending_subacks: StdMutex<VecDeque<SubAckCallback>>,
    offline: StdMutex<Option<OfflineStore>>,
    next_context_id: AtomicUsize,
}

impl SocketShared {
    fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn fire_connect(&self, reason_code: u8) {
        let callback = lock(&self.callbacks).on_connect.clone();
        if let Some(callback) = callback {
            callback(reason_code);
        }
    }

    fn fire_disconnect(&self, reason_code: u8) {
        let callback = lock(&self.callbacks).on_disconnect.clone();
        if let Some(callback) = callback {
            callback(reason_code);
        }
    }

    fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Connected {
                reason_code,
                session_present,
            } => {
                let next =
                    HealthMonitor::determine_next_state(&ConnectionEvent::ConnAckReceived {
                        reason_code,
                    });
                let previous = self.state_tx.send_replace(next.clone());
                HealthMonitor::log_state_transition(&previous, &next);
                debug!(session_present, "CONNACK received");

                if reason_code == 0 {
                    metrics().connection_established();
                }
                self.fire_connect(reason_code);

                if reason_code == 0 && lock(&self.offline).is_some() {
                    tokio::spawn(replay_offline(Arc::clone(self)));
                }
            }
            LinkEvent::Publish(msg) => {
                if self.inbox_tx.send(msg).is_err() {
                    debug!("Inbox closed, dropping inbound PUBLISH");
                }
            }
            LinkEvent::SubAck {
                packet_id,
                reason_codes,
            } => {
                let callback = lock(&self.pending_subacks).pop_front();
                match callback {
                    Some(callback) => callback(Some(SubAckPacket {
                        packet_id,
                        reason_codes,
                    })),
                    // Request already abandoned; rumqttc resent it after reconnecting
                    None => info!(
                        packet_id,
                        reason_codes = ?reason_codes,
                        "SUBACK arrived after its request was abandoned"
                    ),
                }
            }
            LinkEvent::Disconnected { reason_code } => {
                self.pipe_closed(
                    ConnectionEvent::DisconnectedByBroker { reason_code },
                    reason_code,
                );
            }
            LinkEvent::Infrastructure(description) => {
                debug!("MQTT event: {}", description);
            }
            LinkEvent::Outgoing => {}
        }
    }

    /// Record a closed pipe; callbacks only fire if the pipe had been up
    fn pipe_closed(&self, event: ConnectionEvent, reason_code: u8) {
        let next = HealthMonitor::determine_next_state(&event);
        let previous = self.state_tx.send_replace(next.clone());

        if !HealthMonitor::was_connected(&previous) {
            debug!("Dial attempt failed: {:?}", event);
            return;
        }

        HealthMonitor::log_state_transition(&previous, &next);
        metrics().connection_lost();
        self.fire_disconnect(reason_code);

        let abandoned: Vec<SubAckCallback> = lock(&self.pending_subacks).drain(..).collect();
        for callback in abandoned {
            callback(None);
        }
    }

    /// Store `msg` offline when persistence is on and the pipe is down
    fn buffer_offline(&self, msg: &Message) -> Result<bool, MqttError> {
        let mut guard = lock(&self.offline);
        let Some(store) = guard.as_mut() else {
            return Ok(false);
        };
        if HealthMonitor::can_publish(&self.state_tx.borrow()) {
            return Ok(false);
        }

        store
            .push(msg)
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
        metrics().message_buffered();
        debug!(topic = msg.topic(), "Broker unavailable, message stored offline");
        Ok(true)
    }
}

async fn replay_offline(shared: Arc<SocketShared>) {
    let rows = match lock(&shared.offline).as_mut().map(|store| store.pending_rows()) {
        Some(Ok(rows)) => rows,
        Some(Err(e)) => {
            error!("Failed to read offline store: {}", e);
            return;
        }
        None => return,
    };
    if rows.is_empty() {
        return;
    }
    let Some(client) = shared.client.get() else {
        return;
    };

    info!(rows = rows.len(), "Replaying offline messages");
    for (id, stored) in rows {
        let msg = stored.into_message();
        if let Err(e) = client.publish(&msg).await {
            warn!("Offline replay interrupted: {}", e);
            return;
        }
        metrics().message_replayed();

        if let Some(Err(e)) = lock(&shared.offline).as_mut().map(|store| store.acknowledge(id)) {
            warn!(id, "Failed to remove replayed row: {}", e);
        }
    }
}

async fn run_driver(
    shared: Arc<SocketShared>,
    mut event_loop: AnyEventLoop,
    reconnect: ReconnectConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempts = 0u32;

    loop {
        let polled = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            polled = event_loop.poll() => polled,
        };

        let failure = match polled {
            Ok(event) => {
                if matches!(event, LinkEvent::Connected { reason_code: 0, .. }) {
                    attempts = 0;
                }
                shared.handle_link_event(event);
                continue;
            }
            Err(failure) => failure,
        };

        match failure {
            PollError::Refused(code) => {
                warn!(reason_code = code, "Broker refused connection");
                shared.pipe_closed(ConnectionEvent::ConnAckReceived { reason_code: code }, code);
            }
            PollError::Transport(reason) => {
                shared.pipe_closed(ConnectionEvent::NetworkError(reason), TRANSPORT_LOST_REASON);
            }
        }

        let shutdown_requested = *shutdown_rx.borrow();
        match HealthMonitor::should_attempt_reconnection(attempts, &reconnect, shutdown_requested) {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                attempts = attempt;
                metrics().reconnect_attempt();
                shared.state_tx.send_replace(HealthMonitor::determine_next_state(
                    &ConnectionEvent::ReconnectionStarted(attempt),
                ));
                debug!(attempt, delay_ms, "Waiting before next dial");

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            ReconnectionDecision::AbortShutdownRequested => break,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!("gave up after {attempts} reconnection attempts");
                let next = HealthMonitor::determine_next_state(&ConnectionEvent::PermanentFailure(
                    reason,
                ));
                let previous = shared.state_tx.send_replace(next.clone());
                HealthMonitor::log_state_transition(&previous, &next);
                break;
            }
        }
    }

    info!("MQTT event loop stopped");
}

/// MQTT-capable socket for one protocol version
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Socket {
    pub fn open(version: ProtocolVersion) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);

        Self {
            shared: Arc::new(SocketShared {
                version,
                client: OnceCell::new(),
                inbox_tx,
                inbox_rx: Mutex::new(inbox_rx),
                state_tx,
                callbacks: StdMutex::new(Callbacks::default()),
                pending_subacks: StdMutex::new(VecDeque::new()),
                offline: StdMutex::new(None),
                next_context_id: AtomicUsize::new(0),
            }),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.shared.version
    }

    /// Invoked on every CONNACK with its reason code
    pub fn set_connect_cb<F>(&self, callback: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        lock(&self.shared.callbacks).on_connect = Some(Arc::new(callback));
    }

    /// Invoked when an established pipe closes
    pub fn set_disconnect_cb<F>(&self, callback: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        lock(&self.shared.callbacks).on_disconnect = Some(Arc::new(callback));
    }

    pub fn attach_offline_store(&self, store: OfflineStore) {
        *lock(&self.shared.offline) = Some(store);
    }

    pub fn has_offline_store(&self) -> bool {
        lock(&self.shared.offline).is_some()
    }

    /// Write any rows still buffered in memory to disk
    pub fn flush_offline_store(&self) -> Option<Result<usize, crate::persistence::PersistenceError>> {
        lock(&self.shared.offline).as_mut().map(|store| store.flush())
    }

    /// A new independent context for one work item
    pub fn open_context(&self) -> MqttContext {
        MqttContext {
            id: self.shared.next_context_id.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    /// Whether a dialer has been started on this socket
    pub fn is_started(&self) -> bool {
        self.shared.client.get().is_some()
    }

    /// Queue a SUBSCRIBE; `callback` runs once with the matching SUBACK
    pub async fn subscribe_with_callback(
        &self,
        topics: &[TopicQos],
        callback: SubAckCallback,
    ) -> Result<(), MqttError> {
        let client = self.shared.client.get().ok_or(MqttError::NotStarted)?;

        lock(&self.shared.pending_subacks).push_back(callback);
        if let Err(e) = client.subscribe_many(topics).await {
            lock(&self.shared.pending_subacks).pop_back();
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let client = self.shared.client.get().ok_or(MqttError::NotStarted)?;
        client.disconnect().await
    }
}

/// Binds a socket to a broker URL and drives (re)connection
pub struct Dialer {
    socket: Socket,
    address: BrokerAddress,
    connect: Option<ConnectMessage>,
    tls: Option<Arc<rustls::ClientConfig>>,
    reconnect: ReconnectConfig,
    request_capacity: usize,
}

impl Dialer {
    pub fn create(socket: &Socket, url: &str) -> Result<Self, MqttError> {
        let address = parse_broker_url(url)?;
        Ok(Self {
            socket: socket.clone(),
            address,
            connect: None,
            tls: None,
            reconnect: ReconnectConfig::default(),
            request_capacity: 64,
        })
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    /// CONNECT re-sent on every (re)connection
    pub fn set_connect_message(&mut self, connect: ConnectMessage) {
        self.connect = Some(connect);
    }

    pub fn set_tls_config(&mut self, config: Arc<rustls::ClientConfig>) {
        self.tls = Some(config);
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn set_reconnect(&mut self, reconnect: ReconnectConfig) {
        self.reconnect = reconnect;
    }

    pub fn set_request_capacity(&mut self, capacity: usize) {
        self.request_capacity = capacity.max(1);
    }

    /// Start dialing without waiting for the connection
    pub fn start(self) -> Result<DialerHandle, MqttError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MqttError::NoRuntime)?;
        if self.socket.is_started() {
            return Err(MqttError::AlreadyStarted);
        }

        let version = self.socket.version();
        let connect = self.connect.unwrap_or_else(|| ConnectMessage::new(version));
        if connect.version != version {
            warn!(
                connect = %connect.version,
                socket = %version,
                "CONNECT version differs from socket, socket version wins"
            );
        }
        let transport = self.tls.map(|config| {
            rumqttc::Transport::tls_with_config(rumqttc::TlsConfiguration::Rustls(config))
        });

        let (client, event_loop) = match version {
            ProtocolVersion::V311 => {
                let mut options = configure_mqtt_options_v4(&self.address, &connect);
                if let Some(transport) = transport {
                    options.set_transport(transport);
                }
                let (client, event_loop) =
                    rumqttc::AsyncClient::new(options, self.request_capacity);
                (AnyClient::V4(client), AnyEventLoop::V4(event_loop))
            }
            ProtocolVersion::V5 => {
                let mut options = configure_mqtt_options_v5(&self.address, &connect);
                if let Some(transport) = transport {
                    options.set_transport(transport);
                }
                let (client, event_loop) =
                    rumqttc::v5::AsyncClient::new(options, self.request_capacity);
                (AnyClient::V5(client), AnyEventLoop::V5(event_loop))
            }
        };

        self.socket
            .shared
            .client
            .set(client)
            .map_err(|_| MqttError::AlreadyStarted)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = crate::mqtt_span!(
            host = %self.address.host,
            port = self.address.port,
            client_id = %connect.client_id
        );
        let task = runtime.spawn(
            run_driver(
                Arc::clone(&self.socket.shared),
                event_loop,
                self.reconnect,
                shutdown_rx,
            )
            .instrument(span),
        );

        Ok(DialerHandle { task, shutdown_tx })
    }
}

/// Running dialer
pub struct DialerHandle {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl DialerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the driver task, waiting at most `timeout`
    pub async fn stop(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!("MQTT event loop did not stop in time, aborting");
            task.abort();
        }
    }
}

/// One work item's view of the socket
pub struct MqttContext {
    id: usize,
    shared: Arc<SocketShared>,
}

#[async_trait]
impl RelayContext for MqttContext {
    type Error = MqttError;

    fn id(&self) -> usize {
        self.id
    }

    async fn recv(&mut self) -> Result<Message, MqttError> {
        let mut inbox = self.shared.inbox_rx.lock().await;
        inbox.recv().await.ok_or(MqttError::Closed)
    }

    async fn send(&mut self, msg: &Message) -> Result<(), MqttError> {
        if self.shared.buffer_offline(msg)? {
            return Ok(());
        }
        let client = self.shared.client.get().ok_or(MqttError::NotStarted)?;
        client.publish(msg).await
    }

    fn is_terminal(&self, error: &MqttError) -> bool {
        matches!(error, MqttError::Closed)
    }
}

/// The process-wide socket plus its running dialer
pub struct Connection {
    socket: Socket,
    dialer: DialerHandle,
    address: BrokerAddress,
}

impl Connection {
    /// Open the socket, attach persistence and TLS, start dialing
    ///
    /// Returns as soon as the dialer is running; the broker may still be
    /// unreachable.
    pub fn open(config: &ClientConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let socket = Socket::open(config.version);
        socket.set_connect_cb(|reason_code| {
            info!(reason_code, "Connected, CONNACK reason code {}", reason_code);
        });
        socket.set_disconnect_cb(|reason_code| {
            warn!(reason_code, "Disconnected, reason code {}", reason_code);
        });

        if config.enable_persistence {
            let store = OfflineStore::open(PersistenceConfig::from_tuning(
                &config.tuning.persistence,
                config.version,
            ))?;
            socket.attach_offline_store(store);
        }

        let reconnect = ReconnectConfig::from(&config.tuning.reconnect);
        HealthMonitor::validate_connection_config(&reconnect)
            .map_err(|e| RelayError::Config(ConfigError::InvalidConfig(e)))?;
        match reconnect.calculate_max_total_time() {
            Some(total_ms) => debug!(total_ms, "Dialer gives up after bounded retries"),
            None => debug!("Dialer retries without limit"),
        }

        let mut dialer = Dialer::create(&socket, &config.url)?;
        dialer.set_connect_message(ConnectMessage::from_config(config));
        dialer.set_reconnect(reconnect);
        dialer.set_request_capacity(config.tuning.mqtt.request_capacity);

        if config.enable_tls || dialer.address().tls {
            init_dialer_tls(&mut dialer, &TlsSettings::from_config(config))?;
        }

        let address = dialer.address().clone();
        let tls = dialer.is_tls();
        let handle = dialer.start()?;
        info!(
            url = %config.url,
            version = %config.version,
            tls,
            "Dialer started"
        );

        Ok(Self {
            socket,
            dialer: handle,
            address,
        })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn open_context(&self) -> MqttContext {
        self.socket.open_context()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.socket.state()
    }

    /// Send DISCONNECT, stop the driver and flush the offline store
    pub async fn shutdown(self) {
        if HealthMonitor::can_publish(&self.socket.current_state()) {
            if let Err(e) = self.socket.disconnect().await {
                debug!("DISCONNECT not sent: {}", e);
            }
        }
        self.dialer.stop(Duration::from_secs(2)).await;

        match self.socket.flush_offline_store() {
            Some(Ok(dropped)) => debug!(dropped, "Offline store flushed"),
            Some(Err(e)) => error!("Failed to flush offline store: {}", e),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;

    fn connected(shared: &Arc<SocketShared>) {
        shared.handle_link_event(LinkEvent::Connected {
            reason_code: 0,
            session_present: false,
        });
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_started() {
        let socket = Socket::open(ProtocolVersion::V311);
        let mut ctx = socket.open_context();

        let result = ctx.send(&Message::publish("a", &b"x"[..], 0)).await;
        assert!(matches!(result, Err(MqttError::NotStarted)));
        assert!(!socket.is_started());
    }

    #[tokio::test]
    async fn test_contexts_get_distinct_ids() {
        let socket = Socket::open(ProtocolVersion::V5);
        let ids: Vec<usize> = (0..4).map(|_| socket.open_context().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_inbound_publish_reaches_one_context() {
        let socket = Socket::open(ProtocolVersion::V311);
        let mut first = socket.open_context();
        let mut second = socket.open_context();

        socket
            .shared
            .handle_link_event(LinkEvent::Publish(Message::publish("/t/1", &b"one"[..], 1)));
        socket
            .shared
            .handle_link_event(LinkEvent::Publish(Message::publish("/t/2", &b"two"[..], 2)));

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a.payload(), b"one");
        assert_eq!(b.payload(), b"two");
    }

    #[tokio::test]
    async fn test_connect_callback_receives_reason_code() {
        let socket = Socket::open(ProtocolVersion::V311);
        let seen = Arc::new(AtomicU8::new(0xFF));
        let seen_cb = Arc::clone(&seen);
        socket.set_connect_cb(move |rc| seen_cb.store(rc, Ordering::SeqCst));

        connected(&socket.shared);

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(socket.current_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_callback_only_after_connected() {
        let socket = Socket::open(ProtocolVersion::V311);
        let seen = Arc::new(AtomicU8::new(0xFF));
        let seen_cb = Arc::clone(&seen);
        socket.set_disconnect_cb(move |rc| seen_cb.store(rc, Ordering::SeqCst));

        // Failed dial before any CONNACK
        socket.shared.pipe_closed(
            ConnectionEvent::NetworkError("refused".to_string()),
            TRANSPORT_LOST_REASON,
        );
        assert_eq!(seen.load(Ordering::SeqCst), 0xFF);

        connected(&socket.shared);
        socket
            .shared
            .handle_link_event(LinkEvent::Disconnected { reason_code: 0x8E });
        assert_eq!(seen.load(Ordering::SeqCst), 0x8E);
        assert!(matches!(
            socket.current_state(),
            ConnectionState::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_subacks_resolve_in_request_order() {
        let socket = Socket::open(ProtocolVersion::V311);
        let results = Arc::new(StdMutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let results = Arc::clone(&results);
            lock(&socket.shared.pending_subacks).push_back(Box::new(move |ack: Option<SubAckPacket>| {
                lock(&results).push((tag, ack.map(|a| a.reason_codes)));
            }));
        }

        socket.shared.handle_link_event(LinkEvent::SubAck {
            packet_id: 1,
            reason_codes: vec![1, 2],
        });
        socket.shared.handle_link_event(LinkEvent::SubAck {
            packet_id: 2,
            reason_codes: vec![0x80],
        });

        let results = lock(&results).clone();
        assert_eq!(
            results,
            vec![("first", Some(vec![1, 2])), ("second", Some(vec![0x80]))]
        );
    }

    #[tokio::test]
    async fn test_pending_subacks_absent_when_connection_drops() {
        let socket = Socket::open(ProtocolVersion::V311);
        let outcome = Arc::new(StdMutex::new(None));
        let outcome_cb = Arc::clone(&outcome);
        lock(&socket.shared.pending_subacks).push_back(Box::new(move |ack: Option<SubAckPacket>| {
            *lock(&outcome_cb) = Some(ack.is_none());
        }));

        // Not connected yet: request stays queued
        socket.shared.pipe_closed(
            ConnectionEvent::NetworkError("refused".to_string()),
            TRANSPORT_LOST_REASON,
        );
        assert_eq!(*lock(&outcome), None);

        connected(&socket.shared);
        socket.shared.pipe_closed(
            ConnectionEvent::NetworkError("reset".to_string()),
            TRANSPORT_LOST_REASON,
        );
        assert_eq!(*lock(&outcome), Some(true));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<StdMutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_late_suback_logged_at_info() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let socket = Socket::open(ProtocolVersion::V311);
        tracing::subscriber::with_default(subscriber, || {
            socket.shared.handle_link_event(LinkEvent::SubAck {
                packet_id: 7,
                reason_codes: vec![1, 0x80],
            });
        });

        let output = String::from_utf8(lock(&logs.0).clone()).unwrap();
        assert!(output.contains("INFO"), "{output}");
        assert!(output.contains("SUBACK arrived after its request was abandoned"));
        assert!(output.contains("128"), "reason codes must be logged: {output}");
        assert!(lock(&socket.shared.pending_subacks).is_empty());
    }

    #[tokio::test]
    async fn test_send_is_buffered_offline_while_disconnected() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = Socket::open(ProtocolVersion::V311);
        let store = OfflineStore::open(PersistenceConfig {
            dir: dir.path().to_path_buf(),
            db_name: "offline.db".to_string(),
            max_rows: 10,
            flush_threshold: 50,
            version: ProtocolVersion::V311,
        })
        .unwrap();
        socket.attach_offline_store(store);

        let mut ctx = socket.open_context();
        ctx.send(&Message::publish("/nanomq/msg/transfer", &b"kept"[..], 0))
            .await
            .unwrap();

        let rows = lock(&socket.shared.offline)
            .as_mut()
            .unwrap()
            .pending_rows()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.payload, b"kept".to_vec());
    }

    #[test]
    fn test_dialer_rejects_bad_url() {
        let socket = Socket::open(ProtocolVersion::V311);
        assert!(matches!(
            Dialer::create(&socket, "http://example.com"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_dialer_start_requires_runtime() {
        let socket = Socket::open(ProtocolVersion::V311);
        let dialer = Dialer::create(&socket, "mqtt-tcp://127.0.0.1:1883").unwrap();
        assert!(matches!(dialer.start(), Err(MqttError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_dialer_start_is_non_blocking_and_retries() {
        let socket = Socket::open(ProtocolVersion::V311);
        let mut state = socket.state();

        // Nothing listens on port 1
        let dialer = Dialer::create(&socket, "mqtt-tcp://127.0.0.1:1").unwrap();
        let handle = dialer.start().unwrap();
        assert!(socket.is_started());

        let reconnecting = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if matches!(*state.borrow(), ConnectionState::Reconnecting(_)) {
                    return true;
                }
                if state.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        assert_eq!(reconnecting, Ok(true));

        let second = Dialer::create(&socket, "mqtt-tcp://127.0.0.1:1").unwrap();
        assert!(matches!(second.start(), Err(MqttError::AlreadyStarted)));

        handle.stop(Duration::from_secs(1)).await;
    }
}
