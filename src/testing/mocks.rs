//! Mock broker and contexts for testing
//!
//! A [`MockBroker`] stands in for the socket: tests inject inbound PUBLISH
//! messages or receive failures, open any number of [`MockContext`]s, and
//! inspect what was published. Inbound messages are handed to exactly one
//! context, like the real socket.

use crate::message::Message;
use crate::transport::RelayContext;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

pub type PublishedMessage = (String, Vec<u8>);

/// Failures produced by the mock
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MockError {
    #[error("Mock receive failure")]
    Receive,
    #[error("Mock send failure")]
    Send,
    #[error("Mock inbox closed")]
    Closed,
}

#[derive(Debug)]
enum Inbound {
    Message(Message),
    Error,
}

#[derive(Debug, Default)]
struct BrokerState {
    published: Mutex<Vec<Message>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    overlapping_receives: AtomicUsize,
    send_attempts: AtomicUsize,
    failing_sends: AtomicU32,
    fail_all_sends: AtomicBool,
}

/// Scripted stand-in for the MQTT socket
#[derive(Debug)]
pub struct MockBroker {
    state: Arc<BrokerState>,
    inbox_tx: StdMutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbox_rx: Arc<Mutex<mpsc::UnboundedReceiver<Inbound>>>,
    next_id: AtomicUsize,
    send_delay: Duration,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(BrokerState::default()),
            inbox_tx: StdMutex::new(Some(tx)),
            inbox_rx: Arc::new(Mutex::new(rx)),
            next_id: AtomicUsize::new(0),
            send_delay: Duration::ZERO,
        }
    }

    /// Every send sleeps for `delay` before completing
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    fn push(&self, inbound: Inbound) {
        if let Ok(guard) = self.inbox_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(inbound);
            }
        }
    }

    /// Queue an inbound PUBLISH
    pub fn inject(&self, msg: Message) {
        self.push(Inbound::Message(msg));
    }

    /// Queue a PUBLISH built from `topic` and `payload`
    pub fn inject_publish(&self, topic: &str, payload: &[u8]) {
        self.inject(Message::publish(topic, payload.to_vec(), 1));
    }

    /// Queue a failed receive
    pub fn inject_error(&self) {
        self.push(Inbound::Error);
    }

    /// No more inbound traffic; contexts see [`MockError::Closed`] once drained
    pub fn close(&self) {
        if let Ok(mut guard) = self.inbox_tx.lock() {
            guard.take();
        }
    }

    /// The next `count` sends fail
    pub fn fail_next_sends(&self, count: u32) {
        self.state.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_sends(&self) {
        self.state.fail_all_sends.store(true, Ordering::SeqCst);
    }

    pub fn open_context(&self) -> MockContext {
        MockContext {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
            inbox_rx: Arc::clone(&self.inbox_rx),
            send_delay: self.send_delay,
            holding: false,
        }
    }

    pub async fn get_published(&self) -> Vec<Message> {
        self.state.published.lock().await.clone()
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.state
            .published
            .lock()
            .await
            .iter()
            .map(|m| (m.topic().to_string(), m.payload().to_vec()))
            .collect()
    }

    /// Highest number of received-but-not-yet-published messages seen
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Receives issued by a context that still held an unsent message
    pub fn overlapping_receives(&self) -> usize {
        self.state.overlapping_receives.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.state.send_attempts.load(Ordering::SeqCst)
    }
}

/// One work item's view of a [`MockBroker`]
#[derive(Debug)]
pub struct MockContext {
    id: usize,
    state: Arc<BrokerState>,
    inbox_rx: Arc<Mutex<mpsc::UnboundedReceiver<Inbound>>>,
    send_delay: Duration,
    holding: bool,
}

#[async_trait]
impl RelayContext for MockContext {
    type Error = MockError;

    fn id(&self) -> usize {
        self.id
    }

    async fn recv(&mut self) -> Result<Message, MockError> {
        if self.holding {
            self.state.overlapping_receives.fetch_add(1, Ordering::SeqCst);
        }

        let inbound = self.inbox_rx.lock().await.recv().await;
        match inbound {
            Some(Inbound::Message(msg)) => {
                self.holding = true;
                let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
                Ok(msg)
            }
            Some(Inbound::Error) => Err(MockError::Receive),
            None => Err(MockError::Closed),
        }
    }

    async fn send(&mut self, msg: &Message) -> Result<(), MockError> {
        self.state.send_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }

        if self.state.fail_all_sends.load(Ordering::SeqCst) {
            return Err(MockError::Send);
        }
        let failing = self
            .state
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(MockError::Send);
        }

        self.state.published.lock().await.push(msg.clone());
        if self.holding {
            self.holding = false;
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_terminal(&self, error: &MockError) -> bool {
        matches!(error, MockError::Closed)
    }
}
