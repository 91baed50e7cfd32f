//! In-memory transport for engine and session tests.
//!
//! Every successful `open` hands the test a [`MockPeer`] standing in for the
//! server end of that connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{Link, Transport, TransportError, TransportEvent};

pub(crate) struct MockTransport {
    fail_opens: AtomicUsize,
    opens: AtomicUsize,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            fail_opens: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            peers_tx,
            peers_rx: Mutex::new(peers_rx),
        })
    }

    /// Make the next `count` opens fail with a connect error.
    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Number of `open` calls so far, failed ones included.
    pub(crate) fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Server end of the next successful connection.
    pub(crate) async fn next_peer(&self) -> MockPeer {
        let mut rx = self.peers_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("no connection opened in time")
            .expect("peer channel closed")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        _endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn Link>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self.fail_opens.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if failing {
            return Err(TransportError::Connect("refused".to_owned()));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let _ = events.send(TransportEvent::Opened);
        let _ = self.peers_tx.send(MockPeer { sent: sent_rx, events, closed: closed.clone() });
        Ok(Box::new(MockLink { sent: sent_tx, closed }))
    }
}

struct MockLink {
    sent: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl Link for MockLink {
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.send(bytes).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct MockPeer {
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl MockPeer {
    /// Deliver a JSON frame to the client.
    pub(crate) fn push(&self, value: serde_json::Value) {
        let _ = self.events.send(TransportEvent::Frame(value.to_string().into_bytes()));
    }

    /// Deliver raw bytes to the client.
    pub(crate) fn push_raw(&self, bytes: &[u8]) {
        let _ = self.events.send(TransportEvent::Frame(bytes.to_vec()));
    }

    /// Simulate the peer closing the connection.
    pub(crate) fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed("peer closed".to_owned()));
    }

    /// Simulate a transport failure.
    pub(crate) fn fail(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Error(reason.to_owned()));
    }

    /// Whether the client closed its end.
    pub(crate) fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next frame the client wrote, parsed as JSON.
    pub(crate) async fn recv(&mut self) -> serde_json::Value {
        let bytes = tokio::time::timeout(Duration::from_secs(30), self.sent.recv())
            .await
            .expect("client sent nothing in time")
            .expect("client link dropped");
        serde_json::from_slice(&bytes).expect("client frame is json")
    }

    /// Assert the client writes nothing within `wait`.
    pub(crate) async fn assert_silent(&mut self, wait: Duration) {
        assert!(tokio::time::timeout(wait, self.sent.recv()).await.is_err(), "expected no client frame");
    }
}
