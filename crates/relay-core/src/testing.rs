//! Scripted peer connections for tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_broker::{BrokerError, Delivery, Producer};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::peer::{
    ConnectionState, DataChannel, LocalCandidate, PeerConnection, PeerConnector, PeerError,
    PeerObserver, RemoteCandidate, SdpKind, SessionDescription,
};

/// Peer operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    RemoteDescription,
    Answer,
    Offer,
    LocalDescription,
    Candidate,
}

pub struct MockPeer {
    observer: Mutex<Option<Arc<dyn PeerObserver>>>,
    remote: Mutex<Vec<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<String>>,
    failing: Mutex<HashSet<Op>>,
    /// Candidates emitted when the local description is set.
    gathers: Mutex<Vec<String>>,
    /// Whether gathering completes when the local description is set.
    completes: AtomicBool,
    closes: AtomicUsize,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            observer: Mutex::new(None),
            remote: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            gathers: Mutex::new(Vec::new()),
            completes: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        })
    }

    fn check(&self, op: Op) -> Result<(), PeerError> {
        if !self.failing.lock().contains(&op) {
            return Ok(());
        }
        let reason = "scripted failure".to_string();
        Err(match op {
            Op::RemoteDescription => PeerError::RemoteDescription(reason),
            Op::Answer => PeerError::Generate(SdpKind::Answer, reason),
            Op::Offer => PeerError::Generate(SdpKind::Offer, reason),
            Op::LocalDescription => PeerError::LocalDescription(reason),
            Op::Candidate => PeerError::Candidate(reason),
        })
    }

    fn observer(&self) -> Option<Arc<dyn PeerObserver>> {
        self.observer.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn emit_candidate(&self, candidate: &str) {
        if let Some(observer) = self.observer() {
            observer.on_ice_candidate(Some(LocalCandidate {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
        }
    }

    pub fn emit_gathering_complete(&self) {
        if let Some(observer) = self.observer() {
            observer.on_ice_candidate(None);
        }
    }

    pub fn emit_state(&self, state: ConnectionState) {
        if let Some(observer) = self.observer() {
            observer.on_connection_state_change(state);
        }
    }

    pub fn emit_data_channel(&self, channel: Arc<MockChannel>) {
        if let Some(observer) = self.observer() {
            let label = channel.label();
            observer.on_data_channel(channel);
            observer.on_data_channel_open(&label);
        }
    }

    pub fn emit_channel_close(&self, label: &str) {
        if let Some(observer) = self.observer() {
            observer.on_data_channel_close(label);
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn set_observer(&self, observer: Arc<dyn PeerObserver>) {
        *self.observer.lock() = Some(observer);
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.check(Op::RemoteDescription)?;
        self.remote.lock().push(description);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.check(Op::Answer)?;
        let remote = self.remote.lock().last().map(|d| d.sdp.clone()).unwrap_or_default();
        Ok(SessionDescription::answer(format!("answer-to:{remote}")))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        self.check(Op::Offer)?;
        Ok(SessionDescription::offer(format!("offer ice_restart={ice_restart}")))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.check(Op::LocalDescription)?;
        *self.local.lock() = Some(description);

        let gathered = self.gathers.lock().clone();
        for candidate in gathered {
            self.emit_candidate(&candidate);
        }
        if self.completes.load(Ordering::SeqCst) {
            self.emit_gathering_complete();
        }
        Ok(())
    }

    /// The local description with every gathered candidate written in as an
    /// `a=` line, the way the WebRTC stack reports it.
    async fn local_description(&self) -> Option<SessionDescription> {
        let gathered = self.gathers.lock().clone();
        self.local.lock().clone().map(|mut description| {
            for candidate in gathered {
                description.sdp.push_str(&format!("\r\na={candidate}"));
            }
            description
        })
    }

    async fn add_ice_candidate(&self, candidate: RemoteCandidate) -> Result<(), PeerError> {
        self.check(Op::Candidate)?;
        self.candidates.lock().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`MockPeer`]s and keeps them for inspection.
pub struct MockConnector {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    gathers: Mutex<Vec<String>>,
    completes: AtomicBool,
    failing: Mutex<HashSet<Op>>,
    fail_create: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            gathers: Mutex::new(Vec::new()),
            completes: AtomicBool::new(true),
            failing: Mutex::new(HashSet::new()),
            fail_create: AtomicBool::new(false),
        })
    }

    /// New peers emit these candidates when their local description is set.
    pub fn gather(&self, candidates: &[&str]) {
        *self.gathers.lock() = candidates.iter().map(|c| c.to_string()).collect();
    }

    /// New peers never finish gathering.
    pub fn stall_gathering(&self) {
        self.completes.store(false, Ordering::SeqCst);
    }

    /// New peers fail `op`.
    pub fn fail(&self, op: Op) {
        self.failing.lock().insert(op);
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Arc<MockPeer> {
        self.peers.lock().last().cloned().expect("no peer created")
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PeerError::Create("scripted failure".into()));
        }

        let peer = MockPeer::new();
        *peer.gathers.lock() = self.gathers.lock().clone();
        peer.completes
            .store(self.completes.load(Ordering::SeqCst), Ordering::SeqCst);
        *peer.failing.lock() = self.failing.lock().clone();

        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

pub struct MockChannel {
    label: String,
    open: AtomicBool,
    fail_send: AtomicBool,
    sent: Mutex<Vec<Bytes>>,
}

impl MockChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn open(label: &str) -> Arc<Self> {
        let channel = Self::new(label);
        channel.set_open(true);
        channel
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(PeerError::DataChannel("scripted failure".into()));
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.set_open(false);
        Ok(())
    }
}

/// A producer that always fails.
pub struct DownProducer;

#[async_trait]
impl Producer for DownProducer {
    async fn send(
        &self,
        topic: &str,
        _key: Option<&str>,
        _value: &[u8],
    ) -> Result<Delivery, BrokerError> {
        Err(BrokerError::Exhausted {
            topic: topic.to_string(),
            attempts: 5,
            source: Box::new(BrokerError::SendFailed("broker down".into())),
        })
    }
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
