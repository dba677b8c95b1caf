//! Scripted in-memory transport for tests.

use crate::domain::connection_state::LinkEvent;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{
    Channel, FrameStream, LinkEventStream, Transport,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Discover,
    Disconnect,
    Read(Channel),
    Write(Channel, Vec<u8>),
    Subscribe(Channel),
    Unsubscribe(Channel),
}

struct FakeState {
    calls: Vec<Call>,
    subscribers: HashMap<Channel, mpsc::UnboundedSender<Vec<u8>>>,
    replies: VecDeque<Vec<(Channel, Vec<u8>)>>,
    unrouted: Vec<(Channel, Vec<u8>)>,
    on_subscribe: HashMap<Channel, Vec<Vec<u8>>>,
    channels: Vec<Channel>,
    info: Vec<u8>,
    connect_failures: u32,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

pub struct FakeTransport {
    state: Mutex<FakeState>,
    /// Fail writes whose scripted reply has no listener.
    strict: bool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    pub fn strict() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(strict: bool) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded();
        Self {
            state: Mutex::new(FakeState {
                calls: Vec::new(),
                subscribers: HashMap::new(),
                replies: VecDeque::new(),
                unrouted: Vec::new(),
                on_subscribe: HashMap::new(),
                channels: Channel::ALL.to_vec(),
                info: vec![0x01, 0x00, 0x00, 0x00],
                connect_failures: 0,
                link_tx,
                link_rx: Some(link_rx),
            }),
            strict,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Frames the device emits in response to the next control point write.
    /// An empty list leaves the write unanswered.
    pub fn reply_to_next_write(&self, frames: Vec<(Channel, Vec<u8>)>) {
        self.lock().replies.push_back(frames);
    }

    /// Deliver a frame now, as if the device sent it unprompted.
    pub fn notify(&self, channel: Channel, frame: Vec<u8>) -> bool {
        deliver(&mut self.lock(), channel, frame)
    }

    /// Deliver `frame` as soon as `channel` is next subscribed, before
    /// `subscribe` returns. Models a late frame from an earlier exchange.
    pub fn emit_on_next_subscribe(&self, channel: Channel, frame: Vec<u8>) {
        self.lock()
            .on_subscribe
            .entry(channel)
            .or_default()
            .push(frame);
    }

    pub fn emit_link(&self, event: LinkEvent) {
        let _ = self.lock().link_tx.unbounded_send(event);
    }

    pub fn set_channels(&self, channels: Vec<Channel>) {
        self.lock().channels = channels;
    }

    pub fn set_info(&self, info: Vec<u8>) {
        self.lock().info = info;
    }

    pub fn fail_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Write(_, bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.lock().calls.iter().filter(|call| *call == wanted).count()
    }

    pub fn subscribe_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Subscribe(_)))
            .count()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Unsubscribe(_)))
            .count()
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.lock().subscribers.contains_key(&channel)
    }

    /// Frames emitted while nobody listened on their channel.
    pub fn unrouted_frames(&self) -> Vec<(Channel, Vec<u8>)> {
        self.lock().unrouted.clone()
    }

    /// Wait for unsubscribes scheduled by dropped subscriptions to run.
    pub async fn settle(&self) {
        for _ in 0..500 {
            if self.subscribe_count() == self.unsubscribe_count() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "subscriptions leaked: {} subscribe vs {} unsubscribe",
            self.subscribe_count(),
            self.unsubscribe_count()
        );
    }
}

fn deliver(state: &mut FakeState, channel: Channel, frame: Vec<u8>) -> bool {
    if let Some(sender) = state.subscribers.get(&channel) {
        if sender.unbounded_send(frame.clone()).is_ok() {
            return true;
        }
    }
    state.unrouted.push((channel, frame));
    false
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::Connect);
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::Other("connection refused".to_string()));
        }
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<Channel>, TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::Discover);
        Ok(state.channels.clone())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::Disconnect);
        state.subscribers.clear();
        Ok(())
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::Read(channel));
        match channel {
            Channel::Info => Ok(state.info.clone()),
            other => Err(TransportError::Unsupported(other)),
        }
    }

    async fn write(&self, channel: Channel, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::Write(channel, payload.to_vec()));
        if channel != Channel::ControlPoint {
            return Err(TransportError::Unsupported(channel));
        }

        let frames = state.replies.pop_front().unwrap_or_default();
        for (target, frame) in frames {
            let routed = deliver(&mut state, target, frame);
            if !routed && self.strict {
                return Err(TransportError::Other(format!(
                    "frame on {:?} emitted before subscription",
                    target
                )));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<FrameStream, TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::Subscribe(channel));
        let (tx, rx) = mpsc::unbounded();
        for frame in state.on_subscribe.remove(&channel).unwrap_or_default() {
            let _ = tx.unbounded_send(frame);
        }
        state.subscribers.insert(channel, tx);
        Ok(rx.boxed())
    }

    async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::Unsubscribe(channel));
        state.subscribers.remove(&channel);
        Ok(())
    }

    async fn link_events(&self) -> Result<Option<LinkEventStream>, TransportError> {
        Ok(self.lock().link_rx.take().map(|rx| rx.boxed()))
    }
}
