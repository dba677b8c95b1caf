//! Streaming Channel
//!
//! Commands that produce more than one result (scans, provisioning) answer
//! on two channels: a single ack on the control point and then a series of
//! notifications on data-out. The data-out subscription is opened before the
//! command is written and stays open for the lifetime of the [`ResultStream`].
//!
//! ```text
//! open()  ── subscribe data-out ── handshake (control point) ── ResultStream
//!                                        │
//!                                  rejected: unsubscribe data-out, Err
//!
//! ResultStream ── frame ── frame ── ... ── end ── unsubscribe ── final item
//! ```
//!
//! The stream ends on a terminal state (when asked to), on the per-frame
//! timeout, on a frame that fails to decode, on a reported disconnect, or
//! when the transport closes the channel. In each of those cases the unsubscribe completes before the
//! last item is handed out. Dropping the stream schedules it instead.

use crate::domain::models::{DisconnectReason, WifiConnectionState};
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::protocol::{self, Command, ResultFrame};
use crate::infrastructure::bluetooth::request::RequestEngine;
use crate::infrastructure::bluetooth::subscription::Subscription;
use crate::infrastructure::bluetooth::transport::Channel;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, info, warn};

pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(60);

/// When a result stream ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Only on stop, cancellation or error. Used for scans.
    Open,
    /// Right after a `Connected` or `ConnectionFailed` state frame.
    UntilTerminalState,
}

#[derive(Clone)]
pub struct StreamingChannel {
    engine: RequestEngine,
    notification_timeout: Duration,
}

impl StreamingChannel {
    pub fn new(engine: RequestEngine, notification_timeout: Duration) -> Self {
        Self {
            engine,
            notification_timeout,
        }
    }

    pub fn engine(&self) -> &RequestEngine {
        &self.engine
    }

    /// Run the handshake for `command` and return its results.
    ///
    /// A rejected handshake never produces a stream.
    pub async fn open(
        &self,
        command: Command,
        termination: Termination,
    ) -> Result<ResultStream, ProtocolError> {
        self.engine.ensure_ready()?;
        let lease = self.engine.acquire_slot().await?;

        let mut results = Subscription::open(
            self.engine.transport().clone(),
            Channel::DataOut,
            lease.clone(),
        )
        .await?;

        results.discard_pending();
        if let Err(e) = self.engine.exchange(&command, &lease).await {
            results.close().await;
            return Err(e);
        }

        info!("{} accepted, streaming results", command.opcode().name());
        Ok(ResultStream::new(
            results,
            self.engine.link_lost(),
            termination,
            self.notification_timeout,
        ))
    }

    /// Like [`open`](Self::open), but nothing happens until the first poll and
    /// a rejected handshake arrives as the only item.
    pub fn start(
        &self,
        command: Command,
        termination: Termination,
    ) -> BoxStream<'static, Result<ResultFrame, ProtocolError>> {
        let channel = self.clone();
        stream::once(async move { channel.open(command, termination).await })
            .map(|opened| match opened {
                Ok(results) => results.boxed(),
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            })
            .flatten()
            .boxed()
    }
}

enum StreamState {
    Streaming {
        subscription: Subscription,
        deadline: Pin<Box<Sleep>>,
        link_lost: BoxFuture<'static, DisconnectReason>,
    },
    Closing {
        unsubscribe: BoxFuture<'static, ()>,
        last: Option<Result<ResultFrame, ProtocolError>>,
    },
    Done,
}

/// Decoded data-out notifications of one streaming command.
pub struct ResultStream {
    state: StreamState,
    termination: Termination,
    notification_timeout: Duration,
    last_state: Option<WifiConnectionState>,
}

impl ResultStream {
    fn new(
        subscription: Subscription,
        link_lost: BoxFuture<'static, DisconnectReason>,
        termination: Termination,
        timeout: Duration,
    ) -> Self {
        Self {
            state: StreamState::Streaming {
                subscription,
                deadline: Box::pin(sleep(timeout)),
                link_lost,
            },
            termination,
            notification_timeout: timeout,
            last_state: None,
        }
    }

    /// End the stream now and wait for the unsubscribe.
    pub async fn close(mut self) {
        match std::mem::replace(&mut self.state, StreamState::Done) {
            StreamState::Streaming { subscription, .. } => subscription.close().await,
            StreamState::Closing { unsubscribe, .. } => unsubscribe.await,
            StreamState::Done => {}
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, StreamState::Done)
    }
}

fn begin_close(state: &mut StreamState, last: Result<ResultFrame, ProtocolError>) {
    if let StreamState::Streaming { subscription, .. } =
        std::mem::replace(state, StreamState::Done)
    {
        *state = StreamState::Closing {
            unsubscribe: subscription.close().boxed(),
            last: Some(last),
        };
    }
}

fn note_state(last_state: &mut Option<WifiConnectionState>, frame: &ResultFrame) {
    let ResultFrame::ConnectionState(current) = frame else {
        return;
    };
    if let (Some(previous), Some(now)) = (
        last_state.and_then(WifiConnectionState::ordinal),
        current.ordinal(),
    ) {
        if now < previous {
            warn!(
                "Connection state went backwards: {} -> {}",
                last_state.map(|s| s.to_string()).unwrap_or_default(),
                current
            );
        }
    }
    *last_state = Some(*current);
}

impl Stream for ResultStream {
    type Item = Result<ResultFrame, ProtocolError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let ending = match &mut this.state {
                StreamState::Streaming {
                    subscription,
                    deadline,
                    link_lost,
                } => match subscription.poll_frame(cx) {
                    Poll::Ready(Some(raw)) => {
                        debug!("Data-out frame: {:02X?}", raw);
                        match protocol::decode_result(&raw) {
                            Ok(frame) => {
                                note_state(&mut this.last_state, &frame);
                                if this.termination == Termination::UntilTerminalState
                                    && frame.is_terminal_state()
                                {
                                    Ok(frame)
                                } else {
                                    deadline
                                        .as_mut()
                                        .reset(Instant::now() + this.notification_timeout);
                                    return Poll::Ready(Some(Ok(frame)));
                                }
                            }
                            Err(e) => {
                                warn!("Dropping result stream on malformed frame: {}", e);
                                Err(e.into())
                            }
                        }
                    }
                    Poll::Ready(None) => {
                        warn!("Data-out channel closed by transport");
                        Err(ProtocolError::ChannelClosed)
                    }
                    Poll::Pending => {
                        if let Poll::Ready(reason) = link_lost.as_mut().poll(cx) {
                            warn!("Link dropped while streaming results");
                            Err(ProtocolError::Disconnected(reason))
                        } else if deadline.as_mut().poll(cx).is_pending() {
                            return Poll::Pending;
                        } else {
                            warn!("No notification within {:?}", this.notification_timeout);
                            Err(ProtocolError::NotificationTimeout(this.notification_timeout))
                        }
                    }
                },
                StreamState::Closing { unsubscribe, last } => {
                    ready!(unsubscribe.as_mut().poll(cx));
                    let last = last.take();
                    this.state = StreamState::Done;
                    return Poll::Ready(last);
                }
                StreamState::Done => return Poll::Ready(None),
            };
            begin_close(&mut this.state, ending);
        }
    }
}
