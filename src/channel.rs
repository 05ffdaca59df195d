//! Session manager for the command/event channel.
//!
//! [`Channel::run`] owns the whole connection lifecycle: it obtains a fresh
//! bearer token, opens the websocket, subscribes to the inbound topic, and
//! starts a dispatcher tagged with the new connection generation. On any
//! failure it cancels the dispatcher cooperatively, awaits its stop, and
//! schedules exactly one reconnect after a fixed delay. The loop is a
//! single task, so a reconnect can only be scheduled after the prior
//! attempt's outcome is fully resolved.

use std::{ops::ControlFlow, time::Duration};

use async_trait::async_trait;
use futures_util::{stream::SplitSink, SinkExt, Stream, StreamExt};
use http::header::AUTHORIZATION;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{self, client::IntoClientRequest, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::Config,
    dispatcher::{self, Dispatcher, Transport},
    events::{Event, EventBus},
    protocol::{self, Command},
    queue::CommandQueue,
    router::Router,
    token::AccessTokenProvider,
};

/// Fixed delay between a failed or lost session and the next connect
/// attempt. No backoff, no jitter, no retry limit.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5_000);

/// The server must show life at least this often; a silent connection is
/// treated as lost.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(25_000);

/// Outbound heartbeats are disabled; the server does not expect any.
pub const HEARTBEAT_OUTBOUND: Duration = Duration::ZERO;

/// Inbound messages larger than this are dropped unparsed to prevent out of
/// memory conditions.
const MESSAGE_SIZE_MAX: usize = 8192;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, WsMessage>;

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("invalid configuration: {0}")]
    Construction(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("token error: {0}")]
    Token(#[from] crate::token::TokenError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// The resilient command/event channel to the orchestration server.
pub struct Channel {
    provider: Box<dyn AccessTokenProvider>,
    server_url: Url,
    topic: String,

    queue: CommandQueue,
    bus: EventBus,
    router: Router,

    /// Tags one connection attempt's lifetime; stale dispatchers are
    /// invalidated by superseding it.
    generation: u64,
    shutdown: CancellationToken,
}

impl Channel {
    pub fn new<P>(
        config: &Config,
        provider: P,
        queue: CommandQueue,
        bus: EventBus,
    ) -> ChannelResult<Self>
    where
        P: AccessTokenProvider + 'static,
    {
        let scheme = config.server_url.scheme();
        if scheme != "ws" && scheme != "wss" {
            return Err(ChannelError::Construction(format!(
                "server url scheme should be ws or wss but is {scheme}"
            )));
        }
        if config.topic.is_empty() {
            return Err(ChannelError::Construction("topic is empty".to_string()));
        }

        Ok(Self {
            provider: Box::new(provider),
            server_url: config.server_url.clone(),
            topic: config.topic.clone(),

            queue,
            bus,
            router: Router::new(),

            generation: 0,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the channel when cancelled. No reconnect is
    /// scheduled after cancellation.
    #[must_use]
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs sessions until shut down, reconnecting after a fixed delay.
    ///
    /// The initial connection happens immediately.
    pub async fn run(&mut self) -> ChannelResult<()> {
        let shutdown = self.shutdown.clone();
        let reconnect = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(reconnect);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    info!("channel shut down");
                    break Ok(());
                }

                result = self.session(), if reconnect.is_elapsed() => {
                    if let Err(e) = result {
                        error!("{e}");
                    }
                    self.bus.publish(Event::Disconnected);

                    info!("reconnecting in {:.1}s", RECONNECT_DELAY.as_secs_f32());
                    reconnect
                        .as_mut()
                        .reset(tokio::time::Instant::now() + RECONNECT_DELAY);
                }

                () = &mut reconnect, if !reconnect.is_elapsed() => {}
            }
        }
    }

    /// One connection attempt's lifetime, from token acquisition to
    /// transport loss.
    ///
    /// Returns `Ok` only when shut down while connected.
    async fn session(&mut self) -> ChannelResult<()> {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let shutdown = self.shutdown.clone();

        info!("connecting to {} (generation {generation})", self.server_url);
        let token = self.provider.access_token().await?;

        let mut request = self.server_url.as_str().into_client_request()?;
        let bearer = format!("Bearer {token}")
            .parse()
            .map_err(|e| ChannelError::Connection(format!("invalid bearer header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(connection) => connection,
            Err(e) => {
                // The handshake may have been refused over stale
                // credentials; force a fresh token for the next attempt.
                self.provider.invalidate();
                return Err(e.into());
            }
        };
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!("connected to server");

        // Subscribe before the dispatcher takes the sink, so the server
        // starts feeding the inbound topic right away.
        let subscribe = format!("[\"sub\",\"{}\"]", self.topic);
        ws_tx.send(WsMessage::text(subscribe)).await?;
        debug!("subscribed to {}", self.topic);

        // The dispatcher holds the exclusive queue consumer for this
        // generation. Its cancellation token is a child of the shutdown
        // token, so shutting down stops it as well.
        let cancel = shutdown.child_token();
        let consumer = self.queue.consumer().await;
        let worker = tokio::spawn(
            Dispatcher::new(generation, cancel.clone()).run(consumer, WsTransport { tx: ws_tx }),
        );

        self.bus.publish(Event::Connected);

        self.drain_inbound(generation, &mut ws_rx, worker, cancel)
            .await
    }

    /// Runs the inbound half of a session: routes frames, watches for
    /// server liveness, and resolves when the transport fails or the
    /// channel shuts down.
    ///
    /// The dispatcher is cancelled cooperatively and awaited before this
    /// resolves: an in-flight transmit may finish, but no two dispatchers
    /// must ever drain the queue concurrently.
    async fn drain_inbound<S>(
        &self,
        generation: u64,
        ws_rx: &mut S,
        mut worker: JoinHandle<dispatcher::Result<()>>,
        cancel: CancellationToken,
    ) -> ChannelResult<()>
    where
        S: Stream<Item = tungstenite::Result<WsMessage>> + Unpin,
    {
        let shutdown = self.shutdown.clone();
        let heartbeat = tokio::time::sleep(HEARTBEAT_INTERVAL);
        tokio::pin!(heartbeat);

        let mut worker_finished = false;
        let result = loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break Ok(()),

                () = &mut heartbeat => {
                    break Err(ChannelError::Connection(format!(
                        "no server heartbeat within {}s",
                        HEARTBEAT_INTERVAL.as_secs()
                    )));
                }

                result = &mut worker => {
                    worker_finished = true;
                    break Err(match result {
                        Ok(Ok(())) => {
                            ChannelError::Connection("dispatcher stopped".to_string())
                        }
                        Ok(Err(e)) => {
                            ChannelError::Connection(format!("error transmitting command: {e}"))
                        }
                        Err(e) => ChannelError::Connection(format!("dispatcher panicked: {e}")),
                    });
                }

                message = ws_rx.next() => match message {
                    Some(Ok(message)) => {
                        // Any inbound frame counts as server liveness.
                        heartbeat
                            .as_mut()
                            .reset(tokio::time::Instant::now() + HEARTBEAT_INTERVAL);

                        if let ControlFlow::Break(e) = self.handle_message(&message) {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => {
                        break Err(ChannelError::Connection(
                            "connection closed by server".to_string(),
                        ));
                    }
                }
            }
        };

        cancel.cancel();
        if !worker_finished {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("dispatcher {generation} ended with error: {e}"),
                Err(e) => error!("dispatcher {generation} panicked: {e}"),
            }
        }

        result
    }

    /// Handles one inbound websocket message.
    ///
    /// Typing and decoding failures are recoverable and never break the
    /// connection; only a close frame does.
    fn handle_message(&self, message: &WsMessage) -> ControlFlow<ChannelError, ()> {
        match message {
            WsMessage::Text(text) => {
                let message_size = text.len();
                if message_size > MESSAGE_SIZE_MAX {
                    error!("ignoring oversized message with {message_size} bytes");
                    return ControlFlow::Continue(());
                }

                match serde_json::from_str::<protocol::Frame>(text.as_str()) {
                    Ok(frame) => {
                        let event = self.router.route(frame);
                        self.bus.publish(Event::Remote(event));
                    }
                    Err(e) => {
                        // Publish the degraded event anyway, so the bus
                        // observes receipt.
                        error!("error parsing frame: {e}");
                        self.bus.publish(Event::Remote(protocol::InboundEvent::Unknown {
                            kind: None,
                            body: serde_json::Value::String(text.to_string()),
                        }));
                    }
                }

                ControlFlow::Continue(())
            }
            // Pongs are queued by the websocket library itself; the ping
            // already reset the heartbeat deadline above.
            WsMessage::Ping(_) | WsMessage::Pong(_) => ControlFlow::Continue(()),
            WsMessage::Close(payload) => ControlFlow::Break(ChannelError::Connection(format!(
                "connection closed by server: {payload:?}"
            ))),
            _ => {
                trace!("message type unimplemented");
                ControlFlow::Continue(())
            }
        }
    }
}

/// Outbound half of one websocket connection.
struct WsTransport {
    tx: WsSink,
}

#[async_trait]
impl Transport for WsTransport {
    async fn transmit(&mut self, command: &Command) -> dispatcher::Result<()> {
        let text = serde_json::to_string(command)
            .map_err(|e| dispatcher::Error(format!("error encoding command: {e}")))?;
        trace!("sending command: {text}");

        self.tx
            .send(WsMessage::text(text))
            .await
            .map_err(|e| dispatcher::Error(e.to_string()))
    }
}

/// Translates local playback events into outbound commands.
///
/// `QueueLowOrEmpty` becomes a song request; song lifecycle events become
/// status updates. Runs until shut down.
pub async fn forward_events(bus: EventBus, queue: CommandQueue, shutdown: CancellationToken) {
    use crate::protocol::PlaybackState;
    use tokio::sync::broadcast::error::RecvError;

    let mut events = bus.subscribe();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,

            event = events.recv() => match event {
                Ok(Event::QueueLowOrEmpty) => queue.enqueue(Command::RequestSong).await,
                Ok(Event::SongStarted(song)) => {
                    queue
                        .enqueue(Command::StatusUpdate {
                            state: PlaybackState::Playing,
                            song: Some(song.title),
                        })
                        .await;
                }
                Ok(Event::SongStopped | Event::SongFinished) => {
                    queue
                        .enqueue(Command::StatusUpdate {
                            state: PlaybackState::Stopped,
                            song: None,
                        })
                        .await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(count)) => {
                    // A dropped event may have been the only scarcity
                    // signal; request a song rather than starve playback.
                    warn!("event bus lagged by {count} events, requesting a song to resync");
                    queue.enqueue(Command::RequestSong).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        config::Credentials,
        protocol::{PlaybackState, Song},
        token::{AccessToken, TokenError},
    };

    fn test_config(server_url: &str) -> Config {
        let credentials = Credentials {
            client_id: "playbot".to_string(),
            client_secret: "secret".to_string(),
            token_endpoint: "https://auth.example.org/token".parse().unwrap(),
        };
        Config::new(server_url.parse().unwrap(), credentials)
    }

    /// Fails every token acquisition, counting attempts. Keeps connect
    /// attempts from ever reaching the network.
    struct FailingProvider {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AccessTokenProvider for FailingProvider {
        async fn access_token(&mut self) -> Result<AccessToken, TokenError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TokenError::Invalid("always failing".to_string()))
        }

        fn invalidate(&mut self) {}
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let config = test_config("https://example.org/client");
        let provider = FailingProvider {
            attempts: Arc::new(AtomicUsize::new(0)),
        };

        let result = Channel::new(&config, provider, CommandQueue::new(), EventBus::new());
        assert!(matches!(result, Err(ChannelError::Construction(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_exactly_once_per_fixed_delay() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let provider = FailingProvider {
            attempts: Arc::clone(&attempts),
        };

        let config = test_config("wss://example.org/client");
        let mut channel =
            Channel::new(&config, provider, CommandQueue::new(), EventBus::new()).unwrap();
        let shutdown = channel.shutdown_handle();
        let worker = tokio::spawn(async move { channel.run().await });

        // First attempt happens immediately; the next no earlier than
        // 5000 ms later.
        tokio::time::sleep(Duration::from_millis(4_999)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        // And exactly one more per delay interval.
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_reconnect_after_shutdown() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let provider = FailingProvider {
            attempts: Arc::clone(&attempts),
        };

        let config = test_config("wss://example.org/client");
        let mut channel =
            Channel::new(&config, provider, CommandQueue::new(), EventBus::new()).unwrap();
        let shutdown = channel.shutdown_handle();
        let worker = tokio::spawn(async move { channel.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        worker.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    /// Worker standing in for a dispatcher: parks until cancelled, then
    /// stops cleanly.
    fn idle_worker(cancel: &CancellationToken) -> JoinHandle<dispatcher::Result<()>> {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            Ok(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_fails_after_the_heartbeat_interval() {
        let config = test_config("wss://example.org/client");
        let provider = FailingProvider {
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        let channel = Channel::new(&config, provider, CommandQueue::new(), EventBus::new()).unwrap();

        let cancel = CancellationToken::new();
        let worker = idle_worker(&cancel);
        let mut silent = futures_util::stream::pending();

        let started = tokio::time::Instant::now();
        let result = channel.drain_inbound(1, &mut silent, worker, cancel).await;

        assert_eq!(started.elapsed(), HEARTBEAT_INTERVAL);
        assert!(matches!(result, Err(ChannelError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_resets_the_heartbeat_deadline() {
        let config = test_config("wss://example.org/client");
        let provider = FailingProvider {
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        let channel = Channel::new(&config, provider, CommandQueue::new(), EventBus::new()).unwrap();

        let cancel = CancellationToken::new();
        let worker = idle_worker(&cancel);

        // One ping at 20 s, then silence forever.
        let mut messages = Box::pin(futures_util::stream::unfold(false, |sent| async move {
            if sent {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_secs(20)).await;
            Some((
                Ok::<_, tungstenite::Error>(WsMessage::Ping(tungstenite::Bytes::new())),
                true,
            ))
        }));

        let started = tokio::time::Instant::now();
        let result = channel.drain_inbound(1, &mut messages, worker, cancel).await;

        // The ping pushed the deadline out to 20 s + 25 s.
        assert_eq!(started.elapsed(), Duration::from_secs(45));
        assert!(matches!(result, Err(ChannelError::Connection(_))));
    }

    #[test]
    fn oversized_frames_are_dropped_without_reaching_the_bus() {
        use tokio::sync::broadcast::error::TryRecvError;

        let config = test_config("wss://example.org/client");
        let provider = FailingProvider {
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        let channel = Channel::new(&config, provider, CommandQueue::new(), EventBus::new()).unwrap();
        let mut events = channel.bus.subscribe();

        let oversized = WsMessage::text("x".repeat(MESSAGE_SIZE_MAX + 1));
        assert!(matches!(
            channel.handle_message(&oversized),
            ControlFlow::Continue(())
        ));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        // A frame within the limit still reaches the bus, even when it
        // fails to parse.
        let garbled = WsMessage::text("not json");
        assert!(matches!(
            channel.handle_message(&garbled),
            ControlFlow::Continue(())
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(Event::Remote(protocol::InboundEvent::Unknown { .. }))
        ));
    }

    #[tokio::test]
    async fn queue_low_event_becomes_song_request() {
        let bus = EventBus::new();
        let queue = CommandQueue::new();
        let shutdown = CancellationToken::new();
        let bridge = tokio::spawn(forward_events(
            bus.clone(),
            queue.clone(),
            shutdown.clone(),
        ));

        // Make sure the bridge is subscribed before publishing.
        tokio::task::yield_now().await;
        bus.publish(Event::QueueLowOrEmpty);

        let mut consumer = queue.consumer().await;
        assert_eq!(consumer.next().await, Some(Command::RequestSong));

        shutdown.cancel();
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn lagged_bridge_still_requests_a_song() {
        let bus = EventBus::new();
        let queue = CommandQueue::new();
        let shutdown = CancellationToken::new();
        let bridge = tokio::spawn(forward_events(
            bus.clone(),
            queue.clone(),
            shutdown.clone(),
        ));

        tokio::task::yield_now().await;

        // Overrun the subscriber buffer without yielding, so the scarcity
        // signal is dropped before the bridge can observe it.
        bus.publish(Event::QueueLowOrEmpty);
        for _ in 0..=crate::events::SUBSCRIBER_BUFFER {
            bus.publish(Event::Connected);
        }

        let mut consumer = queue.consumer().await;
        assert_eq!(consumer.next().await, Some(Command::RequestSong));

        shutdown.cancel();
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn song_lifecycle_becomes_status_updates() {
        let bus = EventBus::new();
        let queue = CommandQueue::new();
        let shutdown = CancellationToken::new();
        let bridge = tokio::spawn(forward_events(
            bus.clone(),
            queue.clone(),
            shutdown.clone(),
        ));

        tokio::task::yield_now().await;
        bus.publish(Event::SongStarted(Song {
            link: "https://youtu.be/abc123".to_string(),
            title: "Test Song".to_string(),
        }));
        bus.publish(Event::SongFinished);

        let mut consumer = queue.consumer().await;
        assert_eq!(
            consumer.next().await,
            Some(Command::StatusUpdate {
                state: PlaybackState::Playing,
                song: Some("Test Song".to_string()),
            })
        );
        assert_eq!(
            consumer.next().await,
            Some(Command::StatusUpdate {
                state: PlaybackState::Stopped,
                song: None,
            })
        );

        shutdown.cancel();
        bridge.await.unwrap();
    }
}
