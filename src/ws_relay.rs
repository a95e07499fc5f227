use crate::error::Error;
use crate::metrics;
use crate::relay_connection::{AuthSigner, LegMessage, RelayConnection, RelayConnector, RelayLeg};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use nostr::message::{ClientMessage, RelayMessage};
use nostr::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Opens relay connections over WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(
        &self,
        url: &RelayUrl,
        timeout: Duration,
    ) -> Result<Arc<dyn RelayConnection>, Error> {
        let (stream, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::connection(url, "connection timed out"))?
            .map_err(|e| Error::connection(url, e.to_string()))?;

        debug!("Connected to {}", url);
        Ok(Arc::new(WsRelay::spawn(url.clone(), stream)))
    }
}

type OkWaiter = oneshot::Sender<(bool, String)>;

struct Shared {
    url: RelayUrl,
    subscriptions: DashMap<String, mpsc::UnboundedSender<LegMessage>>,
    /// Every caller waiting on the same event id gets the relay's OK.
    pending_oks: DashMap<EventId, Vec<OkWaiter>>,
    challenge: Mutex<Option<String>>,
    challenge_arrived: Notify,
    token: CancellationToken,
}

impl Shared {
    fn handle_text(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed message from {}: {}", self.url, e);
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let event = Event::clone(&event);
                if event.verify().is_err() {
                    warn!("Dropping event {} with bad signature from {}", event.id, self.url);
                    return;
                }
                if let Some(sender) = self.subscriptions.get(&subscription_id.to_string()) {
                    let _ = sender.send(LegMessage::Event(Box::new(event)));
                }
            }
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                if let Some(sender) = self.subscriptions.get(&subscription_id.to_string()) {
                    let _ = sender.send(LegMessage::Eose);
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                debug!("{} closed {}: {}", self.url, subscription_id, message);
                if let Some((_, sender)) = self.subscriptions.remove(&subscription_id.to_string()) {
                    let _ = sender.send(LegMessage::Closed(message.to_string()));
                }
            }
            RelayMessage::Ok {
                event_id,
                status,
                message,
            } => {
                if let Some((_, waiters)) = self.pending_oks.remove(&event_id) {
                    let message = message.to_string();
                    for waiter in waiters {
                        let _ = waiter.send((status, message.clone()));
                    }
                }
            }
            RelayMessage::Auth { challenge } => {
                debug!("Auth challenge from {}", self.url);
                *self.challenge.lock() = Some(challenge.to_string());
                self.challenge_arrived.notify_waiters();
            }
            other => debug!("Unhandled message from {}: {:?}", self.url, other),
        }
    }

    fn wait_for_ok(&self, event_id: EventId) -> oneshot::Receiver<(bool, String)> {
        let (tx, rx) = oneshot::channel();
        self.pending_oks.entry(event_id).or_default().push(tx);
        rx
    }

    /// Drops the waiters whose callers gave up on `event_id`.
    fn forget_abandoned_waiters(&self, event_id: &EventId) {
        if let Some(mut waiters) = self.pending_oks.get_mut(event_id) {
            waiters.retain(|waiter| !waiter.is_closed());
        }
        self.pending_oks
            .remove_if(event_id, |_, waiters| waiters.is_empty());
    }

    fn shut_down(&self) {
        self.token.cancel();
        let ids: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, sender)) = self.subscriptions.remove(&id) {
                let _ = sender.send(LegMessage::Closed("error: connection closed".to_string()));
            }
        }
        // Dropping the waiters wakes every pending publish with an error.
        self.pending_oks.clear();
    }
}

/// A live WebSocket connection to one relay.
pub struct WsRelay {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl WsRelay {
    pub fn spawn<S>(url: RelayUrl, stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            url,
            subscriptions: DashMap::new(),
            pending_oks: DashMap::new(),
            challenge: Mutex::new(None),
            challenge_arrived: Notify::new(),
            token: CancellationToken::new(),
        });
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (mut sink, mut source) = stream.split();

        let writer_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shared.token.cancelled() => {
                        let _ = sink.close().await;
                        return;
                    }
                    message = outgoing_rx.recv() => {
                        let Some(message) = message else {
                            return;
                        };
                        if let Err(e) = sink.send(message).await {
                            warn!("Write to {} failed: {}", writer_shared.url, e);
                            writer_shared.shut_down();
                            return;
                        }
                    }
                }
            }
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shared.token.cancelled() => break,
                    message = source.next() => match message {
                        Some(Ok(Message::Text(text))) => reader_shared.handle_text(text.as_str()),
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("{} closed the connection", reader_shared.url);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Read from {} failed: {}", reader_shared.url, e);
                            break;
                        }
                    }
                }
            }
            reader_shared.shut_down();
        });

        Self { shared, outgoing }
    }

    fn send(&self, message: ClientMessage) -> Result<(), Error> {
        self.outgoing
            .send(Message::text(message.as_json()))
            .map_err(|_| Error::disconnected(&self.shared.url))
    }

    async fn send_and_wait_ok(
        &self,
        event_id: EventId,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<(), Error> {
        let rx = self.shared.wait_for_ok(event_id);

        if let Err(e) = self.send(message) {
            drop(rx);
            self.shared.forget_abandoned_waiters(&event_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, message))) => Err(Error::rejected(message)),
            Ok(Err(_)) => Err(Error::disconnected(&self.shared.url)),
            Err(_) => {
                self.shared.forget_abandoned_waiters(&event_id);
                Err(Error::timeout(format!("no OK from {}", self.shared.url)))
            }
        }
    }

    async fn wait_for_challenge(&self, timeout: Duration) -> Result<String, Error> {
        let arrived = self.shared.challenge_arrived.notified();
        let current = self.shared.challenge.lock().clone();
        if let Some(challenge) = current {
            return Ok(challenge);
        }

        tokio::time::timeout(timeout, arrived)
            .await
            .map_err(|_| Error::auth(format!("{} never sent a challenge", self.shared.url)))?;

        let current = self.shared.challenge.lock().clone();
        current.ok_or_else(|| Error::auth("challenge vanished"))
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

#[async_trait]
impl RelayConnection for WsRelay {
    fn url(&self) -> &RelayUrl {
        &self.shared.url
    }

    fn is_connected(&self) -> bool {
        !self.shared.token.is_cancelled()
    }

    async fn subscribe(&self, filters: Vec<Filter>) -> Result<RelayLeg, Error> {
        let subscription_id = SubscriptionId::generate();
        let key = subscription_id.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscriptions.insert(key.clone(), tx);

        if let Err(e) = self.send(ClientMessage::ReqMultiFilter { subscription_id, filters }) {
            self.shared.subscriptions.remove(&key);
            return Err(e);
        }

        Ok(RelayLeg {
            subscription_id: key,
            messages: rx,
        })
    }

    async fn close(&self, subscription_id: &str) {
        if self.shared.subscriptions.remove(subscription_id).is_none() {
            return;
        }
        if self.is_connected() {
            let close = ClientMessage::close(SubscriptionId::new(subscription_id));
            if let Err(e) = self.send(close) {
                debug!("Could not send CLOSE to {}: {}", self.shared.url, e);
            }
        }
    }

    async fn publish(&self, event: &Event, timeout: Duration) -> Result<(), Error> {
        self.send_and_wait_ok(event.id, ClientMessage::event(event.clone()), timeout)
            .await
    }

    async fn authenticate(
        &self,
        signer: &dyn AuthSigner,
        timeout: Duration,
    ) -> Result<(), Error> {
        let challenge = self.wait_for_challenge(timeout).await?;
        let auth_event = signer.sign_auth(&challenge, &self.shared.url).await?;
        let auth_id = auth_event.id;

        match self
            .send_and_wait_ok(auth_id, ClientMessage::auth(auth_event), timeout)
            .await
        {
            Ok(()) => {
                debug!("Authenticated with {}", self.shared.url);
                Ok(())
            }
            Err(Error::Rejected { message, .. }) => {
                metrics::auth_failures().increment(1);
                error!("{} rejected our auth: {}", self.shared.url, message);
                Err(Error::auth(message))
            }
            Err(e) => {
                metrics::auth_failures().increment(1);
                Err(e)
            }
        }
    }
}
