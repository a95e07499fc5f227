use crate::error::Error;
use crate::relay_connection::{AuthSigner, LegMessage, RelayConnection, RelayConnector, RelayLeg};
use crate::relay_pool::{PoolSettings, RelayPool};
use async_trait::async_trait;
use dashmap::DashMap;
use nostr::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn relay_url(url: &str) -> RelayUrl {
    RelayUrl::parse(url).unwrap()
}

pub fn signed_note(content: &str) -> Event {
    EventBuilder::new(Kind::TextNote, content)
        .sign_with_keys(&Keys::generate())
        .unwrap()
}

pub fn test_pool(network: &Arc<MockNetwork>) -> RelayPool {
    test_pool_with_eose_timeout(network, Duration::from_secs(1))
}

pub fn test_pool_with_eose_timeout(network: &Arc<MockNetwork>, eose_timeout: Duration) -> RelayPool {
    RelayPool::new(
        network.clone(),
        PoolSettings {
            connection_timeout: Duration::from_millis(200),
            publish_timeout: Duration::from_millis(500),
            eose_timeout,
            big_relays: vec![relay_url("wss://big.example")],
        },
    )
}

/// In-memory relays keyed by URL. Unknown URLs refuse connections.
#[derive(Default)]
pub struct MockNetwork {
    relays: DashMap<RelayUrl, Arc<MockRelay>>,
    connects: DashMap<RelayUrl, usize>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_relay(&self, url: &str) -> Arc<MockRelay> {
        let url = relay_url(url);
        let relay = Arc::new(MockRelay::new(url.clone()));
        self.relays.insert(url, relay.clone());
        relay
    }

    pub fn connect_count(&self, url: &RelayUrl) -> usize {
        self.connects.get(url).map(|count| *count).unwrap_or(0)
    }
}

#[async_trait]
impl RelayConnector for MockNetwork {
    async fn connect(
        &self,
        url: &RelayUrl,
        _timeout: Duration,
    ) -> Result<Arc<dyn RelayConnection>, Error> {
        *self.connects.entry(url.clone()).or_insert(0) += 1;
        let relay = self
            .relays
            .get(url)
            .map(|relay| relay.clone())
            .ok_or_else(|| Error::connection(url, "connection refused"))?;
        relay.connected.store(true, Ordering::SeqCst);
        Ok(relay)
    }
}

#[derive(Default)]
struct Behaviour {
    send_eose: bool,
    eose_delay: Option<Duration>,
    publish_delay: Option<Duration>,
    reject_publish: Option<String>,
    auth_for_reads: bool,
    auth_for_writes: bool,
    reject_auth: bool,
    forget_auth: bool,
    authed: bool,
}

/// A scripted relay. Stored events matching a REQ are replayed before EOSE.
pub struct MockRelay {
    url: RelayUrl,
    connected: AtomicBool,
    behaviour: Mutex<Behaviour>,
    stored: Mutex<Vec<Event>>,
    published: Mutex<Vec<Event>>,
    open: DashMap<String, mpsc::UnboundedSender<LegMessage>>,
    reqs: Mutex<Vec<Vec<Filter>>>,
    next_id: AtomicUsize,
    closes: AtomicUsize,
    auths: AtomicUsize,
    publish_attempts: AtomicUsize,
}

impl MockRelay {
    fn new(url: RelayUrl) -> Self {
        Self {
            url,
            connected: AtomicBool::new(true),
            behaviour: Mutex::new(Behaviour {
                send_eose: true,
                ..Default::default()
            }),
            stored: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            open: DashMap::new(),
            reqs: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            auths: AtomicUsize::new(0),
            publish_attempts: AtomicUsize::new(0),
        }
    }

    pub fn store(&self, event: Event) {
        self.stored.lock().push(event);
    }

    /// Sends an event to every open subscription it matches.
    pub fn push_live(&self, event: Event) {
        for entry in self.open.iter() {
            let _ = entry.value().send(LegMessage::Event(Box::new(event.clone())));
        }
    }

    /// Ends every open subscription with a CLOSED carrying `reason`.
    pub fn close_subscriptions(&self, reason: &str) {
        let ids: Vec<String> = self.open.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, sender)) = self.open.remove(&id) {
                let _ = sender.send(LegMessage::Closed(reason.to_string()));
            }
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.open.clear();
    }

    pub fn set_send_eose(&self, send: bool) {
        self.behaviour.lock().send_eose = send;
    }

    pub fn set_eose_delay(&self, delay: Duration) {
        self.behaviour.lock().eose_delay = Some(delay);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        self.behaviour.lock().publish_delay = Some(delay);
    }

    pub fn reject_publish(&self, message: &str) {
        self.behaviour.lock().reject_publish = Some(message.to_string());
    }

    pub fn require_auth_for_reads(&self) {
        self.behaviour.lock().auth_for_reads = true;
    }

    pub fn require_auth_for_writes(&self) {
        self.behaviour.lock().auth_for_writes = true;
    }

    pub fn reject_auth(&self) {
        self.behaviour.lock().reject_auth = true;
    }

    /// Accepts auth events but keeps asking for auth.
    pub fn forget_auth(&self) {
        self.behaviour.lock().forget_auth = true;
    }

    pub fn published(&self) -> Vec<Event> {
        self.published.lock().clone()
    }

    pub fn reqs(&self) -> Vec<Vec<Filter>> {
        self.reqs.lock().clone()
    }

    pub fn req_count(&self) -> usize {
        self.reqs.lock().len()
    }

    pub fn closed_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn auth_count(&self) -> usize {
        self.auths.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnection for MockRelay {
    fn url(&self) -> &RelayUrl {
        &self.url
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, filters: Vec<Filter>) -> Result<RelayLeg, Error> {
        let subscription_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.reqs.lock().push(filters.clone());

        let (needs_auth, send_eose, eose_delay) = {
            let behaviour = self.behaviour.lock();
            (
                behaviour.auth_for_reads && !behaviour.authed,
                behaviour.send_eose,
                behaviour.eose_delay,
            )
        };

        if needs_auth {
            let _ = tx.send(LegMessage::Closed(
                "auth-required: this relay is for members".to_string(),
            ));
            return Ok(RelayLeg {
                subscription_id,
                messages: rx,
            });
        }

        let matching: Vec<Event> = self
            .stored
            .lock()
            .iter()
            .filter(|event| filters.iter().any(|filter| filter.match_event(event)))
            .cloned()
            .collect();
        for event in matching {
            let _ = tx.send(LegMessage::Event(Box::new(event)));
        }

        if send_eose {
            match eose_delay {
                Some(delay) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(LegMessage::Eose);
                    });
                }
                None => {
                    let _ = tx.send(LegMessage::Eose);
                }
            }
        }

        self.open.insert(subscription_id.clone(), tx);
        Ok(RelayLeg {
            subscription_id,
            messages: rx,
        })
    }

    async fn close(&self, subscription_id: &str) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open.remove(subscription_id);
    }

    async fn publish(&self, event: &Event, _timeout: Duration) -> Result<(), Error> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let (delay, needs_auth, rejection) = {
            let behaviour = self.behaviour.lock();
            (
                behaviour.publish_delay,
                behaviour.auth_for_writes && !behaviour.authed,
                behaviour.reject_publish.clone(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if needs_auth {
            return Err(Error::rejected("auth-required: sign in to post"));
        }
        if let Some(message) = rejection {
            return Err(Error::rejected(message));
        }

        self.published.lock().push(event.clone());
        Ok(())
    }

    async fn authenticate(
        &self,
        signer: &dyn AuthSigner,
        _timeout: Duration,
    ) -> Result<(), Error> {
        self.auths.fetch_add(1, Ordering::SeqCst);
        let event = signer.sign_auth("mock-challenge", &self.url).await?;
        if event.kind != Kind::Authentication {
            return Err(Error::auth("not an auth event"));
        }

        let mut behaviour = self.behaviour.lock();
        if behaviour.reject_auth {
            return Err(Error::auth("restricted: you are not a member"));
        }
        if !behaviour.forget_auth {
            behaviour.authed = true;
        }
        Ok(())
    }
}
