//! Multi-relay subscriptions.
//!
//! A subscription fans one REQ out to every relay in its set and folds the
//! answers back into a single stream: duplicate events are dropped, and EOSE
//! is reported once, after every relay has either sent its own EOSE, timed
//! out waiting for one, closed the REQ, or could not be reached at all.

use crate::config::ClientSettings;
use crate::error::Error;
use crate::metrics;
use crate::relay_connection::{AuthSigner, LegMessage, RelayConnection, RelayConnector};
use dashmap::DashMap;
use nostr::message::MachineReadablePrefix;
use nostr::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub connection_timeout: Duration,
    pub publish_timeout: Duration,
    pub eose_timeout: Duration,
    pub big_relays: Vec<RelayUrl>,
}

impl From<&ClientSettings> for PoolSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            connection_timeout: settings.connection_timeout,
            publish_timeout: settings.publish_timeout,
            eose_timeout: settings.eose_timeout,
            big_relays: settings.big_relay_urls(),
        }
    }
}

/// What a subscription reports to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Event(Box<Event>),
    /// Every relay is done sending stored events. Sent once.
    Eose,
    Closed {
        url: RelayUrl,
        reason: String,
    },
    /// Every relay closed the subscription.
    AllClosed(Vec<String>),
    /// The relay wants authentication and no signer is configured.
    LoginRequired {
        url: RelayUrl,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Report `LoginRequired` instead of treating an auth-required close as final.
    pub prompt_login: bool,
}

pub(crate) struct PoolInner {
    pub(crate) connector: Arc<dyn RelayConnector>,
    pub(crate) relays: DashMap<RelayUrl, Arc<dyn RelayConnection>>,
    pub(crate) signer: RwLock<Option<Arc<dyn AuthSigner>>>,
    pub(crate) new_events: broadcast::Sender<Event>,
    pub(crate) current_relays: RwLock<Vec<RelayUrl>>,
    pub(crate) settings: PoolSettings,
}

/// Pooled relay connections shared by every subscription and publish.
#[derive(Clone)]
pub struct RelayPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.inner.relays.len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

/// Removes duplicate URLs, keeping first-seen order.
pub fn unique_relays(urls: &[RelayUrl]) -> Vec<RelayUrl> {
    let mut seen = HashSet::new();
    urls.iter()
        .filter(|url| seen.insert((*url).clone()))
        .cloned()
        .collect()
}

impl RelayPool {
    pub fn new(connector: Arc<dyn RelayConnector>, settings: PoolSettings) -> Self {
        let (new_events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                relays: DashMap::new(),
                signer: RwLock::new(None),
                new_events,
                current_relays: RwLock::new(Vec::new()),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn big_relays(&self) -> &[RelayUrl] {
        &self.inner.settings.big_relays
    }

    pub fn set_signer(&self, signer: Option<Arc<dyn AuthSigner>>) {
        *self.inner.signer.write() = signer;
    }

    pub(crate) fn signer(&self) -> Option<Arc<dyn AuthSigner>> {
        self.inner.signer.read().clone()
    }

    /// Relays the current user is reading from; used as a last resort for lookups.
    pub fn set_current_relays(&self, relays: Vec<RelayUrl>) {
        *self.inner.current_relays.write() = relays;
    }

    pub fn current_relays(&self) -> Vec<RelayUrl> {
        self.inner.current_relays.read().clone()
    }

    /// Returns a live connection to `url`, connecting if needed.
    pub async fn ensure_relay(&self, url: &RelayUrl) -> Result<Arc<dyn RelayConnection>, Error> {
        if let Some(relay) = self.inner.relays.get(url) {
            if relay.is_connected() {
                return Ok(relay.clone());
            }
        }

        match self
            .inner
            .connector
            .connect(url, self.inner.settings.connection_timeout)
            .await
        {
            Ok(relay) => {
                let relay = self
                    .inner
                    .relays
                    .entry(url.clone())
                    .and_modify(|existing| {
                        if !existing.is_connected() {
                            *existing = relay.clone();
                        }
                    })
                    .or_insert_with(|| relay.clone())
                    .clone();
                Ok(relay)
            }
            Err(e) => {
                metrics::relay_connection_failures().increment(1);
                warn!("Cannot connect to {}: {}", url, e);
                Err(e)
            }
        }
    }

    /// Opens one subscription across `urls`.
    pub fn subscribe(
        &self,
        urls: &[RelayUrl],
        filters: Vec<Filter>,
        opts: SubscribeOptions,
    ) -> (Subscription, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let relays = unique_relays(urls);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let fan_in = Arc::new(FanIn::new(relays.len(), tx));

        metrics::active_subscriptions().increment(1.0);
        debug!(
            "Subscribing to {} relays with {} filters",
            relays.len(),
            filters.len()
        );

        if relays.is_empty() {
            fan_in.settle();
        }

        spawn_local_feed(
            self.inner.new_events.subscribe(),
            filters.clone(),
            fan_in.clone(),
            token.clone(),
        );

        for url in relays {
            let leg = Leg {
                pool: self.clone(),
                url,
                filters: filters.clone(),
                opts,
                fan_in: fan_in.clone(),
                token: token.clone(),
            };
            tokio::spawn(leg.run());
        }

        (Subscription::new(token), rx)
    }

    /// Collects events until every relay is exhausted or closed.
    pub async fn query(&self, urls: &[RelayUrl], filters: Vec<Filter>) -> Vec<Event> {
        let (subscription, mut rx) = self.subscribe(urls, filters, SubscribeOptions::default());
        let mut events = Vec::new();

        while let Some(message) = rx.recv().await {
            match message {
                SubscriptionEvent::Event(event) => events.push(*event),
                SubscriptionEvent::Eose | SubscriptionEvent::AllClosed(_) => break,
                _ => {}
            }
        }

        subscription.close();
        events
    }

    /// Like [`RelayPool::query`], falling back to the big relays when `urls` is empty.
    pub async fn fetch_events(&self, urls: &[RelayUrl], filters: Vec<Filter>) -> Vec<Event> {
        let relays = unique_relays(urls);
        if relays.is_empty() {
            let big_relays = self.inner.settings.big_relays.clone();
            return self.query(&big_relays, filters).await;
        }
        self.query(&relays, filters).await
    }

    /// The newest event matching `filter` on `urls`.
    pub async fn fetch_latest(&self, urls: &[RelayUrl], filter: Filter) -> Option<Event> {
        if urls.is_empty() {
            return None;
        }
        self.query(urls, vec![filter])
            .await
            .into_iter()
            .max_by_key(|event| event.created_at)
    }

    pub(crate) fn emit_new_event(&self, event: &Event) {
        // No live subscriptions is fine.
        let _ = self.inner.new_events.send(event.clone());
    }
}

/// Handle to a running multi-relay subscription.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
    closed: AtomicBool,
}

impl Subscription {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            closed: AtomicBool::new(false),
        }
    }

    /// Stops the local feed and closes every relay leg. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        metrics::active_subscriptions().decrement(1.0);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct FanInState {
    settled: usize,
    eosed: bool,
    closed: usize,
    close_reasons: Vec<String>,
    seen: HashSet<EventId>,
}

/// Shared bookkeeping for every leg of one subscription.
struct FanIn {
    legs: usize,
    state: Mutex<FanInState>,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl FanIn {
    fn new(legs: usize, tx: mpsc::UnboundedSender<SubscriptionEvent>) -> Self {
        Self {
            legs,
            state: Mutex::new(FanInState {
                settled: 0,
                eosed: false,
                closed: 0,
                close_reasons: Vec::new(),
                seen: HashSet::new(),
            }),
            tx,
        }
    }

    fn deliver(&self, event: Event) {
        let fresh = self.state.lock().seen.insert(event.id);
        if fresh {
            let _ = self.tx.send(SubscriptionEvent::Event(Box::new(event)));
        }
    }

    /// Marks one leg as done with stored events.
    fn settle(&self) {
        let mut state = self.state.lock();
        if state.eosed {
            return;
        }
        state.settled += 1;
        if state.settled >= self.legs {
            state.eosed = true;
            let _ = self.tx.send(SubscriptionEvent::Eose);
        }
    }

    fn record_close(&self, url: RelayUrl, reason: String) {
        let mut state = self.state.lock();
        state.closed += 1;
        state.close_reasons.push(reason.clone());
        let _ = self.tx.send(SubscriptionEvent::Closed { url, reason });
        if state.closed >= self.legs {
            let _ = self
                .tx
                .send(SubscriptionEvent::AllClosed(state.close_reasons.clone()));
        }
    }

    fn login_required(&self, url: RelayUrl) {
        let _ = self.tx.send(SubscriptionEvent::LoginRequired { url });
    }
}

fn spawn_local_feed(
    mut new_events: broadcast::Receiver<Event>,
    filters: Vec<Filter>,
    fan_in: Arc<FanIn>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                received = new_events.recv() => match received {
                    Ok(event) => {
                        if filters.iter().any(|filter| filter.match_event(&event)) {
                            fan_in.deliver(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Local event feed lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    });
}

/// One relay's part of a subscription.
struct Leg {
    pool: RelayPool,
    url: RelayUrl,
    filters: Vec<Filter>,
    opts: SubscribeOptions,
    fan_in: Arc<FanIn>,
    token: CancellationToken,
}

enum LegEnd {
    Cancelled,
    Restart,
    Done,
}

impl Leg {
    async fn run(self) {
        let relay = tokio::select! {
            _ = self.token.cancelled() => return,
            relay = self.pool.ensure_relay(&self.url) => relay,
        };

        let relay = match relay {
            Ok(relay) => relay,
            Err(_) => {
                // An unreachable relay has nothing more to send.
                self.fan_in.settle();
                return;
            }
        };

        let mut settled = false;
        let mut has_authed = false;

        loop {
            match self
                .drive(relay.as_ref(), &mut settled, &mut has_authed)
                .await
            {
                LegEnd::Restart => {
                    debug!("Restarting subscription on {} after auth", self.url);
                    continue;
                }
                LegEnd::Cancelled | LegEnd::Done => break,
            }
        }

        if !settled {
            self.fan_in.settle();
        }
    }

    async fn drive(
        &self,
        relay: &dyn RelayConnection,
        settled: &mut bool,
        has_authed: &mut bool,
    ) -> LegEnd {
        let mut leg = match relay.subscribe(self.filters.clone()).await {
            Ok(leg) => leg,
            Err(e) => {
                warn!("REQ to {} failed: {}", self.url, e);
                self.fan_in.record_close(self.url.clone(), e.to_string());
                return LegEnd::Done;
            }
        };

        let eose_timeout = tokio::time::sleep(self.pool.inner.settings.eose_timeout);
        tokio::pin!(eose_timeout);

        let reason = loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    relay.close(&leg.subscription_id).await;
                    return LegEnd::Cancelled;
                }
                _ = &mut eose_timeout, if !*settled => {
                    debug!("No EOSE from {} in time", self.url);
                    *settled = true;
                    self.fan_in.settle();
                }
                message = leg.messages.recv() => match message {
                    Some(LegMessage::Event(event)) => self.fan_in.deliver(*event),
                    Some(LegMessage::Eose) => {
                        if !*settled {
                            *settled = true;
                            self.fan_in.settle();
                        }
                    }
                    Some(LegMessage::Closed(reason)) => break reason,
                    None => break "error: connection closed".to_string(),
                }
            }
        };

        let auth_required =
            MachineReadablePrefix::parse(&reason) == Some(MachineReadablePrefix::AuthRequired);
        if auth_required && !*has_authed {
            if let Some(signer) = self.pool.signer() {
                match relay
                    .authenticate(signer.as_ref(), self.pool.inner.settings.publish_timeout)
                    .await
                {
                    Ok(()) => {
                        *has_authed = true;
                        return LegEnd::Restart;
                    }
                    Err(e) => {
                        warn!("Auth with {} failed: {}", self.url, e);
                        self.fan_in.record_close(self.url.clone(), e.to_string());
                        return LegEnd::Done;
                    }
                }
            }

            if self.opts.prompt_login {
                self.fan_in.login_required(self.url.clone());
                return LegEnd::Done;
            }
        }

        self.fan_in.record_close(self.url.clone(), reason);
        LegEnd::Done
    }
}
