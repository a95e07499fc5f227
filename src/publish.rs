//! Quorum publishing.
//!
//! An event counts as published once a third of its distinct target relays
//! accepted it. The remaining relays keep going in the background and their
//! answers stay available on the returned [`PublishReceipt`].

use crate::error::Error;
use crate::metrics;
use crate::relay_pool::{unique_relays, RelayPool};
use nostr::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type RelayResult = (RelayUrl, Result<(), String>);

/// Final per-relay result of a publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOutcome {
    pub accepted: Vec<RelayUrl>,
    pub failures: Vec<(RelayUrl, String)>,
}

/// Returned as soon as the quorum is reached.
#[derive(Debug)]
pub struct PublishReceipt {
    pub event_id: EventId,
    pub targets: usize,
    outcome: PublishOutcome,
    remaining: mpsc::UnboundedReceiver<RelayResult>,
}

impl PublishReceipt {
    /// Relays that had accepted the event when the quorum was reached.
    pub fn accepted(&self) -> &[RelayUrl] {
        &self.outcome.accepted
    }

    /// Waits for every remaining relay and returns the full result.
    pub async fn outcome(mut self) -> PublishOutcome {
        while let Some((url, result)) = self.remaining.recv().await {
            match result {
                Ok(()) => self.outcome.accepted.push(url),
                Err(reason) => self.outcome.failures.push((url, reason)),
            }
        }
        self.outcome
    }
}

fn quorum_reached(accepted: usize, targets: usize) -> bool {
    accepted as f64 >= targets as f64 / 3.0
}

impl RelayPool {
    /// Sends `event` to every relay in `urls` and resolves once a third of
    /// them accepted it.
    pub async fn publish(&self, urls: &[RelayUrl], event: &Event) -> Result<PublishReceipt, Error> {
        let targets = unique_relays(urls);
        if targets.is_empty() {
            return Err(Error::no_relays());
        }

        debug!("Publishing {} to {} relays", event.id, targets.len());
        let (tx, mut rx) = mpsc::unbounded_channel();
        for url in targets.iter().cloned() {
            let pool = self.clone();
            let event = event.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = pool.publish_to(&url, &event).await;
                let _ = tx.send((url, result));
            });
        }
        drop(tx);

        let mut outcome = PublishOutcome::default();
        while let Some((url, result)) = rx.recv().await {
            match result {
                Ok(()) => outcome.accepted.push(url),
                Err(reason) => {
                    debug!("{} refused {}: {}", url, event.id, reason);
                    outcome.failures.push((url, reason));
                }
            }

            if quorum_reached(outcome.accepted.len(), targets.len()) {
                metrics::events_published().increment(1);
                self.emit_new_event(event);
                return Ok(PublishReceipt {
                    event_id: event.id,
                    targets: targets.len(),
                    outcome,
                    remaining: rx,
                });
            }
        }

        metrics::publish_failures().increment(1);
        warn!("Publishing {} failed on every relay", event.id);
        Err(Error::publish_failed(outcome.failures))
    }

    /// Publishes to one relay, answering one auth challenge if the relay asks.
    async fn publish_to(&self, url: &RelayUrl, event: &Event) -> Result<(), String> {
        let relay = self
            .ensure_relay(url)
            .await
            .map_err(|_| "Cannot connect to relay".to_string())?;
        let timeout = self.settings().publish_timeout;
        let mut has_authed = false;

        loop {
            match relay.publish(event, timeout).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_auth_required() && !has_authed => {
                    let Some(signer) = self.signer() else {
                        return Err(e.to_string());
                    };
                    relay
                        .authenticate(signer.as_ref(), timeout)
                        .await
                        .map_err(|e| e.to_string())?;
                    has_authed = true;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}
