use crate::error::Error;
use async_trait::async_trait;
use nostr::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What one relay reports for one REQ.
#[derive(Debug, Clone, PartialEq)]
pub enum LegMessage {
    Event(Box<Event>),
    Eose,
    Closed(String),
}

/// One relay's share of a subscription.
pub struct RelayLeg {
    pub subscription_id: String,
    pub messages: mpsc::UnboundedReceiver<LegMessage>,
}

/// An open connection to a single relay.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    fn url(&self) -> &RelayUrl;

    fn is_connected(&self) -> bool;

    /// Sends a REQ. Messages for it arrive on the returned leg until a
    /// CLOSED is received, `close` is called, or the socket goes away.
    async fn subscribe(&self, filters: Vec<Filter>) -> Result<RelayLeg, Error>;

    async fn close(&self, subscription_id: &str);

    /// Resolves when the relay accepts the event. A refusal surfaces as
    /// [`Error::Rejected`] carrying the relay's message.
    async fn publish(&self, event: &Event, timeout: Duration) -> Result<(), Error>;

    /// Answers the most recent AUTH challenge of this relay.
    async fn authenticate(&self, signer: &dyn AuthSigner, timeout: Duration)
        -> Result<(), Error>;
}

/// Opens relay connections.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(
        &self,
        url: &RelayUrl,
        timeout: Duration,
    ) -> Result<Arc<dyn RelayConnection>, Error>;
}

/// Anything able to sign a NIP-42 auth event.
#[async_trait]
pub trait AuthSigner: Send + Sync {
    async fn sign_auth(&self, challenge: &str, relay: &RelayUrl) -> Result<Event, Error>;
}

#[async_trait]
impl AuthSigner for Keys {
    async fn sign_auth(&self, challenge: &str, relay: &RelayUrl) -> Result<Event, Error> {
        Ok(EventBuilder::auth(challenge, relay.clone()).sign_with_keys(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keys_sign_auth_events_for_the_challenge() {
        let keys = Keys::generate();
        let relay = RelayUrl::parse("wss://relay.nostrzh.org").unwrap();
        let event = keys.sign_auth("challenge-1", &relay).await.unwrap();

        assert_eq!(event.kind, Kind::Authentication);
        assert_eq!(event.pubkey, keys.public_key());
        assert!(event.verify().is_ok());
        let challenge = event
            .tags
            .iter()
            .find(|tag| tag.as_slice().first().map(String::as_str) == Some("challenge"))
            .and_then(|tag| tag.as_slice().get(1).cloned());
        assert_eq!(challenge.as_deref(), Some("challenge-1"));
    }
}
