use crate::batch_loader::BatchLoad;
use crate::relay_pool::RelayPool;
use async_trait::async_trait;
use nostr::prelude::*;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplaceableKey {
    pub pubkey: PublicKey,
    pub kind: Kind,
}

impl ReplaceableKey {
    pub fn new(pubkey: PublicKey, kind: Kind) -> Self {
        Self { pubkey, kind }
    }
}

/// Resolves the newest replaceable event per (author, kind) from the big relays.
///
/// A batch is split by kind and each kind becomes one query for all of its
/// authors, so a page full of profiles costs a single REQ per relay.
pub struct ReplaceableLoader {
    pool: RelayPool,
}

impl ReplaceableLoader {
    pub fn new(pool: RelayPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchLoad for ReplaceableLoader {
    type Key = ReplaceableKey;
    type Value = Option<Event>;

    async fn load_batch(&self, keys: Vec<ReplaceableKey>) -> Vec<Option<Event>> {
        let mut groups: HashMap<Kind, Vec<PublicKey>> = HashMap::new();
        for key in &keys {
            let authors = groups.entry(key.kind).or_default();
            if !authors.contains(&key.pubkey) {
                authors.push(key.pubkey);
            }
        }

        let big_relays = self.pool.big_relays().to_vec();
        let queries = groups.into_iter().map(|(kind, authors)| {
            debug!("Loading kind {} for {} authors", kind, authors.len());
            let filter = Filter::new().authors(authors).kind(kind);
            self.pool.query(&big_relays, vec![filter])
        });
        let results = futures::future::join_all(queries).await;

        let mut newest: HashMap<ReplaceableKey, Event> = HashMap::new();
        for event in results.into_iter().flatten() {
            let key = ReplaceableKey::new(event.pubkey, event.kind);
            match newest.get(&key) {
                Some(existing) if existing.created_at >= event.created_at => {}
                _ => {
                    newest.insert(key, event);
                }
            }
        }

        keys.iter().map(|key| newest.get(key).cloned()).collect()
    }
}
