//! Profiles (kind 0) and relay lists (kind 10002).

use crate::batch_loader::BatchLoader;
use crate::config::ClientSettings;
use crate::error::Error;
use crate::relay_pool::RelayPool;
use crate::replaceable_loader::{ReplaceableKey, ReplaceableLoader};
use nostr::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub pubkey: PublicKey,
    pub npub: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetadataContent {
    name: Option<String>,
    display_name: Option<String>,
    about: Option<String>,
    picture: Option<String>,
    nip05: Option<String>,
    lud16: Option<String>,
    website: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub fn pubkey_to_npub(pubkey: &PublicKey) -> String {
    pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex())
}

/// `npub1abc…wxyz`
pub fn format_pubkey(pubkey: &PublicKey) -> String {
    let npub = pubkey_to_npub(pubkey);
    if npub.len() <= 12 {
        return npub;
    }
    format!("{}…{}", &npub[..8], &npub[npub.len() - 4..])
}

impl Profile {
    /// A profile carrying nothing but the key.
    pub fn fallback(pubkey: PublicKey) -> Self {
        Self {
            pubkey,
            npub: pubkey_to_npub(&pubkey),
            username: format_pubkey(&pubkey),
            display_name: None,
            about: None,
            avatar: None,
            nip05: None,
            lud16: None,
            website: None,
        }
    }

    /// Reads a kind-0 event. Unparseable content yields the fallback profile.
    pub fn from_event(event: &Event) -> Self {
        let content: MetadataContent = match serde_json::from_str(&event.content) {
            Ok(content) => content,
            Err(e) => {
                debug!("Unreadable metadata in {}: {}", event.id, e);
                return Self::fallback(event.pubkey);
            }
        };

        let display_name = non_empty(content.display_name);
        let name = non_empty(content.name);
        let username = display_name
            .clone()
            .or_else(|| name.clone())
            .unwrap_or_else(|| format_pubkey(&event.pubkey));

        Self {
            pubkey: event.pubkey,
            npub: pubkey_to_npub(&event.pubkey),
            username,
            display_name: display_name.or(name),
            about: non_empty(content.about),
            avatar: non_empty(content.picture),
            nip05: non_empty(content.nip05),
            lud16: non_empty(content.lud16),
            website: non_empty(content.website),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayScope {
    Read,
    Write,
    Both,
}

impl RelayScope {
    fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            Some("read") => Self::Read,
            Some("write") => Self::Write,
            _ => Self::Both,
        }
    }

    pub fn reads(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    pub fn writes(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayList {
    pub pubkey: PublicKey,
    pub read: Vec<RelayUrl>,
    pub write: Vec<RelayUrl>,
    /// Entries as published, empty when the user has no list.
    pub original: Vec<(RelayUrl, RelayScope)>,
}

impl RelayList {
    pub fn from_event(event: &Event) -> Self {
        let mut original: Vec<(RelayUrl, RelayScope)> = Vec::new();
        for tag in event.tags.iter() {
            let parts = tag.as_slice();
            if parts.first().map(String::as_str) != Some("r") {
                continue;
            }
            let Some(Ok(url)) = parts.get(1).map(|url| RelayUrl::parse(url)) else {
                continue;
            };
            if original.iter().any(|(seen, _)| *seen == url) {
                continue;
            }
            let scope = RelayScope::from_marker(parts.get(2).map(String::as_str));
            original.push((url, scope));
        }

        Self {
            pubkey: event.pubkey,
            read: original
                .iter()
                .filter(|(_, scope)| scope.reads())
                .map(|(url, _)| url.clone())
                .collect(),
            write: original
                .iter()
                .filter(|(_, scope)| scope.writes())
                .map(|(url, _)| url.clone())
                .collect(),
            original,
        }
    }

    /// Used when the user never published a relay list.
    pub fn fallback(pubkey: PublicKey, big_relays: &[RelayUrl]) -> Self {
        Self {
            pubkey,
            read: big_relays.to_vec(),
            write: big_relays.to_vec(),
            original: Vec::new(),
        }
    }
}

/// A decoded user reference.
#[derive(Debug, Clone, PartialEq)]
pub struct UserId {
    pub pubkey: PublicKey,
    /// Relay hints carried by an `nprofile`.
    pub relays: Vec<RelayUrl>,
}

/// Accepts a 64-char hex key, an `npub` or an `nprofile`.
pub fn user_id_to_pubkey(id: &str) -> Result<UserId, Error> {
    let id = id.trim();
    if id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(UserId {
            pubkey: PublicKey::from_hex(id)?,
            relays: Vec::new(),
        });
    }
    if id.starts_with("npub1") {
        return Ok(UserId {
            pubkey: PublicKey::from_bech32(id)?,
            relays: Vec::new(),
        });
    }
    if id.starts_with("nprofile1") {
        let profile = Nip19Profile::from_bech32(id)?;
        return Ok(UserId {
            pubkey: profile.public_key,
            relays: profile.relays,
        });
    }
    Err(Error::invalid_id(format!("{id} is not a pubkey, npub or nprofile")))
}

fn filter_out_big_relays(relays: &[RelayUrl], big_relays: &[RelayUrl]) -> Vec<RelayUrl> {
    relays
        .iter()
        .filter(|url| !big_relays.contains(url))
        .cloned()
        .collect()
}

/// Profile and relay-list lookups backed by the replaceable-event loader.
pub struct ProfileService {
    pool: RelayPool,
    replaceable: BatchLoader<ReplaceableLoader>,
    relay_limit: usize,
}

impl ProfileService {
    pub fn new(pool: RelayPool, settings: &ClientSettings) -> Self {
        Self {
            replaceable: BatchLoader::new(ReplaceableLoader::new(pool.clone()), &settings.loader),
            pool,
            relay_limit: settings.profile_relay_limit,
        }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub async fn fetch_profile(&self, id: &str) -> Result<Profile, Error> {
        let user = user_id_to_pubkey(id)?;
        Ok(self.profile_for(user).await)
    }

    pub async fn fetch_profiles(&self, pubkeys: &[PublicKey]) -> Vec<Profile> {
        futures::future::join_all(pubkeys.iter().map(|pubkey| {
            self.profile_for(UserId {
                pubkey: *pubkey,
                relays: Vec::new(),
            })
        }))
        .await
    }

    pub async fn fetch_relay_list(&self, pubkey: PublicKey) -> RelayList {
        let mut lists = self.fetch_relay_lists(&[pubkey]).await;
        lists
            .pop()
            .unwrap_or_else(|| RelayList::fallback(pubkey, self.pool.big_relays()))
    }

    pub async fn fetch_relay_lists(&self, pubkeys: &[PublicKey]) -> Vec<RelayList> {
        let keys = pubkeys
            .iter()
            .map(|pubkey| ReplaceableKey::new(*pubkey, Kind::RelayList))
            .collect();
        let events = self.replaceable.load_many(keys).await;

        pubkeys
            .iter()
            .zip(events)
            .map(|(pubkey, event)| match event {
                Ok(Some(event)) => RelayList::from_event(&event),
                _ => RelayList::fallback(*pubkey, self.pool.big_relays()),
            })
            .collect()
    }

    /// Remembers a freshly published profile or relay list.
    pub fn remember(&self, event: &Event) {
        self.replaceable.prime(
            ReplaceableKey::new(event.pubkey, event.kind),
            Some(event.clone()),
        );
    }

    async fn profile_for(&self, user: UserId) -> Profile {
        match self.profile_event(user.clone()).await {
            Some(event) => Profile::from_event(&event),
            None => Profile::fallback(user.pubkey),
        }
    }

    async fn profile_event(&self, user: UserId) -> Option<Event> {
        let key = ReplaceableKey::new(user.pubkey, Kind::Metadata);
        if let Ok(Some(event)) = self.replaceable.load(key).await {
            return Some(event);
        }

        let big_relays = self.pool.big_relays();
        let mut relays = user.relays;
        if relays.is_empty() {
            let relay_list = self.fetch_relay_list(user.pubkey).await;
            relays = filter_out_big_relays(&relay_list.write, big_relays);
            relays.truncate(self.relay_limit);
        }
        if relays.is_empty() {
            relays = filter_out_big_relays(&self.pool.current_relays(), big_relays);
        }

        debug!(
            "Profile of {} not on big relays, asking {} others",
            user.pubkey,
            relays.len()
        );
        let filter = Filter::new()
            .author(user.pubkey)
            .kind(Kind::Metadata)
            .limit(1);
        self.pool.fetch_latest(&relays, filter).await
    }
}
