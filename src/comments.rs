//! NIP-22 comments addressed to a web page.
//!
//! Comments arrive as flat kind-1111 events. The first `e` tag of an event
//! names its direct parent; events without one hang off the page itself.

use crate::error::Error;
use crate::profile::{ProfileService, RelayList};
use crate::publish::PublishReceipt;
use crate::relay_pool::{
    unique_relays, RelayPool, SubscribeOptions, Subscription, SubscriptionEvent,
};
use nostr::prelude::*;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: usize = 50;
const COMMENTER_WRITE_RELAYS: usize = 8;
const AUTHOR_READ_RELAYS: usize = 4;

pub fn comment_kind() -> Kind {
    Kind::from(1111)
}

/// The page URL with and without its trailing slash.
pub fn url_variants(url: &str) -> Vec<String> {
    let other = match url.strip_suffix('/') {
        Some(trimmed) => trimmed.to_string(),
        None => format!("{url}/"),
    };
    vec![url.to_string(), other]
}

fn comments_filter(url: &str) -> Filter {
    Filter::new()
        .kind(comment_kind())
        .custom_tags(SingleLetterTag::uppercase(Alphabet::I), url_variants(url))
}

/// Id of the comment `event` replies to.
pub fn parent_id(event: &Event) -> Option<&str> {
    event
        .tags
        .iter()
        .map(|tag| tag.as_slice())
        .find(|parts| parts.first().map(String::as_str) == Some("e"))
        .and_then(|parts| parts.get(1))
        .map(String::as_str)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub event: Event,
    pub children: Vec<CommentNode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentTree {
    pub roots: Vec<CommentNode>,
    /// Comments reachable from a root.
    pub count: usize,
}

/// Rebuilds the reply tree. Siblings keep the order of `events`; replies
/// whose parent is not in `events` are left out.
pub fn build_comment_tree(events: &[Event]) -> CommentTree {
    let mut seen = HashSet::new();
    let mut roots = Vec::new();
    let mut children: HashMap<&str, Vec<&Event>> = HashMap::new();

    for event in events {
        if !seen.insert(event.id) {
            continue;
        }
        match parent_id(event) {
            Some(parent) => children.entry(parent).or_default().push(event),
            None => roots.push(event),
        }
    }

    fn attach(
        event: &Event,
        children: &HashMap<&str, Vec<&Event>>,
        count: &mut usize,
    ) -> CommentNode {
        *count += 1;
        let replies = children
            .get(event.id.to_hex().as_str())
            .map(|replies| {
                replies
                    .iter()
                    .filter(|reply| reply.id != event.id)
                    .map(|reply| attach(reply, children, count))
                    .collect()
            })
            .unwrap_or_default();
        CommentNode {
            event: event.clone(),
            children: replies,
        }
    }

    let mut count = 0;
    let roots = roots
        .into_iter()
        .map(|event| attach(event, &children, &mut count))
        .collect();

    CommentTree { roots, count }
}

/// Relays to read comments from: the explicit (or default) set plus the
/// read relays of the article author.
pub async fn comment_read_relays(
    profiles: &ProfileService,
    relays: &[RelayUrl],
    author: Option<PublicKey>,
) -> Vec<RelayUrl> {
    let mut relays = relays.to_vec();
    if let Some(author) = author {
        let list = profiles.fetch_relay_list(author).await;
        relays.extend(list.read);
    }
    unique_relays(&relays)
}

/// Paginated comment list for one page URL.
pub struct CommentFeed {
    pool: RelayPool,
    url: String,
    relays: Vec<RelayUrl>,
    limit: usize,
    events: Vec<Event>,
    until: Option<Timestamp>,
    live: Option<(Subscription, mpsc::UnboundedReceiver<SubscriptionEvent>)>,
}

impl CommentFeed {
    pub fn new(pool: RelayPool, url: impl Into<String>, relays: Vec<RelayUrl>) -> Self {
        Self {
            pool,
            url: url.into(),
            relays,
            limit: DEFAULT_PAGE_SIZE,
            events: Vec::new(),
            until: None,
            live: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn has_more(&self) -> bool {
        self.until.is_some()
    }

    /// Upper time bound of the next page.
    pub fn cursor(&self) -> Option<Timestamp> {
        self.until
    }

    pub fn tree(&self) -> CommentTree {
        build_comment_tree(&self.events)
    }

    /// Loads the newest page and keeps listening for new comments.
    pub async fn load(&mut self) {
        self.close();
        self.events.clear();
        self.until = None;

        let filter = comments_filter(&self.url).limit(self.limit);
        let (subscription, mut rx) =
            self.pool
                .subscribe(&self.relays, vec![filter], SubscribeOptions::default());

        let mut buffered = Vec::new();
        while let Some(message) = rx.recv().await {
            match message {
                SubscriptionEvent::Event(event) => buffered.push(*event),
                SubscriptionEvent::Eose => break,
                SubscriptionEvent::AllClosed(reasons) => {
                    warn!("Every relay closed comments of {}: {:?}", self.url, reasons)
                }
                _ => {}
            }
        }

        sort_newest_first(&mut buffered);
        buffered.truncate(self.limit);
        self.until = next_cursor(&buffered, self.limit);
        debug!(
            "Loaded {} comments for {} (more: {})",
            buffered.len(),
            self.url,
            self.until.is_some()
        );
        self.events = buffered;
        self.live = Some((subscription, rx));
    }

    /// Waits for the next comment posted after [`CommentFeed::load`] and
    /// puts it in front. `None` once the feed is closed.
    pub async fn next_live(&mut self) -> Option<Event> {
        let (_, rx) = self.live.as_mut()?;
        while let Some(message) = rx.recv().await {
            if let SubscriptionEvent::Event(event) = message {
                if self.events.iter().any(|known| known.id == event.id) {
                    continue;
                }
                self.events.insert(0, (*event).clone());
                return Some(*event);
            }
        }
        None
    }

    /// Fetches the page before the cursor. Returns how many comments were added.
    pub async fn load_more(&mut self) -> usize {
        let Some(until) = self.until else {
            return 0;
        };

        let filter = comments_filter(&self.url).until(until).limit(self.limit);
        let mut page = self.pool.query(&self.relays, vec![filter]).await;
        if page.is_empty() {
            self.until = None;
            return 0;
        }

        sort_newest_first(&mut page);
        self.until = page
            .last()
            .map(|oldest| Timestamp::from(oldest.created_at.as_u64().saturating_sub(1)));

        let known: HashSet<EventId> = self.events.iter().map(|event| event.id).collect();
        let before = self.events.len();
        self.events
            .extend(page.into_iter().filter(|event| !known.contains(&event.id)));
        self.events.len() - before
    }

    pub fn close(&mut self) {
        if let Some((subscription, _)) = self.live.take() {
            subscription.close();
        }
    }
}

fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

fn next_cursor(page: &[Event], limit: usize) -> Option<Timestamp> {
    if page.len() < limit {
        return None;
    }
    page.last()
        .map(|oldest| Timestamp::from(oldest.created_at.as_u64().saturating_sub(1)))
}

/// A comment about to be signed.
#[derive(Debug, Clone)]
pub struct CommentDraft {
    url: String,
    content: String,
    parent: Option<(Event, Option<RelayUrl>)>,
    article_authors: Vec<PublicKey>,
}

impl CommentDraft {
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
            parent: None,
            article_authors: Vec::new(),
        }
    }

    /// Makes this a reply. `hint` is a relay the parent was seen on.
    pub fn reply_to(mut self, parent: Event, hint: Option<RelayUrl>) -> Self {
        self.parent = Some((parent, hint));
        self
    }

    pub fn article_authors(mut self, authors: Vec<PublicKey>) -> Self {
        self.article_authors = authors;
        self
    }

    pub fn tags(&self) -> Result<Vec<Tag>, Error> {
        let mut parts: Vec<Vec<String>> = vec![
            vec!["I".into(), self.url.clone()],
            vec!["K".into(), "web".into()],
        ];

        match &self.parent {
            Some((parent, hint)) => {
                parts.push(vec![
                    "e".into(),
                    parent.id.to_hex(),
                    hint.as_ref().map(|url| url.to_string()).unwrap_or_default(),
                    parent.pubkey.to_hex(),
                ]);
                parts.push(vec!["k".into(), parent.kind.as_u16().to_string()]);
                parts.push(vec!["p".into(), parent.pubkey.to_hex()]);
            }
            None => {
                parts.push(vec!["i".into(), self.url.clone()]);
                parts.push(vec!["k".into(), "web".into()]);
            }
        }

        for author in &self.article_authors {
            parts.push(vec!["p".into(), author.to_hex()]);
        }

        parts
            .into_iter()
            .map(|parts| Tag::parse(parts).map_err(|e| Error::nostr(e.to_string())))
            .collect()
    }

    pub fn into_builder(self) -> Result<EventBuilder, Error> {
        if self.content.trim().is_empty() {
            return Err(Error::invalid_input("comment is empty"));
        }
        let tags = self.tags()?;
        Ok(EventBuilder::new(comment_kind(), self.content).tags(tags))
    }

    pub fn sign_with_keys(self, keys: &Keys) -> Result<Event, Error> {
        Ok(self.into_builder()?.sign_with_keys(keys)?)
    }
}

/// Where a new comment goes: the commenter's write relays, each article
/// author's read relays and the community defaults.
pub fn comment_publish_relays(
    commenter: &RelayList,
    article_authors: &[RelayList],
    default_relays: &[RelayUrl],
    big_relays: &[RelayUrl],
) -> Vec<RelayUrl> {
    let mut relays: Vec<RelayUrl> = commenter
        .write
        .iter()
        .take(COMMENTER_WRITE_RELAYS)
        .cloned()
        .collect();
    for author in article_authors {
        relays.extend(author.read.iter().take(AUTHOR_READ_RELAYS).cloned());
    }
    relays.extend(default_relays.iter().cloned());

    let relays = unique_relays(&relays);
    if relays.is_empty() {
        return big_relays.to_vec();
    }
    relays
}

/// Publishes a signed comment to the relays its readers use.
pub async fn publish_comment(
    profiles: &ProfileService,
    comment: &Event,
    article_authors: &[PublicKey],
    default_relays: &[RelayUrl],
) -> Result<PublishReceipt, Error> {
    let (commenter, authors) = tokio::join!(
        profiles.fetch_relay_list(comment.pubkey),
        profiles.fetch_relay_lists(article_authors)
    );
    let pool = profiles.pool();
    let relays = comment_publish_relays(&commenter, &authors, default_relays, pool.big_relays());
    pool.publish(&relays, comment).await
}
