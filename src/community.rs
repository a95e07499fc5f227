//! Community backend lookups and the events a fresh account starts with.

use crate::config::CommunitySettings;
use crate::error::Error;
use crate::publish::PublishReceipt;
use crate::relay_pool::RelayPool;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use nostr::hashes::sha256::Hash as Sha256Hash;
use nostr::hashes::Hash;
use nostr::nips::nip98::{HttpData, HttpMethod};
use nostr::prelude::*;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const NAME_MIN_CHARS: usize = 2;
const NAME_MAX_CHARS: usize = 15;

pub fn favorite_relays_kind() -> Kind {
    Kind::from(10012)
}

pub fn profile_url(pubkey: &PublicKey) -> String {
    format!("https://jumble.social/users/{}", pubkey.to_hex())
}

/// The community `nostr.json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Nip05Directory {
    #[serde(default)]
    pub names: HashMap<String, String>,
    #[serde(default)]
    pub relays: HashMap<String, Vec<String>>,
}

impl Nip05Directory {
    pub fn pubkey_for(&self, name: &str) -> Option<PublicKey> {
        let hex = self
            .names
            .get(name)
            .or_else(|| self.names.get(&name.to_lowercase()))?;
        PublicKey::from_hex(hex).ok()
    }

    pub fn name_for(&self, pubkey: &PublicKey) -> Option<&str> {
        let hex = pubkey.to_hex();
        self.names
            .iter()
            .filter(|(_, value)| **value == hex)
            .map(|(name, _)| name.as_str())
            .min()
    }
}

pub fn validate_nip05_name(name: &str) -> Result<(), Error> {
    let chars = name.chars().count();
    if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&chars) {
        return Err(Error::invalid_input(format!(
            "NIP-05 names are {NAME_MIN_CHARS}-{NAME_MAX_CHARS} characters long"
        )));
    }
    Ok(())
}

/// Builds the `Authorization` value of a NIP-98 signed request: a kind
/// 27235 event over the URL, method and SHA-256 of `body`, base64 encoded.
/// A non-zero `difficulty` mines the event to that many leading zero bits.
pub fn nip98_authorization(
    keys: &Keys,
    url: &str,
    method: HttpMethod,
    body: &str,
    difficulty: u8,
) -> Result<String, Error> {
    let url = Url::parse(url).map_err(|e| Error::invalid_input(format!("{url}: {e}")))?;
    let data = HttpData::new(url, method).payload(Sha256Hash::hash(body.as_bytes()));

    let mut builder = EventBuilder::http_auth(data);
    if difficulty > 0 {
        builder = builder.pow(difficulty);
    }
    let event = builder.sign_with_keys(keys)?;
    Ok(format!("Nostr {}", BASE64_STANDARD.encode(event.as_json())))
}

/// A round of admission questions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizSession {
    pub session_id: String,
    pub questions: Vec<QuizQuestion>,
    #[serde(default)]
    pub config: QuizConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuizConfig {
    pub questions_per_session: usize,
    pub passing_score: usize,
    #[serde(rename = "sessionTTLMinutes")]
    pub session_ttl_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    pub passed: bool,
    #[serde(default)]
    pub correct_count: usize,
}

#[derive(Debug, Deserialize)]
struct RegistrationReply {
    #[serde(default)]
    success: bool,
    error: Option<String>,
}

/// HTTP client for the community backend.
#[derive(Debug, Clone)]
pub struct CommunityClient {
    http: reqwest::Client,
    backend_url: String,
    join_pow_difficulty: u8,
}

impl CommunityClient {
    pub fn new(settings: &CommunitySettings) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            backend_url: settings.backend_url.trim_end_matches('/').to_string(),
            join_pow_difficulty: settings.join_pow_difficulty,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.backend_url, path)
    }

    /// POSTs `body` as JSON, signed with NIP-98 when `auth` is given.
    async fn post_json(
        &self,
        path: &str,
        body: Value,
        auth: Option<(&Keys, u8)>,
    ) -> Result<reqwest::Response, Error> {
        let url = self.endpoint(path);
        let body = body.to_string();
        let mut request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json");
        if let Some((keys, difficulty)) = auth {
            let token = nip98_authorization(keys, &url, HttpMethod::POST, &body, difficulty)?;
            request = request.header(AUTHORIZATION, token);
        }
        debug!("POST {}", url);
        Ok(request.body(body).send().await?)
    }

    /// Claims `name@nostrzh.org` for the owner of `keys`.
    pub async fn register_nip05(&self, keys: &Keys, name: &str) -> Result<(), Error> {
        validate_nip05_name(name)?;

        let reply: RegistrationReply = self
            .post_json("/v1/nip05/register", json!({ "name": name }), Some((keys, 0)))
            .await?
            .json()
            .await?;

        match reply {
            RegistrationReply { success: true, .. } => {
                info!("Registered NIP-05 name {} for {}", name, keys.public_key());
                Ok(())
            }
            RegistrationReply {
                error: Some(error), ..
            } => Err(Error::rejected(error)),
            RegistrationReply { .. } => Err(Error::rejected("registration failed")),
        }
    }

    pub async fn start_quiz(&self, pubkey: &PublicKey) -> Result<QuizSession, Error> {
        let session = self
            .post_json("/v1/quiz/start", json!({ "pubkey": pubkey.to_hex() }), None)
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(session)
    }

    /// Sends one option index per question.
    pub async fn submit_quiz(
        &self,
        session: &QuizSession,
        answers: &[usize],
    ) -> Result<QuizResult, Error> {
        if answers.len() != session.questions.len() {
            return Err(Error::invalid_input(format!(
                "expected {} answers, got {}",
                session.questions.len(),
                answers.len()
            )));
        }
        if let Some((index, _)) = answers
            .iter()
            .zip(&session.questions)
            .enumerate()
            .find(|(_, (answer, question))| **answer >= question.options.len())
        {
            return Err(Error::invalid_input(format!(
                "answer {} is not one of the options",
                index + 1
            )));
        }

        let result = self
            .post_json(
                "/v1/quiz/submit",
                json!({ "sessionId": session.session_id, "answers": answers }),
                None,
            )
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }

    /// Adds `pubkey` to the whitelist. The request is signed by a throwaway
    /// key whose auth event carries proof of work.
    pub async fn join(&self, pubkey: &PublicKey) -> Result<(), Error> {
        let signer = Keys::generate();
        self.post_json(
            "/v1/users/join",
            json!({ "pubkey": pubkey.to_hex() }),
            Some((&signer, self.join_pow_difficulty)),
        )
        .await?
        .error_for_status()?;
        info!("{} joined the community", pubkey);
        Ok(())
    }

    /// Submits the answers and joins when they pass.
    pub async fn finish_quiz(
        &self,
        session: &QuizSession,
        answers: &[usize],
        pubkey: &PublicKey,
    ) -> Result<QuizResult, Error> {
        let result = self.submit_quiz(session, answers).await?;
        if result.passed {
            self.join(pubkey).await?;
        } else {
            debug!(
                "Quiz not passed: {} correct of {}",
                result.correct_count,
                session.questions.len()
            );
        }
        Ok(result)
    }

    pub async fn nostr_json(&self) -> Result<Nip05Directory, Error> {
        let url = format!("{}/.well-known/nostr.json", self.backend_url);
        debug!("Fetching {}", url);
        let directory = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(directory)
    }

    /// Whitelisted members, optionally only the first `limit`.
    pub async fn whitelist_users(&self, limit: Option<usize>) -> Result<Vec<PublicKey>, Error> {
        let url = format!("{}/v1/users", self.backend_url);
        let users: Vec<String> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut pubkeys: Vec<PublicKey> = users
            .iter()
            .filter_map(|user| match PublicKey::from_hex(user) {
                Ok(pubkey) => Some(pubkey),
                Err(e) => {
                    warn!("Skipping whitelist entry {}: {}", user, e);
                    None
                }
            })
            .collect();
        if let Some(limit) = limit {
            pubkeys.truncate(limit);
        }
        Ok(pubkeys)
    }
}

/// What a new account publishes before taking the quiz.
#[derive(Debug, Clone)]
pub struct OnboardingEvents {
    pub contacts: Event,
    pub relay_list: Event,
    pub favorite_relays: Event,
}

impl OnboardingEvents {
    /// The home relay is write-only in the relay list; the defaults are
    /// read+write except the last one, which is read-only.
    pub fn new(keys: &Keys, home_relay: &str, default_relays: &[RelayUrl]) -> Result<Self, Error> {
        let contacts = EventBuilder::new(Kind::ContactList, "").sign_with_keys(keys)?;

        let mut relay_tags = vec![vec!["r".to_string(), home_relay.to_string(), "write".to_string()]];
        for (index, url) in default_relays.iter().enumerate() {
            let mut tag = vec!["r".to_string(), url.to_string()];
            if index + 1 == default_relays.len() {
                tag.push("read".to_string());
            }
            relay_tags.push(tag);
        }
        let relay_list = EventBuilder::new(Kind::RelayList, "")
            .tags(parse_tags(relay_tags)?)
            .sign_with_keys(keys)?;

        let favorite_relays = EventBuilder::new(favorite_relays_kind(), "")
            .tags(parse_tags(vec![vec!["relay".to_string(), home_relay.to_string()]])?)
            .sign_with_keys(keys)?;

        Ok(Self {
            contacts,
            relay_list,
            favorite_relays,
        })
    }

    pub fn events(&self) -> [&Event; 3] {
        [&self.contacts, &self.relay_list, &self.favorite_relays]
    }

    /// Publishes all three events to `relays`.
    pub async fn publish(
        &self,
        pool: &RelayPool,
        relays: &[RelayUrl],
    ) -> Result<Vec<PublishReceipt>, Error> {
        let results =
            futures::future::join_all(self.events().map(|event| pool.publish(relays, event))).await;
        results.into_iter().collect()
    }
}

fn parse_tags(tags: Vec<Vec<String>>) -> Result<Vec<Tag>, Error> {
    tags.into_iter()
        .map(|parts| Tag::parse(parts).map_err(|e| Error::nostr(e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::RelayList;
    use crate::test_utils::{relay_url, test_pool, MockNetwork};
    use pretty_assertions::assert_eq;

    const ALICE: &str = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";

    fn directory() -> Nip05Directory {
        serde_json::from_str(&format!(
            r#"{{"names":{{"alice":"{ALICE}","_":"{ALICE}","bob":"nothex"}}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn directory_lookups_work_both_ways() {
        let directory = directory();
        let alice = PublicKey::from_hex(ALICE).unwrap();

        assert_eq!(directory.pubkey_for("alice"), Some(alice));
        assert_eq!(directory.pubkey_for("Alice"), Some(alice));
        assert_eq!(directory.pubkey_for("bob"), None);
        assert_eq!(directory.pubkey_for("carol"), None);
        assert_eq!(directory.name_for(&alice), Some("_"));
        assert_eq!(directory.name_for(&Keys::generate().public_key()), None);
    }

    #[test]
    fn name_length_is_checked_in_characters() {
        assert!(validate_nip05_name("ab").is_ok());
        assert!(validate_nip05_name("中文名").is_ok());
        assert!(validate_nip05_name("a").is_err());
        assert!(validate_nip05_name("abcdefghijklmnop").is_err());
    }

    #[test]
    fn onboarding_relay_list_marks_directions() {
        let keys = Keys::generate();
        let defaults = vec![
            relay_url("wss://relay.nostrzh.org/"),
            relay_url("wss://relay.damus.io/"),
            relay_url("wss://nos.lol/"),
        ];
        let events = OnboardingEvents::new(&keys, "wss://relay.nostrzh.org/", &defaults).unwrap();

        assert_eq!(events.contacts.kind, Kind::ContactList);
        assert!(events.contacts.tags.is_empty());

        let list = RelayList::from_event(&events.relay_list);
        assert_eq!(
            list.read,
            vec![relay_url("wss://relay.damus.io/"), relay_url("wss://nos.lol/")]
        );
        assert_eq!(
            list.write,
            vec![
                relay_url("wss://relay.nostrzh.org/"),
                relay_url("wss://relay.damus.io/")
            ]
        );

        assert_eq!(events.favorite_relays.kind, favorite_relays_kind());
        let favorite: Vec<Vec<String>> = events
            .favorite_relays
            .tags
            .iter()
            .map(|tag| tag.as_slice().to_vec())
            .collect();
        assert_eq!(
            favorite,
            vec![vec!["relay".to_string(), "wss://relay.nostrzh.org/".to_string()]]
        );
    }

    #[tokio::test]
    async fn onboarding_events_are_published_together() {
        let network = MockNetwork::new();
        let home = network.add_relay("wss://home.example");
        let pool = test_pool(&network);

        let events = OnboardingEvents::new(
            &Keys::generate(),
            "wss://home.example",
            &[relay_url("wss://home.example")],
        )
        .unwrap();
        let receipts = events
            .publish(&pool, &[relay_url("wss://home.example")])
            .await
            .unwrap();

        assert_eq!(receipts.len(), 3);
        assert_eq!(home.published().len(), 3);
    }

    fn decode_authorization(header: &str) -> Event {
        let encoded = header.strip_prefix("Nostr ").unwrap();
        let json = BASE64_STANDARD.decode(encoded).unwrap();
        Event::from_json(json).unwrap()
    }

    fn tag_value(event: &Event, name: &str) -> Option<String> {
        event
            .tags
            .iter()
            .map(|tag| tag.as_slice())
            .find(|parts| parts.first().map(String::as_str) == Some(name))
            .and_then(|parts| parts.get(1).cloned())
    }

    #[test]
    fn nip98_authorization_signs_url_method_and_payload() {
        let keys = Keys::generate();
        let body = r#"{"name":"alice"}"#;
        let header = nip98_authorization(
            &keys,
            "https://api.nostrzh.org/v1/nip05/register",
            HttpMethod::POST,
            body,
            0,
        )
        .unwrap();

        let event = decode_authorization(&header);
        assert!(event.verify().is_ok());
        assert_eq!(event.kind, Kind::HttpAuth);
        assert_eq!(event.pubkey, keys.public_key());
        assert_eq!(
            tag_value(&event, "u").as_deref(),
            Some("https://api.nostrzh.org/v1/nip05/register")
        );
        assert_eq!(tag_value(&event, "method").as_deref(), Some("POST"));
        assert_eq!(
            tag_value(&event, "payload"),
            Some(Sha256Hash::hash(body.as_bytes()).to_string())
        );
        assert_eq!(tag_value(&event, "nonce"), None);
    }

    #[test]
    fn nip98_authorization_mines_requested_difficulty() {
        let header = nip98_authorization(
            &Keys::generate(),
            "https://api.nostrzh.org/v1/users/join",
            HttpMethod::POST,
            "{}",
            8,
        )
        .unwrap();

        let event = decode_authorization(&header);
        let nonce = event
            .tags
            .iter()
            .map(|tag| tag.as_slice().to_vec())
            .find(|parts| parts.first().map(String::as_str) == Some("nonce"))
            .unwrap();
        assert_eq!(nonce.get(2).map(String::as_str), Some("8"));
        assert_eq!(event.id.as_bytes()[0], 0);
    }

    #[test]
    fn quiz_session_reads_backend_field_names() {
        let session: QuizSession = serde_json::from_str(
            r#"{"sessionId":"s1","questions":[{"question":"q","options":["a","b"]}],
                "config":{"questionsPerSession":1,"passingScore":1,"sessionTTLMinutes":30}}"#,
        )
        .unwrap();
        assert_eq!(session.session_id, "s1");
        assert_eq!(session.questions[0].options.len(), 2);
        assert_eq!(session.config.session_ttl_minutes, 30);
    }

    #[tokio::test]
    async fn quiz_answers_are_checked_before_sending() {
        let client = CommunityClient::new(&CommunitySettings {
            backend_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        })
        .unwrap();
        let session = QuizSession {
            session_id: "s1".to_string(),
            questions: vec![QuizQuestion {
                question: "q".to_string(),
                options: vec!["a".to_string(), "b".to_string()],
            }],
            config: QuizConfig::default(),
        };

        let short = client.submit_quiz(&session, &[]).await.unwrap_err();
        assert!(matches!(short, Error::InvalidInput { .. }));
        let out_of_range = client.submit_quiz(&session, &[2]).await.unwrap_err();
        assert!(matches!(out_of_range, Error::InvalidInput { .. }));
    }

    #[test]
    fn profile_links_use_hex() {
        let alice = PublicKey::from_hex(ALICE).unwrap();
        assert_eq!(
            profile_url(&alice),
            format!("https://jumble.social/users/{ALICE}")
        );
    }
}
