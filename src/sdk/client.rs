//! The SDK facade: one `AgentClient` owns the identity keypair, talks to
//! its communities' relays over signed requests, and delivers envelopes
//! directly to peers. All user-visible state lives behind this type.

use chrono::Utc;
use ed25519_dalek::SigningKey;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::auth;
use crate::crypto;
use crate::models::{ContactEntry, GroupMember};
use crate::sdk::cache::{CachedContact, ContactCache};
use crate::sdk::community::{ApiResult, CommunityManager, CommunityStatus};
use crate::sdk::envelope::{self, Envelope};
use crate::sdk::error::SdkError;
use crate::sdk::retry::{DeliveryState, DeliveryStatus, QueuedMessage, RetryQueue};

/// At most this many group deliveries run at once.
const GROUP_FANOUT_CONCURRENCY: usize = 10;

/// Hard cap on any single direct delivery.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Group member lists go stale after this.
const MEMBER_CACHE_TTL: Duration = Duration::from_secs(60);

/// Group message ids remembered for dedup.
const SEEN_IDS_CAP: usize = 1000;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(600);
const RETRY_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CommunitySpec {
    pub name: String,
    pub primary: String,
    pub failover: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub communities: Vec<CommunitySpec>,
    /// Our own delivery endpoint, advertised on every heartbeat.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Queued,
    Failed,
}

impl SendOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SendOutcome::Delivered => "delivered",
            SendOutcome::Queued => "queued",
            SendOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendReport {
    pub message_id: String,
    pub status: SendOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GroupSendReport {
    pub message_id: String,
    pub delivered: Vec<String>,
    pub queued: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub sender: String,
    pub payload: serde_json::Value,
    pub verified: bool,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Message(ReceivedMessage),
    Delivery(DeliveryStatus),
    Community(CommunityStatus),
}

enum DeliverError {
    Retryable(String),
    Fatal(String),
}

/// Bounded FIFO of group message ids already processed.
struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    fn new() -> Self {
        SeenIds {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// True when the id was not seen before.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > SEEN_IDS_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

struct MemberCacheEntry {
    members: Vec<MemberKey>,
    fetched_at: Instant,
}

#[derive(Debug, Clone)]
struct MemberKey {
    agent: String,
    public_key: Option<String>,
}

pub struct AgentClient {
    name: String,
    signing_key: SigningKey,
    endpoint: Option<String>,
    http: reqwest::Client,
    pub communities: Arc<CommunityManager>,
    default_community: String,
    cache: Mutex<ContactCache>,
    pub retry: Arc<RetryQueue>,
    pub events: broadcast::Sender<AgentEvent>,
    delivery_reports: Mutex<HashMap<String, DeliveryStatus>>,
    seen_group_ids: Mutex<SeenIds>,
    member_cache: Mutex<HashMap<String, MemberCacheEntry>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl AgentClient {
    pub fn new(config: AgentConfig, signing_key: SigningKey) -> Result<Self, SdkError> {
        let Some(first) = config.communities.first() else {
            return Err(SdkError::UnknownCommunity(
                "at least one community is required".into(),
            ));
        };
        let default_community = first.name.clone();

        let communities = Arc::new(CommunityManager::default());
        for spec in &config.communities {
            communities.add_community(&spec.name, &spec.primary, spec.failover.as_deref());
        }

        let cache = ContactCache::new(&config.data_dir, &default_community)?;
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        let (events, _) = broadcast::channel(256);

        Ok(AgentClient {
            name: config.name,
            signing_key,
            endpoint: config.endpoint,
            http,
            communities,
            default_community,
            cache: Mutex::new(cache),
            retry: Arc::new(RetryQueue::default()),
            events,
            delivery_reports: Mutex::new(HashMap::new()),
            seen_group_ids: Mutex::new(SeenIds::new()),
            member_cache: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn delivery_report(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.delivery_reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_id)
            .cloned()
    }

    /// `name@host` routes to the community whose relay lives at `host`;
    /// a bare name goes to the default community.
    fn resolve_recipient(&self, to: &str) -> Result<(String, String), SdkError> {
        match to.split_once('@') {
            Some((name, host)) => {
                let community = self
                    .communities
                    .community_by_hostname(host)
                    .ok_or_else(|| SdkError::UnknownCommunity(host.to_string()))?;
                Ok((name.to_string(), community))
            }
            None => Ok((to.to_string(), self.default_community.clone())),
        }
    }

    /// One signed request against a relay base URL. Transport failures come
    /// back as `status: 0` so the community manager can count them.
    async fn signed_api(
        &self,
        base: String,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResult<serde_json::Value>, SdkError> {
        let timestamp = Utc::now().to_rfc3339();
        let body_bytes = match &body {
            Some(v) => serde_json::to_vec(v)
                .map_err(|e| SdkError::InvalidEnvelope(format!("body does not serialize: {e}")))?,
            None => Vec::new(),
        };
        let body_hash = auth::body_sha256_hex(&body_bytes);
        let canonical = auth::canonical_string(method.as_str(), path, &timestamp, &body_hash);
        let signature = crypto::sign_detached(&self.signing_key, canonical.as_bytes());

        let mut request = self
            .http
            .request(method, format!("{base}{path}"))
            .header("Authorization", auth::format_auth_header(&self.name, &signature))
            .header("X-Timestamp", timestamp.as_str());
        if body.is_some() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_bytes);
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let value = resp.json::<serde_json::Value>().await.ok();
                Ok(ApiResult {
                    ok: (200..300).contains(&status),
                    status,
                    value,
                })
            }
            Err(_) => Ok(ApiResult {
                ok: false,
                status: 0,
                value: None,
            }),
        }
    }

    async fn fetch_contacts(&self, community: &str) -> Result<Vec<ContactEntry>, SdkError> {
        let result = self
            .communities
            .call_api(community, move |base| async move {
                self.signed_api(base, Method::GET, "/contacts", None).await
            })
            .await?;
        if !result.ok {
            return Err(SdkError::Relay {
                status: result.status,
                message: "contact list fetch failed".into(),
            });
        }
        let entries: Vec<ContactEntry> = result
            .value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        Ok(entries)
    }

    /// Pull the relay's contact list and persist it as this community's
    /// cache file.
    pub async fn refresh_contacts(&self, community: &str) -> Result<Vec<ContactEntry>, SdkError> {
        let entries = self.fetch_contacts(community).await?;
        let cached: Vec<CachedContact> = entries
            .iter()
            .map(|e| CachedContact {
                username: e.agent.clone(),
                public_key: Some(e.public_key.clone()),
                endpoint: e.endpoint.clone(),
                added_at: e.since.clone(),
                online: e.online,
                last_seen: e.last_seen.clone(),
                community: community.to_string(),
            })
            .collect();
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .store(community, cached)?;
        Ok(entries)
    }

    /// Presence check via the relay's contact listing (which also refreshes
    /// the local cache as a side effect).
    async fn check_presence(
        &self,
        community: &str,
        peer: &str,
    ) -> Result<Option<ContactEntry>, SdkError> {
        let entries = self.refresh_contacts(community).await?;
        Ok(entries.into_iter().find(|e| e.agent == peer))
    }

    fn cached_contact(&self, community: &str, peer: &str) -> Option<CachedContact> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(community, peer)
    }

    fn record_report(&self, message_id: &str, status: DeliveryStatus) {
        self.delivery_reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_id.to_string(), status);
    }

    fn failed(&self, message_id: String, error: SdkError) -> SendReport {
        self.record_report(
            &message_id,
            DeliveryStatus {
                message_id: message_id.clone(),
                status: DeliveryState::Failed,
                attempts: 0,
                at: Utc::now().to_rfc3339(),
            },
        );
        SendReport {
            message_id,
            status: SendOutcome::Failed,
            error: Some(error.to_string()),
        }
    }

    /// Direct, presence-gated send. Offline or transiently failing peers go
    /// to the retry queue; everything else resolves immediately.
    pub async fn send(&self, to: &str, payload: serde_json::Value) -> SendReport {
        let message_id = uuid::Uuid::new_v4().to_string();

        let (peer, community) = match self.resolve_recipient(to) {
            Ok(x) => x,
            Err(e) => return self.failed(message_id, e),
        };

        // Contact cache is the source of keys; refresh once on a miss.
        let mut contact = self.cached_contact(&community, &peer);
        if contact.as_ref().and_then(|c| c.public_key.clone()).is_none() {
            let _ = self.refresh_contacts(&community).await;
            contact = self.cached_contact(&community, &peer);
        }
        let Some(public_key) = contact.as_ref().and_then(|c| c.public_key.clone()) else {
            return self.failed(message_id, SdkError::NotAContact(peer));
        };

        let envelope = match self.seal_direct(&message_id, &peer, &public_key, &payload) {
            Ok(e) => e,
            Err(e) => return self.failed(message_id, e),
        };

        let presence = self.check_presence(&community, &peer).await.ok().flatten();
        let online = presence.as_ref().is_some_and(|p| p.online);
        if !online {
            return self.enqueue_or_fail(envelope, None);
        }

        let endpoint = presence
            .as_ref()
            .and_then(|p| p.endpoint.clone())
            .or_else(|| contact.as_ref().and_then(|c| c.endpoint.clone()));
        let Some(endpoint) = endpoint else {
            return self.failed(message_id, SdkError::NoEndpoint(peer));
        };

        match self.deliver(&endpoint, &envelope).await {
            Ok(()) => {
                self.record_report(
                    &message_id,
                    DeliveryStatus {
                        message_id: message_id.clone(),
                        status: DeliveryState::Delivered,
                        attempts: 0,
                        at: Utc::now().to_rfc3339(),
                    },
                );
                SendReport {
                    message_id,
                    status: SendOutcome::Delivered,
                    error: None,
                }
            }
            Err(DeliverError::Retryable(_)) => self.enqueue_or_fail(envelope, None),
            Err(DeliverError::Fatal(msg)) => {
                self.failed(message_id, SdkError::DeliveryFailed(msg))
            }
        }
    }

    fn seal_direct(
        &self,
        message_id: &str,
        peer: &str,
        public_key_b64: &str,
        payload: &serde_json::Value,
    ) -> Result<Envelope, SdkError> {
        let peer_key = crypto::verifying_key_from_spki_b64(public_key_b64)?;
        let shared = crypto::derive_shared_key(&self.signing_key, &peer_key, &self.name, peer);
        envelope::seal(
            "direct",
            message_id,
            &self.name,
            peer,
            None,
            &shared,
            payload,
            &self.signing_key,
        )
    }

    fn enqueue_or_fail(&self, envelope: Envelope, group_id: Option<String>) -> SendReport {
        let message_id = envelope.message_id.clone();
        if self.retry.enqueue(envelope, group_id) {
            SendReport {
                message_id,
                status: SendOutcome::Queued,
                error: None,
            }
        } else {
            self.failed(message_id, SdkError::QueueFull)
        }
    }

    /// POST the envelope to the peer's endpoint. Network errors and 5xx are
    /// the only retryable failures.
    async fn deliver(&self, endpoint: &str, envelope: &Envelope) -> Result<(), DeliverError> {
        let request = self.http.post(endpoint).json(envelope);
        let sent = tokio::time::timeout(DELIVERY_TIMEOUT, request.send()).await;
        match sent {
            Err(_) => Err(DeliverError::Retryable("delivery timed out".into())),
            Ok(Err(e)) => Err(DeliverError::Retryable(e.to_string())),
            Ok(Ok(resp)) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(())
                } else if status.is_server_error() {
                    Err(DeliverError::Retryable(format!("server error {status}")))
                } else {
                    Err(DeliverError::Fatal(format!("rejected with {status}")))
                }
            }
        }
    }

    /// Retry-queue send hook: presence is re-checked each attempt, so the
    /// queue stays gated on the recipient coming back online.
    async fn retry_deliver(&self, entry: QueuedMessage) -> Result<(), SdkError> {
        let (peer, community) = self.resolve_recipient(&entry.recipient)?;
        let presence = self.check_presence(&community, &peer).await?;
        let Some(presence) = presence else {
            return Err(SdkError::DeliveryFailed("recipient unknown".into()));
        };
        if !presence.online {
            return Err(SdkError::DeliveryFailed("recipient offline".into()));
        }
        let endpoint = presence
            .endpoint
            .clone()
            .or_else(|| self.cached_contact(&community, &peer).and_then(|c| c.endpoint))
            .ok_or_else(|| SdkError::NoEndpoint(peer.clone()))?;
        match self.deliver(&endpoint, &entry.payload).await {
            Ok(()) => Ok(()),
            Err(DeliverError::Retryable(msg)) | Err(DeliverError::Fatal(msg)) => {
                Err(SdkError::DeliveryFailed(msg))
            }
        }
    }

    /// Validate and decrypt an inbound envelope. Returns `None` for a group
    /// message already seen under its id.
    pub async fn receive_message(
        &self,
        envelope: Envelope,
    ) -> Result<Option<ReceivedMessage>, SdkError> {
        if envelope.version != envelope::ENVELOPE_VERSION {
            return Err(SdkError::InvalidEnvelope("unsupported version".into()));
        }
        if envelope.recipient != self.name {
            return Err(SdkError::InvalidEnvelope("not addressed to this agent".into()));
        }
        if !envelope.timestamp_in_window(Utc::now()) {
            return Err(SdkError::InvalidEnvelope("timestamp outside window".into()));
        }

        let is_group = envelope.kind == "group";
        if !is_group && envelope.kind != "direct" {
            return Err(SdkError::InvalidEnvelope("unknown type".into()));
        }
        let group_id = match (is_group, envelope.group_id.clone()) {
            (true, Some(id)) => Some(id),
            (true, None) => {
                return Err(SdkError::InvalidEnvelope("group message without groupId".into()));
            }
            (false, Some(_)) => {
                return Err(SdkError::InvalidEnvelope("direct message with groupId".into()));
            }
            (false, None) => None,
        };

        let community = self.default_community.clone();
        let sender = envelope.sender.clone();

        // Sender key: contacts for direct messages; the member cache (with
        // one refresh) for groups.
        let sender_key_b64 = if let Some(group_id) = &group_id {
            let mut key = self.member_key(&community, group_id, &sender, false).await?;
            if key.is_none() {
                key = self.member_key(&community, group_id, &sender, true).await?;
            }
            let Some(key) = key else {
                return Err(SdkError::InvalidEnvelope(
                    "sender is not an active group member".into(),
                ));
            };
            key
        } else {
            let contact = self.cached_contact(&community, &sender);
            let Some(key) = contact.and_then(|c| c.public_key) else {
                return Err(SdkError::NotAContact(sender));
            };
            key
        };

        let sender_key = crypto::verifying_key_from_spki_b64(&sender_key_b64)?;
        if !envelope.verify_signature(&sender_key) {
            return Err(SdkError::InvalidEnvelope("signature verification failed".into()));
        }

        if group_id.is_some() {
            let fresh = self
                .seen_group_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(&envelope.message_id);
            if !fresh {
                return Ok(None);
            }
        }

        let shared = crypto::derive_shared_key(&self.signing_key, &sender_key, &self.name, &sender);
        let payload = envelope::open(&envelope, &shared)?;

        let message = ReceivedMessage {
            sender,
            payload,
            verified: true,
            group_id,
        };
        let _ = self.events.send(AgentEvent::Message(message.clone()));
        Ok(Some(message))
    }

    /// Public key of an active member of the group, or None. `force` skips
    /// the 60-second member cache.
    async fn member_key(
        &self,
        community: &str,
        group_id: &str,
        agent: &str,
        force: bool,
    ) -> Result<Option<String>, SdkError> {
        let members = self.group_members(community, group_id, force).await?;
        Ok(members
            .iter()
            .find(|m| m.agent == agent)
            .and_then(|m| m.public_key.clone()))
    }

    async fn group_members(
        &self,
        community: &str,
        group_id: &str,
        force: bool,
    ) -> Result<Vec<MemberKey>, SdkError> {
        if !force {
            let cache = self.member_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(group_id)
                && entry.fetched_at.elapsed() < MEMBER_CACHE_TTL
            {
                return Ok(entry.members.clone());
            }
        }

        let path = format!("/groups/{group_id}/members");
        let path = path.as_str();
        let result = self
            .communities
            .call_api(community, move |base| async move {
                self.signed_api(base, Method::GET, path, None).await
            })
            .await?;
        if !result.ok {
            return Err(SdkError::Relay {
                status: result.status,
                message: "member list fetch failed".into(),
            });
        }
        let members: Vec<GroupMember> = result
            .value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        // Keys come from the contact cache when we know the member, and the
        // registry lookup otherwise.
        let mut resolved = Vec::with_capacity(members.len());
        for member in members {
            let mut public_key = self
                .cached_contact(community, &member.agent)
                .and_then(|c| c.public_key);
            if public_key.is_none() && member.agent != self.name {
                public_key = self.lookup_public_key(community, &member.agent).await;
            }
            resolved.push(MemberKey {
                agent: member.agent,
                public_key,
            });
        }

        self.member_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                group_id.to_string(),
                MemberCacheEntry {
                    members: resolved.clone(),
                    fetched_at: Instant::now(),
                },
            );
        Ok(resolved)
    }

    async fn lookup_public_key(&self, community: &str, agent: &str) -> Option<String> {
        let path = format!("/registry/agents/{agent}");
        let path = path.as_str();
        let result = self
            .communities
            .call_api(community, move |base| async move {
                self.signed_api(base, Method::GET, path, None).await
            })
            .await
            .ok()?;
        result
            .value
            .and_then(|v| v.get("publicKey").and_then(|k| k.as_str().map(String::from)))
    }

    /// Fan the payload out to every active member except ourselves: one
    /// distinct envelope per recipient under a shared message id, bounded
    /// concurrency, 5-second cap per delivery.
    pub async fn send_to_group(
        &self,
        group_id: &str,
        payload: serde_json::Value,
    ) -> Result<GroupSendReport, SdkError> {
        let community = self.default_community.clone();
        let message_id = uuid::Uuid::new_v4().to_string();

        let members = self.group_members(&community, group_id, false).await?;
        let recipients: Vec<MemberKey> = members
            .into_iter()
            .filter(|m| m.agent != self.name)
            .collect();

        // One presence snapshot for the whole fan-out.
        let contacts = self.refresh_contacts(&community).await.unwrap_or_default();
        let presence: HashMap<String, ContactEntry> = contacts
            .into_iter()
            .map(|e| (e.agent.clone(), e))
            .collect();

        let outcomes: Vec<(String, SendOutcome)> = stream::iter(recipients)
            .map(|member| {
                let presence = &presence;
                let message_id = &message_id;
                let payload = &payload;
                async move {
                    let outcome = self
                        .send_group_member(group_id, message_id, &member, presence, payload)
                        .await;
                    (member.agent.clone(), outcome)
                }
            })
            .buffer_unordered(GROUP_FANOUT_CONCURRENCY)
            .collect()
            .await;

        let mut report = GroupSendReport {
            message_id,
            delivered: Vec::new(),
            queued: Vec::new(),
            failed: Vec::new(),
        };
        for (agent, outcome) in outcomes {
            match outcome {
                SendOutcome::Delivered => report.delivered.push(agent),
                SendOutcome::Queued => report.queued.push(agent),
                SendOutcome::Failed => report.failed.push(agent),
            }
        }
        Ok(report)
    }

    async fn send_group_member(
        &self,
        group_id: &str,
        message_id: &str,
        member: &MemberKey,
        presence: &HashMap<String, ContactEntry>,
        payload: &serde_json::Value,
    ) -> SendOutcome {
        let Some(public_key_b64) = member.public_key.as_deref() else {
            return SendOutcome::Failed;
        };
        let Ok(peer_key) = crypto::verifying_key_from_spki_b64(public_key_b64) else {
            return SendOutcome::Failed;
        };

        let shared =
            crypto::derive_shared_key(&self.signing_key, &peer_key, &self.name, &member.agent);
        let Ok(envelope) = envelope::seal(
            "group",
            message_id,
            &self.name,
            &member.agent,
            Some(group_id),
            &shared,
            payload,
            &self.signing_key,
        ) else {
            return SendOutcome::Failed;
        };

        let entry = presence.get(&member.agent);
        let online = entry.is_some_and(|e| e.online);
        if !online {
            return if self.retry.enqueue(envelope, Some(group_id.to_string())) {
                SendOutcome::Queued
            } else {
                SendOutcome::Failed
            };
        }

        let endpoint = entry.and_then(|e| e.endpoint.clone());
        let Some(endpoint) = endpoint else {
            return SendOutcome::Failed;
        };

        match self.deliver(&endpoint, &envelope).await {
            Ok(()) => SendOutcome::Delivered,
            Err(DeliverError::Retryable(_)) => {
                if self.retry.enqueue(envelope, Some(group_id.to_string())) {
                    SendOutcome::Queued
                } else {
                    SendOutcome::Failed
                }
            }
            Err(DeliverError::Fatal(_)) => SendOutcome::Failed,
        }
    }

    /// Heartbeat one community: `PUT /presence` with our endpoint.
    pub async fn heartbeat(&self, community: &str) -> Result<(), SdkError> {
        let body = match &self.endpoint {
            Some(endpoint) => serde_json::json!({ "endpoint": endpoint }),
            None => serde_json::json!({}),
        };
        let result = self
            .communities
            .call_api(community, move |base| async move {
                self.signed_api(base, Method::PUT, "/presence", Some(body)).await
            })
            .await?;
        if result.ok {
            Ok(())
        } else {
            Err(SdkError::Relay {
                status: result.status,
                message: "heartbeat failed".into(),
            })
        }
    }

    /// Fire every community's heartbeat in parallel; individual failures
    /// are tolerated (all-settled).
    pub async fn send_all_heartbeats(&self) {
        let names = self.communities.community_names();
        let results = futures::future::join_all(
            names.iter().map(|name| self.heartbeat(name)),
        )
        .await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                eprintln!("⚠️  Heartbeat to {name} failed: {e}");
            }
        }
    }

    /// Spawn the background collaborators: heartbeat timers, the retry
    /// ticker, and the event forwarders that keep the delivery-report map
    /// current.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        // Heartbeats, one timer per community.
        for community in self.communities.community_names() {
            let client = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    interval.tick().await;
                    if client.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = client.heartbeat(&community).await {
                        eprintln!("⚠️  Heartbeat to {community} failed: {e}");
                    }
                }
            }));
        }

        // Retry ticker.
        {
            let client = Arc::clone(self);
            let queue = Arc::clone(&self.retry);
            tasks.push(tokio::spawn(async move {
                let sender = {
                    let client = Arc::clone(&client);
                    move |entry: QueuedMessage| {
                        let client = Arc::clone(&client);
                        async move { client.retry_deliver(entry).await }
                    }
                };
                queue.run(RETRY_TICK, sender).await;
            }));
        }

        // Forward retry-queue delivery events into the report map and the
        // public event stream.
        {
            let client = Arc::clone(self);
            let mut receiver = self.retry.events.subscribe();
            tasks.push(tokio::spawn(async move {
                while let Ok(status) = receiver.recv().await {
                    client.record_report(&status.message_id, status.clone());
                    let _ = client.events.send(AgentEvent::Delivery(status));
                }
            }));
        }

        // Forward community status changes.
        {
            let client = Arc::clone(self);
            let mut receiver = self.communities.events.subscribe();
            tasks.push(tokio::spawn(async move {
                while let Ok(status) = receiver.recv().await {
                    let _ = client.events.send(AgentEvent::Community(status));
                }
            }));
        }
    }

    /// Cooperative teardown: stop timers, stop the retry queue, flush the
    /// cache. In-flight deliveries finish under their own 5-second cap.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.retry.stop();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        if let Err(e) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).flush() {
            eprintln!("⚠️  Contact cache flush failed: {e}");
        }
    }
}
