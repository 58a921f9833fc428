//! Per-community federation state: which relay is active, how many calls in
//! a row have failed, and when to give up on the primary.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::sdk::error::SdkError;

pub const DEFAULT_FAILOVER_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRelay {
    Primary,
    Failover,
}

/// Outcome of one relay API call. `status` 0 means the request never got an
/// HTTP response (network failure).
#[derive(Debug, Clone)]
pub struct ApiResult<T> {
    pub ok: bool,
    pub status: u16,
    pub value: Option<T>,
}

#[derive(Debug, Clone)]
pub struct CommunityStatus {
    pub community: String,
    pub status: &'static str,
}

#[derive(Debug, Clone)]
pub struct CommunityState {
    pub name: String,
    pub primary: String,
    pub failover: Option<String>,
    pub active: ActiveRelay,
    pub consecutive_failures: u32,
    /// Until the first success, failures accumulate separately so a relay
    /// that is down at startup fails over promptly instead of never.
    pub first_success_seen: bool,
    pub startup_failures: u32,
}

impl CommunityState {
    pub fn active_url(&self) -> &str {
        match self.active {
            ActiveRelay::Primary => &self.primary,
            ActiveRelay::Failover => self.failover.as_deref().unwrap_or(&self.primary),
        }
    }
}

pub struct CommunityManager {
    communities: Mutex<HashMap<String, CommunityState>>,
    failover_threshold: u32,
    pub events: broadcast::Sender<CommunityStatus>,
}

impl Default for CommunityManager {
    fn default() -> Self {
        Self::new(DEFAULT_FAILOVER_THRESHOLD)
    }
}

impl CommunityManager {
    pub fn new(failover_threshold: u32) -> Self {
        let (events, _) = broadcast::channel(64);
        CommunityManager {
            communities: Mutex::new(HashMap::new()),
            failover_threshold,
            events,
        }
    }

    pub fn add_community(&self, name: &str, primary: &str, failover: Option<&str>) {
        let mut map = self.communities.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(
            name.to_string(),
            CommunityState {
                name: name.to_string(),
                primary: primary.trim_end_matches('/').to_string(),
                failover: failover.map(|f| f.trim_end_matches('/').to_string()),
                active: ActiveRelay::Primary,
                consecutive_failures: 0,
                first_success_seen: false,
                startup_failures: 0,
            },
        );
    }

    pub fn community_names(&self) -> Vec<String> {
        let map = self.communities.lock().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }

    pub fn state(&self, name: &str) -> Option<CommunityState> {
        let map = self.communities.lock().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }

    pub fn active_url(&self, name: &str) -> Result<String, SdkError> {
        self.state(name)
            .map(|s| s.active_url().to_string())
            .ok_or_else(|| SdkError::UnknownCommunity(name.to_string()))
    }

    /// Route a qualified agent name's host to the community whose primary or
    /// failover relay lives there.
    pub fn community_by_hostname(&self, host: &str) -> Option<String> {
        let map = self.communities.lock().unwrap_or_else(|e| e.into_inner());
        map.values()
            .find(|s| {
                url_host(&s.primary).as_deref() == Some(host)
                    || s
                        .failover
                        .as_deref()
                        .and_then(url_host)
                        .as_deref()
                        == Some(host)
            })
            .map(|s| s.name.clone())
    }

    /// Run one API call against the community's active relay and update the
    /// failure accounting from its outcome: success resets, network/5xx
    /// counts, 4xx is the caller's problem, and errors count then re-raise.
    pub async fn call_api<T, F, Fut>(&self, community: &str, call: F) -> Result<ApiResult<T>, SdkError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<ApiResult<T>, SdkError>>,
    {
        let base = self.active_url(community)?;
        match call(base).await {
            Ok(result) => {
                if result.ok {
                    self.record_success(community);
                } else if result.status == 0 || result.status >= 500 {
                    self.record_failure(community);
                }
                Ok(result)
            }
            Err(err) => {
                self.record_failure(community);
                Err(err)
            }
        }
    }

    fn record_success(&self, community: &str) {
        let mut map = self.communities.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = map.get_mut(community) {
            state.consecutive_failures = 0;
            state.startup_failures = 0;
            state.first_success_seen = true;
        }
    }

    fn record_failure(&self, community: &str) {
        let mut map = self.communities.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = map.get_mut(community) else {
            return;
        };

        let tripped = if state.first_success_seen {
            state.consecutive_failures += 1;
            state.consecutive_failures >= self.failover_threshold
        } else {
            state.startup_failures += 1;
            if state.startup_failures >= self.failover_threshold {
                // Grace period over: treat the relay as established-and-down.
                state.first_success_seen = true;
                true
            } else {
                false
            }
        };
        if !tripped {
            return;
        }

        state.consecutive_failures = 0;
        let status = if state.active == ActiveRelay::Primary && state.failover.is_some() {
            state.active = ActiveRelay::Failover;
            "failover"
        } else {
            "offline"
        };
        let _ = self.events.send(CommunityStatus {
            community: community.to_string(),
            status,
        });
    }
}

fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
}
