use serde::{Deserialize, Serialize};

// --- Verification & registration ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySend {
    pub agent_name: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyConfirm {
    pub agent_name: String,
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgent {
    pub name: String,
    pub public_key: String,
    pub owner_email: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AgentLookup {
    pub name: String,
    pub public_key: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateKey {
    pub new_public_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverAgent {
    pub email: String,
    pub new_public_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeAgent {
    pub broadcast_signature: String,
}

// --- Contacts ---

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContactTarget {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct RequestContact {
    pub to: ContactTarget,
    #[serde(default)]
    pub greeting: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestResult {
    pub to: String,
    pub ok: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PendingContact {
    pub from: String,
    pub requester_email: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContactEntry {
    pub agent: String,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub since: String,
    pub online: bool,
    pub last_seen: Option<String>,
    pub key_updated_at: Option<String>,
    pub recovery_in_progress: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContactDescriptor {
    pub agent: String,
    pub public_key: String,
    pub endpoint: Option<String>,
}

// --- Presence ---

#[derive(Debug, Deserialize)]
pub struct PresenceUpdate {
    #[serde(default)]
    pub endpoint: Option<String>,
}

// --- Groups ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    #[serde(default)]
    pub members_can_invite: Option<bool>,
    #[serde(default)]
    pub members_can_send: Option<bool>,
    #[serde(default)]
    pub max_members: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroup {
    pub name: String,
    #[serde(default)]
    pub settings: Option<GroupSettings>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub status: String,
    pub members_can_invite: bool,
    pub members_can_send: bool,
    pub max_members: i64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dissolved_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InviteMember {
    pub agent: String,
    #[serde(default)]
    pub greeting: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOwnership {
    pub new_owner: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub agent: String,
    pub role: String,
    pub joined_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GroupInvitation {
    pub group_id: String,
    pub group_name: String,
    pub invited_by: Option<String>,
    pub greeting: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChange {
    pub agent: String,
    pub action: String,
    pub by: Option<String>,
    pub timestamp: String,
}

// --- Admin & broadcasts ---

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AdminKeyEntry {
    pub agent: String,
    pub admin_public_key: String,
    pub added_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBroadcast {
    #[serde(rename = "type")]
    pub broadcast_type: String,
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub broadcast_type: String,
    pub payload: String,
    pub sender: String,
    pub signature: String,
    pub created_at: String,
}
