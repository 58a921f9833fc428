use crate::db::Db;
use crate::error::ApiError;
use crate::models::*;
use crate::routes::{AuthHeaders, SignedJson};
use chrono::{DateTime, Utc};
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use rusqlite::{Connection, OptionalExtension, params};

/// Hard ceiling on group size; `maxMembers` settings clamp to it.
const MAX_MEMBERS_CEILING: i64 = 50;

/// An agent may hold this many active memberships across all groups.
const MEMBERSHIPS_PER_AGENT: i64 = 100;

/// Days of owner silence before an admin may dissolve over their head.
const OWNER_ABSENCE_DAYS: i64 = 7;

fn load_active_group(conn: &Connection, group_id: &str) -> Result<GroupInfo, ApiError> {
    let group: Option<GroupInfo> = conn
        .query_row(
            "SELECT id, name, owner, status, members_can_invite, members_can_send,
                    max_members, created_at, dissolved_at
             FROM groups WHERE id = ?1",
            params![group_id],
            |r| {
                Ok(GroupInfo {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    owner: r.get(2)?,
                    status: r.get(3)?,
                    members_can_invite: r.get::<_, i64>(4)? != 0,
                    members_can_send: r.get::<_, i64>(5)? != 0,
                    max_members: r.get(6)?,
                    created_at: r.get(7)?,
                    dissolved_at: r.get(8)?,
                })
            },
        )
        .optional()?;
    match group {
        Some(g) if g.status == "active" => Ok(g),
        _ => Err(ApiError::not_found("No such group")),
    }
}

/// Role of the caller's active membership, if any.
fn active_role(conn: &Connection, group_id: &str, agent: &str) -> Result<Option<String>, ApiError> {
    Ok(conn
        .query_row(
            "SELECT role FROM group_memberships
             WHERE group_id = ?1 AND agent = ?2 AND status = 'active'",
            params![group_id, agent],
            |r| r.get(0),
        )
        .optional()?)
}

fn active_membership_count(conn: &Connection, agent: &str) -> Result<i64, ApiError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM group_memberships WHERE agent = ?1 AND status = 'active'",
        params![agent],
        |r| r.get(0),
    )?)
}

#[post("/groups", format = "json", data = "<body>")]
pub fn create_group(
    db: &State<Db>,
    headers: AuthHeaders,
    body: SignedJson<CreateGroup>,
) -> Result<Json<GroupInfo>, ApiError> {
    let mut conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let owner = headers.authenticate_with_hash(&conn, &body.body_hash)?;

    let name = body.value.name.trim().to_string();
    if name.is_empty() || name.len() > 64 {
        return Err(ApiError::bad_request(
            "InvalidName",
            "Group name must be 1-64 characters",
        ));
    }
    if active_membership_count(&conn, &owner)? >= MEMBERSHIPS_PER_AGENT {
        return Err(ApiError::forbidden(
            "Forbidden",
            "Active membership limit reached",
        ));
    }

    let settings = body.value.settings.as_ref();
    let members_can_invite = settings.and_then(|s| s.members_can_invite).unwrap_or(false);
    let members_can_send = settings.and_then(|s| s.members_can_send).unwrap_or(true);
    let max_members = settings
        .and_then(|s| s.max_members)
        .unwrap_or(MAX_MEMBERS_CEILING)
        .clamp(1, MAX_MEMBERS_CEILING);

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO groups (id, name, owner, status, members_can_invite, members_can_send,
                             max_members, created_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7)",
        params![
            &id,
            &name,
            &owner,
            members_can_invite as i64,
            members_can_send as i64,
            max_members,
            &now
        ],
    )?;
    tx.execute(
        "INSERT INTO group_memberships (group_id, agent, role, status, joined_at, created_at)
         VALUES (?1, ?2, 'owner', 'active', ?3, ?3)",
        params![&id, &owner, &now],
    )?;
    tx.commit()?;

    Ok(Json(GroupInfo {
        id,
        name,
        owner,
        status: "active".into(),
        members_can_invite,
        members_can_send,
        max_members,
        created_at: now,
        dissolved_at: None,
    }))
}

/// Invite a mutual active contact into the group. Members may invite only
/// when the group allows it; owner and admins always may.
#[post("/groups/<group_id>/invite", format = "json", data = "<body>")]
pub fn invite_member(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
    body: SignedJson<InviteMember>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate_with_hash(&conn, &body.body_hash)?;

    let group = load_active_group(&conn, group_id)?;
    let Some(role) = active_role(&conn, group_id, &caller)? else {
        return Err(ApiError::forbidden(
            "NotMember",
            "Only members may invite to this group",
        ));
    };
    if role == "member" && !group.members_can_invite {
        return Err(ApiError::forbidden(
            "Forbidden",
            "Members of this group may not invite",
        ));
    }

    let invitee = body.value.agent.trim().to_string();
    if let Some(greeting) = body.value.greeting.as_deref()
        && greeting.len() > 500
    {
        return Err(ApiError::bad_request(
            "InvalidRequest",
            "Greeting must be at most 500 characters",
        ));
    }

    let invitee_status: Option<String> = conn
        .query_row(
            "SELECT status FROM agents WHERE name = ?1",
            params![&invitee],
            |r| r.get(0),
        )
        .optional()?;
    if invitee_status.as_deref() != Some("active") {
        return Err(ApiError::not_found("No such agent"));
    }

    let (a, b) = if caller.as_str() < invitee.as_str() {
        (caller.as_str(), invitee.as_str())
    } else {
        (invitee.as_str(), caller.as_str())
    };
    let contact: Option<String> = conn
        .query_row(
            "SELECT status FROM contacts WHERE agent_a = ?1 AND agent_b = ?2",
            params![a, b],
            |r| r.get(0),
        )
        .optional()?;
    if contact.as_deref() != Some("active") {
        return Err(ApiError::forbidden(
            "Forbidden",
            "Invitee must be an active contact of the inviter",
        ));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT status FROM group_memberships WHERE group_id = ?1 AND agent = ?2",
            params![group_id, &invitee],
            |r| r.get(0),
        )
        .optional()?;
    match existing.as_deref() {
        Some("active") | Some("pending") => {
            return Err(ApiError::duplicate("Already a member or already invited"));
        }
        Some(_) => {
            // A left or removed row is replaced by the fresh invitation.
            conn.execute(
                "DELETE FROM group_memberships WHERE group_id = ?1 AND agent = ?2",
                params![group_id, &invitee],
            )?;
        }
        None => {}
    }

    let active_members: i64 = conn.query_row(
        "SELECT COUNT(*) FROM group_memberships WHERE group_id = ?1 AND status = 'active'",
        params![group_id],
        |r| r.get(0),
    )?;
    if active_members >= group.max_members {
        return Err(ApiError::bad_request("GroupFull", "Group is full"));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO group_memberships (group_id, agent, role, status, invited_by, greeting, created_at)
         VALUES (?1, ?2, 'member', 'pending', ?3, ?4, ?5)",
        params![group_id, &invitee, &caller, &body.value.greeting, &now],
    )?;

    Ok(Json(serde_json::json!({
        "invited": invitee,
        "groupId": group_id
    })))
}

#[post("/groups/<group_id>/accept")]
pub fn accept_invitation(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    let pending: Option<String> = conn
        .query_row(
            "SELECT status FROM group_memberships
             WHERE group_id = ?1 AND agent = ?2 AND status = 'pending'",
            params![group_id, &caller],
            |r| r.get(0),
        )
        .optional()?;
    if pending.is_none() {
        return Err(ApiError::not_found("No pending invitation for this group"));
    }
    if active_membership_count(&conn, &caller)? >= MEMBERSHIPS_PER_AGENT {
        return Err(ApiError::forbidden(
            "Forbidden",
            "Active membership limit reached",
        ));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE group_memberships SET status = 'active', joined_at = ?3
         WHERE group_id = ?1 AND agent = ?2",
        params![group_id, &caller, &now],
    )?;

    Ok(Json(serde_json::json!({
        "groupId": group_id,
        "joinedAt": now
    })))
}

/// Declining deletes the invitation row outright; a later invite starts
/// fresh.
#[post("/groups/<group_id>/decline")]
pub fn decline_invitation(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    let deleted = conn.execute(
        "DELETE FROM group_memberships
         WHERE group_id = ?1 AND agent = ?2 AND status = 'pending'",
        params![group_id, &caller],
    )?;
    if deleted == 0 {
        return Err(ApiError::not_found("No pending invitation for this group"));
    }

    Ok(Json(serde_json::json!({ "declined": group_id })))
}

#[post("/groups/<group_id>/leave")]
pub fn leave_group(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    let Some(role) = active_role(&conn, group_id, &caller)? else {
        return Err(ApiError::forbidden(
            "NotMember",
            "Not an active member of this group",
        ));
    };
    if role == "owner" {
        return Err(ApiError::bad_request(
            "OwnerCannotLeave",
            "The owner must transfer ownership or dissolve the group",
        ));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE group_memberships SET status = 'left', left_at = ?3
         WHERE group_id = ?1 AND agent = ?2",
        params![group_id, &caller, &now],
    )?;

    Ok(Json(serde_json::json!({ "left": group_id })))
}

/// Owner or admin removes a member. The owner is unremovable; admins may be
/// removed only by the owner.
#[delete("/groups/<group_id>/members/<target>")]
pub fn remove_member(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
    target: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    let caller_role = match active_role(&conn, group_id, &caller)? {
        Some(role) if role == "owner" || role == "admin" => role,
        Some(_) => {
            return Err(ApiError::forbidden(
                "Forbidden",
                "Only the owner or an admin may remove members",
            ));
        }
        None => {
            return Err(ApiError::forbidden(
                "NotMember",
                "Not an active member of this group",
            ));
        }
    };

    let Some(target_role) = active_role(&conn, group_id, target)? else {
        return Err(ApiError::not_found("No such active member"));
    };
    if target_role == "owner" {
        return Err(ApiError::forbidden("Forbidden", "The owner cannot be removed"));
    }
    if target_role == "admin" && caller_role != "owner" {
        return Err(ApiError::forbidden(
            "Forbidden",
            "Only the owner may remove an admin",
        ));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE group_memberships SET status = 'removed', left_at = ?3
         WHERE group_id = ?1 AND agent = ?2",
        params![group_id, target, &now],
    )?;

    Ok(Json(serde_json::json!({ "removed": target })))
}

/// Dissolution: unconditional for the owner; an admin may dissolve only when
/// the owner has been silent for more than a week. Terminal for all active
/// and pending memberships.
#[delete("/groups/<group_id>")]
pub fn dissolve_group(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    let group = load_active_group(&conn, group_id)?;
    let Some(role) = active_role(&conn, group_id, &caller)? else {
        return Err(ApiError::forbidden(
            "NotMember",
            "Not an active member of this group",
        ));
    };

    match role.as_str() {
        "owner" => {}
        "admin" => {
            let owner_last_seen: Option<String> = conn
                .query_row(
                    "SELECT last_seen FROM agents WHERE name = ?1",
                    params![&group.owner],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();
            let owner_absent = match owner_last_seen.as_deref() {
                None => true,
                Some(seen) => DateTime::parse_from_rfc3339(seen)
                    .map(|t| {
                        Utc::now() - t.with_timezone(&Utc)
                            > chrono::Duration::days(OWNER_ABSENCE_DAYS)
                    })
                    .unwrap_or(true),
            };
            if !owner_absent {
                return Err(ApiError::forbidden(
                    "OwnerReachable",
                    "The owner is still active; only they may dissolve",
                ));
            }
        }
        _ => {
            return Err(ApiError::forbidden(
                "Forbidden",
                "Only the owner or an admin may dissolve",
            ));
        }
    }

    let now = Utc::now().to_rfc3339();
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE groups SET status = 'dissolved', dissolved_at = ?2 WHERE id = ?1",
        params![group_id, &now],
    )?;
    tx.execute(
        "UPDATE group_memberships SET status = 'left', left_at = ?2
         WHERE group_id = ?1 AND status IN ('active', 'pending')",
        params![group_id, &now],
    )?;
    tx.commit()?;

    Ok(Json(serde_json::json!({
        "dissolved": group_id,
        "dissolvedAt": now
    })))
}

/// Atomic ownership handover: the outgoing owner stays on as an admin.
#[post("/groups/<group_id>/transfer", format = "json", data = "<body>")]
pub fn transfer_ownership(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
    body: SignedJson<TransferOwnership>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate_with_hash(&conn, &body.body_hash)?;

    load_active_group(&conn, group_id)?;
    if active_role(&conn, group_id, &caller)?.as_deref() != Some("owner") {
        return Err(ApiError::forbidden(
            "Forbidden",
            "Only the owner may transfer ownership",
        ));
    }

    let new_owner = body.value.new_owner.trim().to_string();
    if active_role(&conn, group_id, &new_owner)?.is_none() {
        return Err(ApiError::not_found("New owner is not an active member"));
    }

    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE group_memberships SET role = 'admin' WHERE group_id = ?1 AND agent = ?2",
        params![group_id, &caller],
    )?;
    tx.execute(
        "UPDATE group_memberships SET role = 'owner' WHERE group_id = ?1 AND agent = ?2",
        params![group_id, &new_owner],
    )?;
    tx.execute(
        "UPDATE groups SET owner = ?2 WHERE id = ?1",
        params![group_id, &new_owner],
    )?;
    tx.commit()?;

    Ok(Json(serde_json::json!({
        "groupId": group_id,
        "owner": new_owner
    })))
}

/// Membership change feed since a watermark. One entry per membership row
/// whose latest transition is newer than `since`, oldest first.
#[get("/groups/<group_id>/changes?<since>")]
pub fn get_changes(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
    since: Option<String>,
) -> Result<Json<Vec<MembershipChange>>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    // Any membership row, current or former, grants read access.
    let member: Option<String> = conn
        .query_row(
            "SELECT status FROM group_memberships WHERE group_id = ?1 AND agent = ?2",
            params![group_id, &caller],
            |r| r.get(0),
        )
        .optional()?;
    if member.is_none() {
        return Err(ApiError::forbidden(
            "NotMember",
            "Never a member of this group",
        ));
    }

    let since = since
        .as_deref()
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| {
                    ApiError::bad_request("InvalidRequest", "since must be an ISO-8601 timestamp")
                })
        })
        .transpose()?
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut stmt = conn.prepare(
        "SELECT agent, status, invited_by, created_at, joined_at, left_at
         FROM group_memberships WHERE group_id = ?1",
    )?;
    let rows: Vec<(String, String, Option<String>, String, Option<String>, Option<String>)> = stmt
        .query_map(params![group_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })?
        .filter_map(|r| r.ok())
        .collect();

    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
    };

    let mut changes: Vec<(DateTime<Utc>, MembershipChange)> = Vec::new();
    for (agent, status, invited_by, created_at, joined_at, left_at) in rows {
        let created = parse(&created_at);
        let joined = joined_at.as_deref().and_then(parse);
        let left = left_at.as_deref().and_then(parse);
        let Some(latest) = [created, joined, left].into_iter().flatten().max() else {
            continue;
        };
        if latest <= since {
            continue;
        }

        let (action, by) = if left.is_some_and(|t| t > since) {
            if status == "removed" {
                ("removed", None)
            } else {
                ("left", Some(agent.clone()))
            }
        } else if joined.is_some_and(|t| t > since) {
            ("joined", Some(agent.clone()))
        } else {
            ("invited", invited_by.clone())
        };

        changes.push((
            latest,
            MembershipChange {
                agent,
                action: action.to_string(),
                by,
                timestamp: latest.to_rfc3339(),
            },
        ));
    }
    changes.sort_by_key(|(t, _)| *t);

    Ok(Json(changes.into_iter().map(|(_, c)| c).collect()))
}

#[get("/groups/<group_id>/members")]
pub fn list_members(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
) -> Result<Json<Vec<GroupMember>>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    if active_role(&conn, group_id, &caller)?.is_none() {
        return Err(ApiError::forbidden(
            "NotMember",
            "Not an active member of this group",
        ));
    }

    let mut stmt = conn.prepare(
        "SELECT agent, role, joined_at FROM group_memberships
         WHERE group_id = ?1 AND status = 'active'
         ORDER BY joined_at ASC",
    )?;
    let members: Vec<GroupMember> = stmt
        .query_map(params![group_id], |r| {
            Ok(GroupMember {
                agent: r.get(0)?,
                role: r.get(1)?,
                joined_at: r.get(2)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Json(members))
}

#[get("/groups/invitations")]
pub fn list_invitations(
    db: &State<Db>,
    headers: AuthHeaders,
) -> Result<Json<Vec<GroupInvitation>>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT m.group_id, g.name, m.invited_by, m.greeting, m.created_at
         FROM group_memberships m JOIN groups g ON g.id = m.group_id
         WHERE m.agent = ?1 AND m.status = 'pending' AND g.status = 'active'
         ORDER BY m.created_at ASC",
    )?;
    let invitations: Vec<GroupInvitation> = stmt
        .query_map(params![&caller], |r| {
            Ok(GroupInvitation {
                group_id: r.get(0)?,
                group_name: r.get(1)?,
                invited_by: r.get(2)?,
                greeting: r.get(3)?,
                created_at: r.get(4)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Json(invitations))
}

#[get("/groups")]
pub fn list_groups(db: &State<Db>, headers: AuthHeaders) -> Result<Json<Vec<GroupInfo>>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT g.id, g.name, g.owner, g.status, g.members_can_invite, g.members_can_send,
                g.max_members, g.created_at, g.dissolved_at
         FROM groups g JOIN group_memberships m ON m.group_id = g.id
         WHERE m.agent = ?1 AND m.status = 'active' AND g.status = 'active'
         ORDER BY g.created_at ASC",
    )?;
    let groups: Vec<GroupInfo> = stmt
        .query_map(params![&caller], |r| {
            Ok(GroupInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                owner: r.get(2)?,
                status: r.get(3)?,
                members_can_invite: r.get::<_, i64>(4)? != 0,
                members_can_send: r.get::<_, i64>(5)? != 0,
                max_members: r.get(6)?,
                created_at: r.get(7)?,
                dissolved_at: r.get(8)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Json(groups))
}

#[get("/groups/<group_id>")]
pub fn get_group(
    db: &State<Db>,
    headers: AuthHeaders,
    group_id: &str,
) -> Result<Json<GroupInfo>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate(&conn)?;

    let group = load_active_group(&conn, group_id)?;
    if active_role(&conn, group_id, &caller)?.is_none() {
        return Err(ApiError::forbidden(
            "NotMember",
            "Not an active member of this group",
        ));
    }

    Ok(Json(group))
}
