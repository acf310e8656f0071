//! Stored documents and the values exchanged between components.
//!
//! Field names are camelCase on the wire so both participants' clients
//! and the controller read the same documents.

use common::types::{RoomId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Display name used when a user has none.
pub const ANONYMOUS_DISPLAY_NAME: &str = "匿名";

/// Status of a waiting entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingStatus {
    Waiting,
    Matched,
}

impl WaitingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WaitingStatus::Waiting => "waiting",
            WaitingStatus::Matched => "matched",
        }
    }
}

/// A user's presence in the matching pool, stored at `queue/{userId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingEntry {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    /// Resolved by the store when the entry is written.
    #[serde(default)]
    pub enqueued_at: Timestamp,
    pub status: WaitingStatus,
    #[serde(default)]
    pub matched_with: Option<UserId>,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub partner_display_name: Option<String>,
    #[serde(default)]
    pub partner_avatar_ref: Option<String>,
}

impl WaitingEntry {
    /// The match carried by a `matched` entry.
    ///
    /// `None` while waiting, or if a matched entry is missing its references.
    #[must_use]
    pub fn match_info(&self) -> Option<MatchInfo> {
        if self.status != WaitingStatus::Matched {
            return None;
        }
        let room_id = self.room_id.clone()?;
        let partner_id = self.matched_with.clone()?;
        Some(MatchInfo {
            room_id,
            partner_id,
            partner_display_name: self
                .partner_display_name
                .clone()
                .unwrap_or_else(|| ANONYMOUS_DISPLAY_NAME.to_string()),
            partner_avatar_ref: self.partner_avatar_ref.clone(),
        })
    }
}

/// What a user supplies when joining the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
}

impl UserProfile {
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: None,
            avatar_ref: None,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_avatar_ref(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    /// Display name, falling back to the anonymous placeholder.
    #[must_use]
    pub fn display_name_or_default(&self) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => ANONYMOUS_DISPLAY_NAME.to_string(),
        }
    }
}

/// Delivered once per queue join when the entry flips to `matched`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchInfo {
    pub room_id: RoomId,
    pub partner_id: UserId,
    pub partner_display_name: String,
    pub partner_avatar_ref: Option<String>,
}

/// Room status. Only ever advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Active,
    Ended,
}

impl RoomStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Active => "active",
            RoomStatus::Ended => "ended",
        }
    }

    /// Whether moving to `next` is a legal forward transition.
    #[must_use]
    pub fn can_advance_to(self, next: RoomStatus) -> bool {
        next > self
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a room ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    TimerEnded,
    PartnerDisconnected,
}

impl EndReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::UserEnded => "user_ended",
            EndReason::TimerEnded => "timer_ended",
            EndReason::PartnerDisconnected => "partner_disconnected",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signaling role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The party already waiting at pairing time. Writes the offer.
    Caller,
    /// The newcomer. Writes the answer.
    Callee,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Callee => "callee",
        }
    }

    #[must_use]
    pub fn opposite(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Connection-negotiation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// A paired call, stored at `rooms/{roomId}` together with its negotiation fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub participants: Vec<UserId>,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub status: RoomStatus,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
    pub base_duration_sec: u64,
    #[serde(default)]
    pub extensions_count: u64,
    #[serde(default)]
    pub end_reason: Option<EndReason>,
    /// Seconds between `startedAt` and `endedAt`, written at the end.
    #[serde(default)]
    pub total_duration_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl Room {
    /// A fresh room as created by a pairing transaction.
    ///
    /// `created_at` is a placeholder; the pairing transaction stamps it
    /// with the server time.
    #[must_use]
    pub fn new(caller_id: UserId, callee_id: UserId, base_duration_sec: u64) -> Self {
        Self {
            participants: vec![callee_id.clone(), caller_id.clone()],
            caller_id,
            callee_id,
            status: RoomStatus::Waiting,
            created_at: Timestamp::default(),
            started_at: None,
            ended_at: None,
            base_duration_sec,
            extensions_count: 0,
            end_reason: None,
            total_duration_sec: 0,
            offer: None,
            answer: None,
        }
    }

    #[must_use]
    pub fn is_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    /// Role of `user_id`, or `None` for outsiders.
    #[must_use]
    pub fn role_of(&self, user_id: &UserId) -> Option<Role> {
        if &self.caller_id == user_id {
            Some(Role::Caller)
        } else if &self.callee_id == user_id {
            Some(Role::Callee)
        } else {
            None
        }
    }

    #[must_use]
    pub fn partner_of(&self, user_id: &UserId) -> Option<&UserId> {
        match self.role_of(user_id)? {
            Role::Caller => Some(&self.callee_id),
            Role::Callee => Some(&self.caller_id),
        }
    }

    /// Wall-clock deadline of an active call.
    #[must_use]
    pub fn ends_at(&self) -> Option<Timestamp> {
        self.started_at
            .map(|started| started.saturating_add(Duration::from_secs(self.base_duration_sec)))
    }

    /// Seconds left at `now`, anchored on `startedAt + baseDurationSec`.
    #[must_use]
    pub fn remaining_seconds(&self, now: Timestamp) -> Option<u64> {
        self.ends_at().map(|deadline| deadline.seconds_since(now))
    }

    /// Consumed call time in whole minutes, rounded up.
    #[must_use]
    pub fn consumed_minutes(&self) -> u64 {
        self.total_duration_sec.div_ceil(60)
    }
}

/// Post-call rating, stored under `ratings/*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub room_id: RoomId,
    pub from_user_id: UserId,
    pub rating: u8,
    #[serde(default)]
    pub created_at: Timestamp,
}
