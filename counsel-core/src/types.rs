use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Implements `as_str`, `Display` and `FromStr` for a text-backed enum column.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Validation(format!(
                        "invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Lawyer,
    Admin,
}

text_enum!(Role {
    Client => "client",
    Lawyer => "lawyer",
    Admin => "admin",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub role: Role,
    pub name: String,
    pub email: Option<String>,
    pub city: Option<String>,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LawyerProfile {
    pub user_id: Uuid,
    pub specializations: Vec<String>,
    pub price: Option<f64>,
    pub verified: bool,
    pub rating: f64,
    pub banner_url: Option<String>,
    pub verification_documents: Vec<String>,
}

impl LawyerProfile {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            specializations: Vec::new(),
            price: None,
            verified: false,
            rating: 0.0,
            banner_url: None,
            verification_documents: Vec::new(),
        }
    }
}

/// Owner-editable profile fields. `None` leaves the stored column alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub city: Option<String>,
    pub photo_url: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.city.is_none() && self.photo_url.is_none()
    }
}

/// Lawyer-editable listing fields. Verification and rating are never part of it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LawyerProfileUpdate {
    pub specializations: Option<Vec<String>>,
    pub price: Option<f64>,
    pub banner_url: Option<String>,
}

impl LawyerProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.specializations.is_none() && self.price.is_none() && self.banner_url.is_none()
    }
}

/// Lawyer search result: the public profile joined with its lawyer extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LawyerListing {
    pub profile: UserProfile,
    pub lawyer: LawyerProfile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LawyerSearch {
    pub city: Option<String>,
    pub specialization: Option<String>,
    pub max_price: Option<f64>,
    #[serde(default)]
    pub verified_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

text_enum!(RequestStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

/// Status between two identities as reported to either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    None,
    Pending,
    Accepted,
    Rejected,
}

impl From<RequestStatus> for ConnectionStatus {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Pending => ConnectionStatus::Pending,
            RequestStatus::Accepted => ConnectionStatus::Accepted,
            RequestStatus::Rejected => ConnectionStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub last_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub unread_counts: HashMap<Uuid, u32>,
}

impl ChatRoom {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    /// The participant that is not `user_id`, if `user_id` is in the room.
    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    pub fn unread_for(&self, user_id: Uuid) -> u32 {
        self.unread_counts.get(&user_id).copied().unwrap_or(0)
    }
}

/// Canonical ordering of a participant pair, so each unordered pair maps to one room.
pub fn ordered_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    File,
    CallLog,
}

text_enum!(MessageType {
    Text => "text",
    Image => "image",
    File => "file",
    CallLog => "call_log",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    New,
    InProgress,
    Court,
    Completed,
}

text_enum!(CaseStatus {
    New => "new",
    InProgress => "in_progress",
    Court => "court",
    Completed => "completed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: Uuid,
    pub lawyer_id: Uuid,
    pub client_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: Uuid,
    pub case_id: Uuid,
    pub lawyer_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub rate_per_hour: Option<f64>,
    pub total_amount: Option<f64>,
}

impl TimeEntry {
    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Values written once when a running time entry is stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeEntryStop {
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub rate_per_hour: f64,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDocument {
    pub id: Uuid,
    pub case_id: Uuid,
    pub lawyer_id: Uuid,
    pub name: String,
    pub file_url: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityRequestStatus {
    Open,
    InReview,
    Accepted,
    Closed,
}

text_enum!(CommunityRequestStatus {
    Open => "open",
    InReview => "in_review",
    Accepted => "accepted",
    Closed => "closed",
});

impl CommunityRequestStatus {
    /// Whether lawyers may still bid and the client may still pick a proposal.
    pub fn accepts_proposals(&self) -> bool {
        matches!(self, CommunityRequestStatus::Open | CommunityRequestStatus::InReview)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityRequest {
    pub id: Uuid,
    pub client_id: Uuid,
    pub title: String,
    pub description: String,
    pub category: String,
    pub budget: Option<f64>,
    pub city: Option<String>,
    pub status: CommunityRequestStatus,
    pub proposal_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
}

text_enum!(ProposalStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestProposal {
    pub id: Uuid,
    pub request_id: Uuid,
    pub lawyer_id: Uuid,
    pub proposed_price: f64,
    pub message: String,
    pub estimated_duration: Option<String>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enums_parse_their_own_output() {
        for status in [
            CaseStatus::New,
            CaseStatus::InProgress,
            CaseStatus::Court,
            CaseStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<CaseStatus>().unwrap(), status);
        }
        assert_eq!("call_log".parse::<MessageType>().unwrap(), MessageType::CallLog);
        assert!("archived".parse::<CommunityRequestStatus>().is_err());
    }

    #[test]
    fn test_other_participant() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let room = ChatRoom {
            id: Uuid::new_v4(),
            participants: [a, b],
            last_message: None,
            updated_at: Utc::now(),
            unread_counts: HashMap::new(),
        };
        assert_eq!(room.other_participant(a), Some(b));
        assert_eq!(room.other_participant(b), Some(a));
        assert_eq!(room.other_participant(Uuid::new_v4()), None);
        assert_eq!(room.unread_for(a), 0);
    }

    #[test]
    fn test_ordered_pair_is_symmetric() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(ordered_pair(a, b), ordered_pair(b, a));
    }
}
