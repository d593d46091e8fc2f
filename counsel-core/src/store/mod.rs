//! Storage seams for the hosted database.
//!
//! Every multi-step write the services need (accepting a connection request,
//! appending a chat message, submitting or accepting a proposal) is a single
//! trait method so each backend can apply it atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::*;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, id: Uuid) -> Result<Option<UserProfile>>;

    /// One round trip for any number of ids; unknown ids are skipped.
    async fn get_profiles(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>>;

    /// Inserts `profile` unless its id already exists, returning the stored row.
    async fn create_profile(&self, profile: &UserProfile) -> Result<UserProfile>;

    /// Writes only the fields set in `update`; the role column is never touched.
    async fn update_profile_details(&self, id: Uuid, update: &ProfileUpdate) -> Result<UserProfile>;

    /// Changes the role and, in the same write, creates the lawyer profile when
    /// promoting to lawyer or removes it for any other role.
    async fn set_role(&self, id: Uuid, role: Role) -> Result<UserProfile>;

    async fn get_lawyer_profile(&self, user_id: Uuid) -> Result<Option<LawyerProfile>>;

    /// Creates an empty lawyer profile when absent, returning the stored row.
    async fn ensure_lawyer_profile(&self, user_id: Uuid) -> Result<LawyerProfile>;

    /// Writes only the listing fields set in `update`.
    async fn update_lawyer_details(&self, user_id: Uuid, update: &LawyerProfileUpdate) -> Result<LawyerProfile>;

    async fn append_verification_document(&self, user_id: Uuid, url: &str) -> Result<LawyerProfile>;

    /// Fails with `NotFound` unless `user_id` currently holds the lawyer role.
    async fn set_lawyer_verified(&self, user_id: Uuid, verified: bool) -> Result<LawyerProfile>;

    /// Lawyers matching `filter`, best rated first.
    async fn search_lawyers(&self, filter: &LawyerSearch) -> Result<Vec<LawyerListing>>;
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_connection_request(&self, id: Uuid) -> Result<Option<ConnectionRequest>>;

    async fn find_pending_request(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<ConnectionRequest>>;

    /// Inserts a pending request. If a pending request for the same ordered
    /// pair already exists, that one is returned instead.
    async fn insert_connection_request(&self, request: &ConnectionRequest) -> Result<ConnectionRequest>;

    /// Most recent request sent from `sender_id` to `receiver_id`, any status.
    async fn latest_request(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<ConnectionRequest>>;

    async fn requests_to(&self, receiver_id: Uuid, status: RequestStatus) -> Result<Vec<ConnectionRequest>>;

    async fn requests_from(&self, sender_id: Uuid) -> Result<Vec<ConnectionRequest>>;

    /// Moves a pending request to `status`. Accepting also gets or creates the
    /// chat room for the pair (using `new_room_id` when created) in the same
    /// atomic step.
    async fn resolve_connection_request(
        &self,
        id: Uuid,
        status: RequestStatus,
        new_room_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(ConnectionRequest, Option<ChatRoom>)>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_chat_room(&self, id: Uuid) -> Result<Option<ChatRoom>>;

    async fn find_chat_room(&self, a: Uuid, b: Uuid) -> Result<Option<ChatRoom>>;

    /// Rooms `user_id` takes part in, most recently updated first.
    async fn chat_rooms_for(&self, user_id: Uuid) -> Result<Vec<ChatRoom>>;

    /// Appends `message`, sets the room preview and `updated_at`, and adds one
    /// to `receiver_id`'s unread counter, atomically. The stored `created_at`
    /// is never earlier than the room's previous `updated_at`.
    async fn append_message(
        &self,
        message: &ChatMessage,
        preview: &str,
        receiver_id: Uuid,
    ) -> Result<(ChatMessage, ChatRoom)>;

    /// Messages of a room, oldest first.
    async fn messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>>;

    async fn reset_unread(&self, chat_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn total_unread(&self, user_id: Uuid) -> Result<u64>;
}

#[async_trait]
pub trait CrmStore: Send + Sync {
    async fn insert_case(&self, case: &Case) -> Result<()>;

    async fn get_case(&self, id: Uuid) -> Result<Option<Case>>;

    async fn cases_for_lawyer(&self, lawyer_id: Uuid) -> Result<Vec<Case>>;

    async fn set_case_status(&self, id: Uuid, status: CaseStatus) -> Result<Case>;

    async fn insert_time_entry(&self, entry: &TimeEntry) -> Result<()>;

    async fn get_time_entry(&self, id: Uuid) -> Result<Option<TimeEntry>>;

    async fn time_entries_for_case(&self, case_id: Uuid) -> Result<Vec<TimeEntry>>;

    /// Writes the stop values only while the entry is still running; returns
    /// `None` when it was already stopped.
    async fn stop_time_entry(&self, id: Uuid, stop: &TimeEntryStop) -> Result<Option<TimeEntry>>;

    async fn insert_document(&self, document: &CaseDocument) -> Result<()>;

    async fn get_document(&self, id: Uuid) -> Result<Option<CaseDocument>>;

    async fn documents_for_case(&self, case_id: Uuid) -> Result<Vec<CaseDocument>>;

    async fn delete_document(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait MarketplaceStore: Send + Sync {
    async fn insert_request(&self, request: &CommunityRequest) -> Result<()>;

    async fn get_request(&self, id: Uuid) -> Result<Option<CommunityRequest>>;

    /// Newest first, optionally narrowed to one category.
    async fn requests_with_status(
        &self,
        status: CommunityRequestStatus,
        category: Option<&str>,
    ) -> Result<Vec<CommunityRequest>>;

    async fn requests_by_client(&self, client_id: Uuid) -> Result<Vec<CommunityRequest>>;

    /// Moves a request to `to` if its current status is one of `from`.
    async fn transition_request(
        &self,
        id: Uuid,
        from: &[CommunityRequestStatus],
        to: CommunityRequestStatus,
    ) -> Result<CommunityRequest>;

    /// Inserts the proposal and increments the request's `proposal_count`
    /// atomically, provided the request still accepts proposals.
    async fn insert_proposal(&self, proposal: &RequestProposal) -> Result<CommunityRequest>;

    async fn get_proposal(&self, id: Uuid) -> Result<Option<RequestProposal>>;

    /// Proposals of a request, oldest first.
    async fn proposals_for_request(&self, request_id: Uuid) -> Result<Vec<RequestProposal>>;

    /// Marks the proposal and its request `accepted` atomically. Other
    /// proposals of the request are left untouched.
    async fn accept_proposal(
        &self,
        request_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<(CommunityRequest, RequestProposal)>;
}

/// Everything a backend provides.
pub trait Store: ProfileStore + ConnectionStore + ChatStore + CrmStore + MarketplaceStore {}

impl<T> Store for T where T: ProfileStore + ConnectionStore + ChatStore + CrmStore + MarketplaceStore {}
