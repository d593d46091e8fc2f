use axum::{
    extract::{Extension, Path, Query},
    response::Json,
};
use counsel_core::types::{
    Case, CaseDocument, CaseStatus, ChatMessage, ChatRoom, CommunityRequest, ConnectionRequest,
    ConnectionStatus, LawyerListing, LawyerProfile, LawyerSearch, RequestProposal, RequestStatus, Role,
    TimeEntry, UserProfile,
};
use counsel_crm::{NewCase, NewDocument};
use counsel_directory::{LawyerProfileUpdate, ProfileUpdate, Registration};
use counsel_marketplace::{NewProposal, NewRequest};
use counsel_messaging::{Attachment, ChatSummary, IncomingRequest, SendOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "counsel-api"
    }))
}

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// Profiles

pub async fn register(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(registration): Json<Registration>,
) -> ApiResult<UserProfile> {
    let profile = state
        .profiles
        .register(user.user_id, user.email, registration)
        .await?;
    Ok(Json(profile))
}

pub async fn get_my_profile(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<UserProfile> {
    Ok(Json(state.profiles.get_profile(user.user_id).await?))
}

pub async fn get_profile(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<UserProfile> {
    Ok(Json(state.profiles.get_profile(id).await?))
}

pub async fn update_profile(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(update): Json<ProfileUpdate>,
) -> ApiResult<UserProfile> {
    Ok(Json(state.profiles.update_profile(user.user_id, id, update).await?))
}

#[derive(Deserialize)]
pub struct RoleBody {
    pub role: Role,
}

pub async fn set_role(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<RoleBody>,
) -> ApiResult<UserProfile> {
    Ok(Json(state.profiles.set_role(user.user_id, id, body.role).await?))
}

pub async fn search_lawyers(
    Extension(state): Extension<AppState>,
    Query(filter): Query<LawyerSearch>,
) -> ApiResult<Vec<LawyerListing>> {
    Ok(Json(state.profiles.search_lawyers(&filter).await?))
}

pub async fn get_lawyer(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<LawyerListing> {
    Ok(Json(state.profiles.get_lawyer(id).await?))
}

pub async fn update_lawyer_profile(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(update): Json<LawyerProfileUpdate>,
) -> ApiResult<LawyerProfile> {
    Ok(Json(state.profiles.update_lawyer_profile(user.user_id, update).await?))
}

#[derive(Deserialize)]
pub struct DocumentUrlBody {
    pub url: String,
}

pub async fn add_verification_document(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<DocumentUrlBody>,
) -> ApiResult<LawyerProfile> {
    Ok(Json(
        state
            .profiles
            .add_verification_document(user.user_id, body.url)
            .await?,
    ))
}

#[derive(Deserialize)]
pub struct VerifyBody {
    pub verified: bool,
}

pub async fn set_verified(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<VerifyBody>,
) -> ApiResult<LawyerProfile> {
    Ok(Json(state.profiles.set_verified(user.user_id, id, body.verified).await?))
}

// Connections

#[derive(Deserialize)]
pub struct ConnectBody {
    pub receiver_id: Uuid,
}

#[derive(Serialize)]
pub struct ConnectResponse {
    pub created: bool,
    pub request: ConnectionRequest,
}

pub async fn send_connection_request(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<ConnectBody>,
) -> ApiResult<ConnectResponse> {
    let outcome = state
        .connections
        .send_connection_request(user.user_id, body.receiver_id)
        .await?;
    let created = outcome.is_created();
    let request = match outcome {
        SendOutcome::Created(request) | SendOutcome::AlreadyPending(request) => request,
    };
    Ok(Json(ConnectResponse { created, request }))
}

pub async fn get_incoming_requests(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<IncomingRequest>> {
    Ok(Json(state.connections.get_incoming_requests(user.user_id).await?))
}

pub async fn get_outgoing_requests(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<ConnectionRequest>> {
    Ok(Json(state.connections.get_outgoing_requests(user.user_id).await?))
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: ConnectionStatus,
}

pub async fn get_connection_status(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(other): Path<Uuid>,
) -> ApiResult<StatusResponse> {
    let status = state
        .connections
        .get_connection_status(user.user_id, other)
        .await?;
    Ok(Json(StatusResponse { status }))
}

#[derive(Deserialize)]
pub struct RespondBody {
    pub status: RequestStatus,
}

#[derive(Serialize)]
pub struct RespondResponse {
    pub request: ConnectionRequest,
    pub chat_room: Option<ChatRoom>,
}

pub async fn respond_to_connection_request(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<RespondBody>,
) -> ApiResult<RespondResponse> {
    let (request, chat_room) = state
        .connections
        .respond_to_connection_request(user.user_id, id, body.status)
        .await?;
    Ok(Json(RespondResponse { request, chat_room }))
}

// Chats

pub async fn list_chats(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<ChatSummary>> {
    Ok(Json(state.chats.list_chats(user.user_id).await?))
}

#[derive(Serialize)]
pub struct UnreadResponse {
    pub total: u64,
}

pub async fn get_unread_total(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<UnreadResponse> {
    let total = state.chats.unread_total(user.user_id).await?;
    Ok(Json(UnreadResponse { total }))
}

pub async fn get_messages(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(chat_id): Path<Uuid>,
) -> ApiResult<Vec<ChatMessage>> {
    Ok(Json(state.chats.get_messages(chat_id, user.user_id).await?))
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    #[serde(default)]
    pub text: String,
    pub attachment: Option<Attachment>,
}

pub async fn send_message(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<ChatMessage> {
    let message = state
        .chats
        .send_message(chat_id, user.user_id, &body.text, body.attachment)
        .await?;
    Ok(Json(message))
}

pub async fn mark_chat_read(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(chat_id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    state.chats.mark_chat_read(chat_id, user.user_id).await?;
    Ok(ok())
}

// CRM

pub async fn create_case(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(new_case): Json<NewCase>,
) -> ApiResult<Case> {
    Ok(Json(state.crm.create_case(user.user_id, new_case).await?))
}

pub async fn list_cases(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<Case>> {
    Ok(Json(state.crm.list_cases(user.user_id).await?))
}

pub async fn get_case(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Case> {
    Ok(Json(state.crm.get_case(user.user_id, id).await?))
}

#[derive(Deserialize)]
pub struct CaseStatusBody {
    pub status: CaseStatus,
}

pub async fn update_case_status(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<CaseStatusBody>,
) -> ApiResult<Case> {
    Ok(Json(state.crm.update_case_status(user.user_id, id, body.status).await?))
}

pub async fn start_time_entry(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(case_id): Path<Uuid>,
) -> ApiResult<TimeEntry> {
    Ok(Json(state.crm.start_time_entry(user.user_id, case_id).await?))
}

pub async fn list_time_entries(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(case_id): Path<Uuid>,
) -> ApiResult<Vec<TimeEntry>> {
    Ok(Json(state.crm.list_time_entries(user.user_id, case_id).await?))
}

#[derive(Deserialize)]
pub struct StopBody {
    pub rate_per_hour: f64,
}

pub async fn stop_time_entry(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(entry_id): Path<Uuid>,
    Json(body): Json<StopBody>,
) -> ApiResult<TimeEntry> {
    let entry = state
        .crm
        .stop_time_entry(user.user_id, entry_id, body.rate_per_hour)
        .await?;
    Ok(Json(entry))
}

pub async fn add_document(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(case_id): Path<Uuid>,
    Json(document): Json<NewDocument>,
) -> ApiResult<CaseDocument> {
    Ok(Json(state.crm.add_document(user.user_id, case_id, document).await?))
}

pub async fn list_documents(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(case_id): Path<Uuid>,
) -> ApiResult<Vec<CaseDocument>> {
    Ok(Json(state.crm.list_documents(user.user_id, case_id).await?))
}

pub async fn delete_document(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    state.crm.delete_document(user.user_id, id).await?;
    Ok(ok())
}

// Marketplace

pub async fn create_request(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(new_request): Json<NewRequest>,
) -> ApiResult<CommunityRequest> {
    Ok(Json(state.marketplace.create_request(user.user_id, new_request).await?))
}

#[derive(Deserialize)]
pub struct RequestQuery {
    #[serde(default)]
    pub category: Option<String>,
}

pub async fn list_open_requests(
    Extension(state): Extension<AppState>,
    Query(params): Query<RequestQuery>,
) -> ApiResult<Vec<CommunityRequest>> {
    Ok(Json(
        state
            .marketplace
            .list_open_requests(params.category.as_deref())
            .await?,
    ))
}

pub async fn list_my_requests(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<CommunityRequest>> {
    Ok(Json(state.marketplace.list_client_requests(user.user_id).await?))
}

pub async fn get_request(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CommunityRequest> {
    Ok(Json(state.marketplace.get_request(id).await?))
}

pub async fn submit_proposal(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(request_id): Path<Uuid>,
    Json(proposal): Json<NewProposal>,
) -> ApiResult<RequestProposal> {
    let proposal = state
        .marketplace
        .submit_proposal(user.user_id, request_id, proposal)
        .await?;
    Ok(Json(proposal))
}

pub async fn list_proposals(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Vec<RequestProposal>> {
    Ok(Json(state.marketplace.list_proposals(user.user_id, request_id).await?))
}

#[derive(Deserialize)]
pub struct AcceptBody {
    pub proposal_id: Uuid,
    pub lawyer_id: Uuid,
}

#[derive(Serialize)]
pub struct AcceptResponse {
    pub request: CommunityRequest,
    pub proposal: RequestProposal,
}

pub async fn accept_proposal(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<AcceptBody>,
) -> ApiResult<AcceptResponse> {
    let (request, proposal) = state
        .marketplace
        .accept_proposal(user.user_id, request_id, body.proposal_id, body.lawyer_id)
        .await?;
    Ok(Json(AcceptResponse { request, proposal }))
}

pub async fn close_request(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<CommunityRequest> {
    Ok(Json(state.marketplace.close_request(user.user_id, request_id).await?))
}
