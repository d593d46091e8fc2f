use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Array, Text};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{ChatStore, ConnectionStore, CrmStore, MarketplaceStore, ProfileStore};
use crate::db::{DbConnection, DbPool};
use crate::error::{Error, Result};
use crate::schema::{
    case_documents, cases, chat_messages, chat_rooms, chat_unread, community_requests,
    connection_requests, lawyer_profiles, profiles, request_proposals, time_entries,
};
use crate::types::*;

diesel::define_sql_function! {
    fn array_append(array: Array<Text>, element: Text) -> Array<Text>;
}

/// PostgreSQL backend on the shared diesel-async pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<DbConnection> {
        self.pool.get().await.map_err(|e| Error::Pool(e.to_string()))
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = profiles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ProfileRow {
    id: Uuid,
    role: String,
    name: String,
    email: Option<String>,
    city: Option<String>,
    photo_url: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ProfileRow> for UserProfile {
    type Error = Error;

    fn try_from(row: ProfileRow) -> Result<Self> {
        Ok(UserProfile {
            id: row.id,
            role: row.role.parse()?,
            name: row.name,
            email: row.email,
            city: row.city,
            photo_url: row.photo_url,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = lawyer_profiles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct LawyerRow {
    user_id: Uuid,
    specializations: Vec<String>,
    price: Option<f64>,
    verified: bool,
    rating: f64,
    banner_url: Option<String>,
    verification_documents: Vec<String>,
}

impl From<LawyerRow> for LawyerProfile {
    fn from(row: LawyerRow) -> Self {
        LawyerProfile {
            user_id: row.user_id,
            specializations: row.specializations,
            price: row.price,
            verified: row.verified,
            rating: row.rating,
            banner_url: row.banner_url,
            verification_documents: row.verification_documents,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = connection_requests)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ConnectionRequestRow {
    id: Uuid,
    sender_id: Uuid,
    receiver_id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ConnectionRequestRow> for ConnectionRequest {
    type Error = Error;

    fn try_from(row: ConnectionRequestRow) -> Result<Self> {
        Ok(ConnectionRequest {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chat_rooms)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ChatRoomRow {
    id: Uuid,
    participant_a: Uuid,
    participant_b: Uuid,
    last_message: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chat_unread)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct UnreadRow {
    chat_id: Uuid,
    user_id: Uuid,
    unread_count: i32,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chat_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ChatMessageRow {
    id: Uuid,
    chat_id: Uuid,
    sender_id: Uuid,
    text: String,
    message_type: String,
    file_url: Option<String>,
    file_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ChatMessageRow> for ChatMessage {
    type Error = Error;

    fn try_from(row: ChatMessageRow) -> Result<Self> {
        Ok(ChatMessage {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            text: row.text,
            message_type: row.message_type.parse()?,
            file_url: row.file_url,
            file_name: row.file_name,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = cases)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct CaseRow {
    id: Uuid,
    lawyer_id: Uuid,
    client_id: Option<Uuid>,
    title: String,
    description: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CaseRow> for Case {
    type Error = Error;

    fn try_from(row: CaseRow) -> Result<Self> {
        Ok(Case {
            id: row.id,
            lawyer_id: row.lawyer_id,
            client_id: row.client_id,
            title: row.title,
            description: row.description,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = time_entries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct TimeEntryRow {
    id: Uuid,
    case_id: Uuid,
    lawyer_id: Uuid,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration_minutes: Option<i64>,
    rate_per_hour: Option<f64>,
    total_amount: Option<f64>,
}

impl From<TimeEntryRow> for TimeEntry {
    fn from(row: TimeEntryRow) -> Self {
        TimeEntry {
            id: row.id,
            case_id: row.case_id,
            lawyer_id: row.lawyer_id,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_minutes: row.duration_minutes,
            rate_per_hour: row.rate_per_hour,
            total_amount: row.total_amount,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = case_documents)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct DocumentRow {
    id: Uuid,
    case_id: Uuid,
    lawyer_id: Uuid,
    name: String,
    file_url: String,
    content_type: Option<String>,
    size_bytes: Option<i64>,
    uploaded_at: DateTime<Utc>,
}

impl From<DocumentRow> for CaseDocument {
    fn from(row: DocumentRow) -> Self {
        CaseDocument {
            id: row.id,
            case_id: row.case_id,
            lawyer_id: row.lawyer_id,
            name: row.name,
            file_url: row.file_url,
            content_type: row.content_type,
            size_bytes: row.size_bytes,
            uploaded_at: row.uploaded_at,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = community_requests)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct CommunityRequestRow {
    id: Uuid,
    client_id: Uuid,
    title: String,
    description: String,
    category: String,
    budget: Option<f64>,
    city: Option<String>,
    status: String,
    proposal_count: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<CommunityRequestRow> for CommunityRequest {
    type Error = Error;

    fn try_from(row: CommunityRequestRow) -> Result<Self> {
        Ok(CommunityRequest {
            id: row.id,
            client_id: row.client_id,
            title: row.title,
            description: row.description,
            category: row.category,
            budget: row.budget,
            city: row.city,
            status: row.status.parse()?,
            proposal_count: row.proposal_count,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = request_proposals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ProposalRow {
    id: Uuid,
    request_id: Uuid,
    lawyer_id: Uuid,
    proposed_price: f64,
    message: String,
    estimated_duration: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ProposalRow> for RequestProposal {
    type Error = Error;

    fn try_from(row: ProposalRow) -> Result<Self> {
        Ok(RequestProposal {
            id: row.id,
            request_id: row.request_id,
            lawyer_id: row.lawyer_id,
            proposed_price: row.proposed_price,
            message: row.message,
            estimated_duration: row.estimated_duration,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Attaches unread counters to room rows with one extra query.
async fn rooms_with_unread(conn: &mut AsyncPgConnection, rows: Vec<ChatRoomRow>) -> Result<Vec<ChatRoom>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let counters: Vec<UnreadRow> = chat_unread::table
        .filter(chat_unread::chat_id.eq_any(&ids))
        .select(UnreadRow::as_select())
        .load(conn)
        .await?;

    let mut by_room: HashMap<Uuid, HashMap<Uuid, u32>> = HashMap::new();
    for counter in counters {
        by_room
            .entry(counter.chat_id)
            .or_default()
            .insert(counter.user_id, counter.unread_count.max(0) as u32);
    }

    Ok(rows
        .into_iter()
        .map(|row| ChatRoom {
            id: row.id,
            participants: [row.participant_a, row.participant_b],
            last_message: row.last_message,
            updated_at: row.updated_at,
            unread_counts: by_room.remove(&row.id).unwrap_or_default(),
        })
        .collect())
}

async fn load_room(conn: &mut AsyncPgConnection, id: Uuid) -> Result<Option<ChatRoom>> {
    let row: Option<ChatRoomRow> = chat_rooms::table
        .find(id)
        .select(ChatRoomRow::as_select())
        .first(conn)
        .await
        .optional()?;
    match row {
        Some(row) => Ok(rooms_with_unread(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn get_profile(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let mut conn = self.conn().await?;
        let row: Option<ProfileRow> = profiles::table
            .find(id)
            .select(ProfileRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(UserProfile::try_from).transpose()
    }

    async fn get_profiles(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let rows: Vec<ProfileRow> = profiles::table
            .filter(profiles::id.eq_any(ids))
            .select(ProfileRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn create_profile(&self, profile: &UserProfile) -> Result<UserProfile> {
        let mut conn = self.conn().await?;
        diesel::insert_into(profiles::table)
            .values((
                profiles::id.eq(profile.id),
                profiles::role.eq(profile.role.as_str()),
                profiles::name.eq(&profile.name),
                profiles::email.eq(&profile.email),
                profiles::city.eq(&profile.city),
                profiles::photo_url.eq(&profile.photo_url),
                profiles::created_at.eq(profile.created_at),
            ))
            .on_conflict(profiles::id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let row: ProfileRow = profiles::table
            .find(profile.id)
            .select(ProfileRow::as_select())
            .first(&mut conn)
            .await?;
        row.try_into()
    }

    async fn update_profile_details(&self, id: Uuid, update: &ProfileUpdate) -> Result<UserProfile> {
        if update.is_empty() {
            return self.get_profile(id).await?.ok_or(Error::NotFound("profile"));
        }
        let mut conn = self.conn().await?;
        let row: Option<ProfileRow> = diesel::update(profiles::table.find(id))
            .set((
                update.name.as_deref().map(|name| profiles::name.eq(name)),
                update.city.as_deref().map(|city| profiles::city.eq(city)),
                update.photo_url.as_deref().map(|url| profiles::photo_url.eq(url)),
            ))
            .returning(ProfileRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;
        row.ok_or(Error::NotFound("profile"))?.try_into()
    }

    async fn set_role(&self, id: Uuid, role: Role) -> Result<UserProfile> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, Error, _>(|conn| {
            async move {
                let row: Option<ProfileRow> = diesel::update(profiles::table.find(id))
                    .set(profiles::role.eq(role.as_str()))
                    .returning(ProfileRow::as_returning())
                    .get_result(conn)
                    .await
                    .optional()?;
                let profile: UserProfile = row.ok_or(Error::NotFound("profile"))?.try_into()?;

                if role == Role::Lawyer {
                    diesel::insert_into(lawyer_profiles::table)
                        .values(lawyer_profiles::user_id.eq(id))
                        .on_conflict(lawyer_profiles::user_id)
                        .do_nothing()
                        .execute(conn)
                        .await?;
                } else {
                    diesel::delete(lawyer_profiles::table.find(id)).execute(conn).await?;
                }
                Ok(profile)
            }
            .scope_boxed()
        })
        .await
    }

    async fn get_lawyer_profile(&self, user_id: Uuid) -> Result<Option<LawyerProfile>> {
        let mut conn = self.conn().await?;
        let row: Option<LawyerRow> = lawyer_profiles::table
            .find(user_id)
            .select(LawyerRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(LawyerProfile::from))
    }

    async fn ensure_lawyer_profile(&self, user_id: Uuid) -> Result<LawyerProfile> {
        let mut conn = self.conn().await?;
        diesel::insert_into(lawyer_profiles::table)
            .values(lawyer_profiles::user_id.eq(user_id))
            .on_conflict(lawyer_profiles::user_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let row: LawyerRow = lawyer_profiles::table
            .find(user_id)
            .select(LawyerRow::as_select())
            .first(&mut conn)
            .await?;
        Ok(row.into())
    }

    async fn update_lawyer_details(&self, user_id: Uuid, update: &LawyerProfileUpdate) -> Result<LawyerProfile> {
        if update.is_empty() {
            return self.get_lawyer_profile(user_id).await?.ok_or(Error::NotFound("lawyer profile"));
        }
        let mut conn = self.conn().await?;
        let row: Option<LawyerRow> = diesel::update(lawyer_profiles::table.find(user_id))
            .set((
                update
                    .specializations
                    .as_ref()
                    .map(|specializations| lawyer_profiles::specializations.eq(specializations)),
                update.price.map(|price| lawyer_profiles::price.eq(price)),
                update.banner_url.as_deref().map(|url| lawyer_profiles::banner_url.eq(url)),
            ))
            .returning(LawyerRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;
        Ok(row.ok_or(Error::NotFound("lawyer profile"))?.into())
    }

    async fn append_verification_document(&self, user_id: Uuid, url: &str) -> Result<LawyerProfile> {
        let mut conn = self.conn().await?;
        let row: Option<LawyerRow> = diesel::update(lawyer_profiles::table.find(user_id))
            .set(lawyer_profiles::verification_documents.eq(array_append(lawyer_profiles::verification_documents, url)))
            .returning(LawyerRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;
        Ok(row.ok_or(Error::NotFound("lawyer profile"))?.into())
    }

    async fn set_lawyer_verified(&self, user_id: Uuid, verified: bool) -> Result<LawyerProfile> {
        let mut conn = self.conn().await?;
        let lawyers = profiles::table
            .filter(profiles::role.eq(Role::Lawyer.as_str()))
            .select(profiles::id);
        let row: Option<LawyerRow> = diesel::update(
            lawyer_profiles::table
                .filter(lawyer_profiles::user_id.eq(user_id))
                .filter(lawyer_profiles::user_id.eq_any(lawyers)),
        )
        .set(lawyer_profiles::verified.eq(verified))
        .returning(LawyerRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;
        Ok(row.ok_or(Error::NotFound("lawyer profile"))?.into())
    }

    async fn search_lawyers(&self, filter: &LawyerSearch) -> Result<Vec<LawyerListing>> {
        let mut conn = self.conn().await?;
        let mut query = profiles::table
            .inner_join(lawyer_profiles::table)
            .filter(profiles::role.eq(Role::Lawyer.as_str()))
            .select((ProfileRow::as_select(), LawyerRow::as_select()))
            .order(lawyer_profiles::rating.desc())
            .into_boxed();

        if let Some(city) = &filter.city {
            query = query.filter(profiles::city.ilike(city.clone()));
        }
        if let Some(specialization) = &filter.specialization {
            query = query.filter(lawyer_profiles::specializations.contains(vec![specialization.clone()]));
        }
        if let Some(max_price) = filter.max_price {
            query = query.filter(lawyer_profiles::price.le(max_price));
        }
        if filter.verified_only {
            query = query.filter(lawyer_profiles::verified.eq(true));
        }

        let rows: Vec<(ProfileRow, LawyerRow)> = query.load(&mut conn).await?;
        rows.into_iter()
            .map(|(profile, lawyer)| {
                Ok(LawyerListing {
                    profile: profile.try_into()?,
                    lawyer: lawyer.into(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ConnectionStore for PgStore {
    async fn get_connection_request(&self, id: Uuid) -> Result<Option<ConnectionRequest>> {
        let mut conn = self.conn().await?;
        let row: Option<ConnectionRequestRow> = connection_requests::table
            .find(id)
            .select(ConnectionRequestRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(ConnectionRequest::try_from).transpose()
    }

    async fn find_pending_request(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<ConnectionRequest>> {
        let mut conn = self.conn().await?;
        let row: Option<ConnectionRequestRow> = connection_requests::table
            .filter(connection_requests::sender_id.eq(sender_id))
            .filter(connection_requests::receiver_id.eq(receiver_id))
            .filter(connection_requests::status.eq(RequestStatus::Pending.as_str()))
            .select(ConnectionRequestRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(ConnectionRequest::try_from).transpose()
    }

    async fn insert_connection_request(&self, request: &ConnectionRequest) -> Result<ConnectionRequest> {
        let mut conn = self.conn().await?;
        // The partial unique index on pending pairs turns a duplicate into a no-op.
        let inserted = diesel::insert_into(connection_requests::table)
            .values((
                connection_requests::id.eq(request.id),
                connection_requests::sender_id.eq(request.sender_id),
                connection_requests::receiver_id.eq(request.receiver_id),
                connection_requests::status.eq(request.status.as_str()),
                connection_requests::created_at.eq(request.created_at),
            ))
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;

        if inserted == 1 {
            return Ok(request.clone());
        }

        let row: ConnectionRequestRow = connection_requests::table
            .filter(connection_requests::sender_id.eq(request.sender_id))
            .filter(connection_requests::receiver_id.eq(request.receiver_id))
            .filter(connection_requests::status.eq(RequestStatus::Pending.as_str()))
            .select(ConnectionRequestRow::as_select())
            .first(&mut conn)
            .await?;
        row.try_into()
    }

    async fn latest_request(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<ConnectionRequest>> {
        let mut conn = self.conn().await?;
        let row: Option<ConnectionRequestRow> = connection_requests::table
            .filter(connection_requests::sender_id.eq(sender_id))
            .filter(connection_requests::receiver_id.eq(receiver_id))
            .order(connection_requests::created_at.desc())
            .select(ConnectionRequestRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(ConnectionRequest::try_from).transpose()
    }

    async fn requests_to(&self, receiver_id: Uuid, status: RequestStatus) -> Result<Vec<ConnectionRequest>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ConnectionRequestRow> = connection_requests::table
            .filter(connection_requests::receiver_id.eq(receiver_id))
            .filter(connection_requests::status.eq(status.as_str()))
            .order(connection_requests::created_at.asc())
            .select(ConnectionRequestRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn requests_from(&self, sender_id: Uuid) -> Result<Vec<ConnectionRequest>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ConnectionRequestRow> = connection_requests::table
            .filter(connection_requests::sender_id.eq(sender_id))
            .order(connection_requests::created_at.asc())
            .select(ConnectionRequestRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn resolve_connection_request(
        &self,
        id: Uuid,
        status: RequestStatus,
        new_room_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(ConnectionRequest, Option<ChatRoom>)> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, Error, _>(|conn| {
            async move {
                let row: Option<ConnectionRequestRow> = connection_requests::table
                    .find(id)
                    .for_update()
                    .select(ConnectionRequestRow::as_select())
                    .first(conn)
                    .await
                    .optional()?;
                let mut request: ConnectionRequest =
                    row.ok_or(Error::NotFound("connection request"))?.try_into()?;

                if request.status != RequestStatus::Pending {
                    return Err(Error::InvalidState(format!(
                        "connection request is already {}",
                        request.status
                    )));
                }

                diesel::update(connection_requests::table.find(id))
                    .set(connection_requests::status.eq(status.as_str()))
                    .execute(conn)
                    .await?;
                request.status = status;

                if status != RequestStatus::Accepted {
                    return Ok((request, None));
                }

                let (a, b) = ordered_pair(request.sender_id, request.receiver_id);
                diesel::insert_into(chat_rooms::table)
                    .values((
                        chat_rooms::id.eq(new_room_id),
                        chat_rooms::participant_a.eq(a),
                        chat_rooms::participant_b.eq(b),
                        chat_rooms::created_at.eq(at),
                        chat_rooms::updated_at.eq(at),
                    ))
                    .on_conflict((chat_rooms::participant_a, chat_rooms::participant_b))
                    .do_nothing()
                    .execute(conn)
                    .await?;

                let room_id: Uuid = chat_rooms::table
                    .filter(chat_rooms::participant_a.eq(a))
                    .filter(chat_rooms::participant_b.eq(b))
                    .select(chat_rooms::id)
                    .first(conn)
                    .await?;

                diesel::insert_into(chat_unread::table)
                    .values(&vec![
                        (
                            chat_unread::chat_id.eq(room_id),
                            chat_unread::user_id.eq(a),
                            chat_unread::unread_count.eq(0),
                        ),
                        (
                            chat_unread::chat_id.eq(room_id),
                            chat_unread::user_id.eq(b),
                            chat_unread::unread_count.eq(0),
                        ),
                    ])
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;

                let room = load_room(conn, room_id).await?;
                Ok((request, room))
            }
            .scope_boxed()
        })
        .await
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn get_chat_room(&self, id: Uuid) -> Result<Option<ChatRoom>> {
        let mut conn = self.conn().await?;
        load_room(&mut conn, id).await
    }

    async fn find_chat_room(&self, a: Uuid, b: Uuid) -> Result<Option<ChatRoom>> {
        let (a, b) = ordered_pair(a, b);
        let mut conn = self.conn().await?;
        let rows: Vec<ChatRoomRow> = chat_rooms::table
            .filter(chat_rooms::participant_a.eq(a))
            .filter(chat_rooms::participant_b.eq(b))
            .select(ChatRoomRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rooms_with_unread(&mut conn, rows).await?.pop())
    }

    async fn chat_rooms_for(&self, user_id: Uuid) -> Result<Vec<ChatRoom>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ChatRoomRow> = chat_rooms::table
            .filter(
                chat_rooms::participant_a
                    .eq(user_id)
                    .or(chat_rooms::participant_b.eq(user_id)),
            )
            .order(chat_rooms::updated_at.desc())
            .select(ChatRoomRow::as_select())
            .load(&mut conn)
            .await?;
        rooms_with_unread(&mut conn, rows).await
    }

    async fn append_message(
        &self,
        message: &ChatMessage,
        preview: &str,
        receiver_id: Uuid,
    ) -> Result<(ChatMessage, ChatRoom)> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let mut message = message.clone();
        let preview = preview.to_string();

        conn.transaction::<_, Error, _>(|conn| {
            async move {
                let last_update: Option<DateTime<Utc>> = chat_rooms::table
                    .find(message.chat_id)
                    .for_update()
                    .select(chat_rooms::updated_at)
                    .first(conn)
                    .await
                    .optional()?;
                let last_update = last_update.ok_or(Error::NotFound("chat room"))?;
                message.created_at = message.created_at.max(last_update);

                diesel::insert_into(chat_messages::table)
                    .values((
                        chat_messages::id.eq(message.id),
                        chat_messages::chat_id.eq(message.chat_id),
                        chat_messages::sender_id.eq(message.sender_id),
                        chat_messages::text.eq(&message.text),
                        chat_messages::message_type.eq(message.message_type.as_str()),
                        chat_messages::file_url.eq(&message.file_url),
                        chat_messages::file_name.eq(&message.file_name),
                        chat_messages::created_at.eq(message.created_at),
                    ))
                    .execute(conn)
                    .await?;

                diesel::update(chat_rooms::table.find(message.chat_id))
                    .set((
                        chat_rooms::last_message.eq(Some(&preview)),
                        chat_rooms::updated_at.eq(message.created_at),
                    ))
                    .execute(conn)
                    .await?;

                diesel::insert_into(chat_unread::table)
                    .values((
                        chat_unread::chat_id.eq(message.chat_id),
                        chat_unread::user_id.eq(receiver_id),
                        chat_unread::unread_count.eq(1),
                    ))
                    .on_conflict((chat_unread::chat_id, chat_unread::user_id))
                    .do_update()
                    .set(chat_unread::unread_count.eq(chat_unread::unread_count + 1))
                    .execute(conn)
                    .await?;

                let room = load_room(conn, message.chat_id)
                    .await?
                    .ok_or(Error::NotFound("chat room"))?;
                Ok((message, room))
            }
            .scope_boxed()
        })
        .await
    }

    async fn messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ChatMessageRow> = chat_messages::table
            .filter(chat_messages::chat_id.eq(chat_id))
            .order(chat_messages::created_at.asc())
            .select(ChatMessageRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn reset_unread(&self, chat_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let exists: Option<Uuid> = chat_rooms::table
            .find(chat_id)
            .select(chat_rooms::id)
            .first(&mut conn)
            .await
            .optional()?;
        if exists.is_none() {
            return Err(Error::NotFound("chat room"));
        }

        diesel::update(
            chat_unread::table
                .filter(chat_unread::chat_id.eq(chat_id))
                .filter(chat_unread::user_id.eq(user_id)),
        )
        .set(chat_unread::unread_count.eq(0))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn total_unread(&self, user_id: Uuid) -> Result<u64> {
        let mut conn = self.conn().await?;
        let total: Option<i64> = chat_unread::table
            .filter(chat_unread::user_id.eq(user_id))
            .select(diesel::dsl::sum(chat_unread::unread_count))
            .first(&mut conn)
            .await?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }
}

#[async_trait]
impl CrmStore for PgStore {
    async fn insert_case(&self, case: &Case) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(cases::table)
            .values((
                cases::id.eq(case.id),
                cases::lawyer_id.eq(case.lawyer_id),
                cases::client_id.eq(case.client_id),
                cases::title.eq(&case.title),
                cases::description.eq(&case.description),
                cases::status.eq(case.status.as_str()),
                cases::created_at.eq(case.created_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_case(&self, id: Uuid) -> Result<Option<Case>> {
        let mut conn = self.conn().await?;
        let row: Option<CaseRow> = cases::table
            .find(id)
            .select(CaseRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Case::try_from).transpose()
    }

    async fn cases_for_lawyer(&self, lawyer_id: Uuid) -> Result<Vec<Case>> {
        let mut conn = self.conn().await?;
        let rows: Vec<CaseRow> = cases::table
            .filter(cases::lawyer_id.eq(lawyer_id))
            .order(cases::created_at.desc())
            .select(CaseRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn set_case_status(&self, id: Uuid, status: CaseStatus) -> Result<Case> {
        let mut conn = self.conn().await?;
        let row: Option<CaseRow> = diesel::update(cases::table.find(id))
            .set(cases::status.eq(status.as_str()))
            .returning(CaseRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;
        row.ok_or(Error::NotFound("case"))?.try_into()
    }

    async fn insert_time_entry(&self, entry: &TimeEntry) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(time_entries::table)
            .values((
                time_entries::id.eq(entry.id),
                time_entries::case_id.eq(entry.case_id),
                time_entries::lawyer_id.eq(entry.lawyer_id),
                time_entries::start_time.eq(entry.start_time),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_time_entry(&self, id: Uuid) -> Result<Option<TimeEntry>> {
        let mut conn = self.conn().await?;
        let row: Option<TimeEntryRow> = time_entries::table
            .find(id)
            .select(TimeEntryRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(TimeEntry::from))
    }

    async fn time_entries_for_case(&self, case_id: Uuid) -> Result<Vec<TimeEntry>> {
        let mut conn = self.conn().await?;
        let rows: Vec<TimeEntryRow> = time_entries::table
            .filter(time_entries::case_id.eq(case_id))
            .order(time_entries::start_time.asc())
            .select(TimeEntryRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(TimeEntry::from).collect())
    }

    async fn stop_time_entry(&self, id: Uuid, stop: &TimeEntryStop) -> Result<Option<TimeEntry>> {
        let mut conn = self.conn().await?;
        let row: Option<TimeEntryRow> = diesel::update(
            time_entries::table
                .find(id)
                .filter(time_entries::end_time.is_null()),
        )
        .set((
            time_entries::end_time.eq(stop.end_time),
            time_entries::duration_minutes.eq(stop.duration_minutes),
            time_entries::rate_per_hour.eq(stop.rate_per_hour),
            time_entries::total_amount.eq(stop.total_amount),
        ))
        .returning(TimeEntryRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        if let Some(row) = row {
            return Ok(Some(row.into()));
        }

        let exists: Option<Uuid> = time_entries::table
            .find(id)
            .select(time_entries::id)
            .first(&mut conn)
            .await
            .optional()?;
        match exists {
            Some(_) => Ok(None),
            None => Err(Error::NotFound("time entry")),
        }
    }

    async fn insert_document(&self, document: &CaseDocument) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(case_documents::table)
            .values((
                case_documents::id.eq(document.id),
                case_documents::case_id.eq(document.case_id),
                case_documents::lawyer_id.eq(document.lawyer_id),
                case_documents::name.eq(&document.name),
                case_documents::file_url.eq(&document.file_url),
                case_documents::content_type.eq(&document.content_type),
                case_documents::size_bytes.eq(document.size_bytes),
                case_documents::uploaded_at.eq(document.uploaded_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<CaseDocument>> {
        let mut conn = self.conn().await?;
        let row: Option<DocumentRow> = case_documents::table
            .find(id)
            .select(DocumentRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(CaseDocument::from))
    }

    async fn documents_for_case(&self, case_id: Uuid) -> Result<Vec<CaseDocument>> {
        let mut conn = self.conn().await?;
        let rows: Vec<DocumentRow> = case_documents::table
            .filter(case_documents::case_id.eq(case_id))
            .order(case_documents::uploaded_at.desc())
            .select(DocumentRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(CaseDocument::from).collect())
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(case_documents::table.find(id))
            .execute(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl MarketplaceStore for PgStore {
    async fn insert_request(&self, request: &CommunityRequest) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(community_requests::table)
            .values((
                community_requests::id.eq(request.id),
                community_requests::client_id.eq(request.client_id),
                community_requests::title.eq(&request.title),
                community_requests::description.eq(&request.description),
                community_requests::category.eq(&request.category),
                community_requests::budget.eq(request.budget),
                community_requests::city.eq(&request.city),
                community_requests::status.eq(request.status.as_str()),
                community_requests::proposal_count.eq(request.proposal_count),
                community_requests::created_at.eq(request.created_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<CommunityRequest>> {
        let mut conn = self.conn().await?;
        let row: Option<CommunityRequestRow> = community_requests::table
            .find(id)
            .select(CommunityRequestRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(CommunityRequest::try_from).transpose()
    }

    async fn requests_with_status(
        &self,
        status: CommunityRequestStatus,
        category: Option<&str>,
    ) -> Result<Vec<CommunityRequest>> {
        let mut conn = self.conn().await?;
        let mut query = community_requests::table
            .filter(community_requests::status.eq(status.as_str()))
            .order(community_requests::created_at.desc())
            .select(CommunityRequestRow::as_select())
            .into_boxed();
        if let Some(category) = category {
            query = query.filter(community_requests::category.ilike(category.to_string()));
        }
        let rows: Vec<CommunityRequestRow> = query.load(&mut conn).await?;
        convert_all(rows)
    }

    async fn requests_by_client(&self, client_id: Uuid) -> Result<Vec<CommunityRequest>> {
        let mut conn = self.conn().await?;
        let rows: Vec<CommunityRequestRow> = community_requests::table
            .filter(community_requests::client_id.eq(client_id))
            .order(community_requests::created_at.desc())
            .select(CommunityRequestRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn transition_request(
        &self,
        id: Uuid,
        from: &[CommunityRequestStatus],
        to: CommunityRequestStatus,
    ) -> Result<CommunityRequest> {
        let mut conn = self.conn().await?;
        let from: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();
        let row: Option<CommunityRequestRow> = diesel::update(
            community_requests::table
                .find(id)
                .filter(community_requests::status.eq_any(from)),
        )
        .set(community_requests::status.eq(to.as_str()))
        .returning(CommunityRequestRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        if let Some(row) = row {
            return row.try_into();
        }

        let current: Option<String> = community_requests::table
            .find(id)
            .select(community_requests::status)
            .first(&mut conn)
            .await
            .optional()?;
        match current {
            Some(current) => Err(Error::InvalidState(format!(
                "request is {}, cannot move to {}",
                current, to
            ))),
            None => Err(Error::NotFound("request")),
        }
    }

    async fn insert_proposal(&self, proposal: &RequestProposal) -> Result<CommunityRequest> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let proposal = proposal.clone();

        conn.transaction::<_, Error, _>(|conn| {
            async move {
                let row: Option<CommunityRequestRow> = community_requests::table
                    .find(proposal.request_id)
                    .for_update()
                    .select(CommunityRequestRow::as_select())
                    .first(conn)
                    .await
                    .optional()?;
                let request: CommunityRequest = row.ok_or(Error::NotFound("request"))?.try_into()?;
                if !request.status.accepts_proposals() {
                    return Err(Error::InvalidState(format!(
                        "request is {} and no longer takes proposals",
                        request.status
                    )));
                }

                diesel::insert_into(request_proposals::table)
                    .values((
                        request_proposals::id.eq(proposal.id),
                        request_proposals::request_id.eq(proposal.request_id),
                        request_proposals::lawyer_id.eq(proposal.lawyer_id),
                        request_proposals::proposed_price.eq(proposal.proposed_price),
                        request_proposals::message.eq(&proposal.message),
                        request_proposals::estimated_duration.eq(&proposal.estimated_duration),
                        request_proposals::status.eq(proposal.status.as_str()),
                        request_proposals::created_at.eq(proposal.created_at),
                    ))
                    .execute(conn)
                    .await?;

                let row: CommunityRequestRow = diesel::update(community_requests::table.find(proposal.request_id))
                    .set(community_requests::proposal_count.eq(community_requests::proposal_count + 1))
                    .returning(CommunityRequestRow::as_returning())
                    .get_result(conn)
                    .await?;
                row.try_into()
            }
            .scope_boxed()
        })
        .await
    }

    async fn get_proposal(&self, id: Uuid) -> Result<Option<RequestProposal>> {
        let mut conn = self.conn().await?;
        let row: Option<ProposalRow> = request_proposals::table
            .find(id)
            .select(ProposalRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(RequestProposal::try_from).transpose()
    }

    async fn proposals_for_request(&self, request_id: Uuid) -> Result<Vec<RequestProposal>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ProposalRow> = request_proposals::table
            .filter(request_proposals::request_id.eq(request_id))
            .order(request_proposals::created_at.asc())
            .select(ProposalRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn accept_proposal(
        &self,
        request_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<(CommunityRequest, RequestProposal)> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, Error, _>(|conn| {
            async move {
                let request_row: Option<CommunityRequestRow> = community_requests::table
                    .find(request_id)
                    .for_update()
                    .select(CommunityRequestRow::as_select())
                    .first(conn)
                    .await
                    .optional()?;
                let mut request: CommunityRequest =
                    request_row.ok_or(Error::NotFound("request"))?.try_into()?;

                let proposal_row: Option<ProposalRow> = request_proposals::table
                    .find(proposal_id)
                    .filter(request_proposals::request_id.eq(request_id))
                    .for_update()
                    .select(ProposalRow::as_select())
                    .first(conn)
                    .await
                    .optional()?;
                let mut proposal: RequestProposal =
                    proposal_row.ok_or(Error::NotFound("proposal"))?.try_into()?;

                if !request.status.accepts_proposals() {
                    return Err(Error::InvalidState(format!("request is already {}", request.status)));
                }
                if proposal.status != ProposalStatus::Pending {
                    return Err(Error::InvalidState(format!("proposal is already {}", proposal.status)));
                }

                diesel::update(request_proposals::table.find(proposal_id))
                    .set(request_proposals::status.eq(ProposalStatus::Accepted.as_str()))
                    .execute(conn)
                    .await?;
                diesel::update(community_requests::table.find(request_id))
                    .set(community_requests::status.eq(CommunityRequestStatus::Accepted.as_str()))
                    .execute(conn)
                    .await?;

                proposal.status = ProposalStatus::Accepted;
                request.status = CommunityRequestStatus::Accepted;
                Ok((request, proposal))
            }
            .scope_boxed()
        })
        .await
    }
}
