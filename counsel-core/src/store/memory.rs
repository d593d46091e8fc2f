use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{ChatStore, ConnectionStore, CrmStore, MarketplaceStore, ProfileStore};
use crate::error::{Error, Result};
use crate::types::*;

#[derive(Default)]
struct Tables {
    profiles: HashMap<Uuid, UserProfile>,
    lawyers: HashMap<Uuid, LawyerProfile>,
    connection_requests: Vec<ConnectionRequest>,
    rooms: HashMap<Uuid, ChatRoom>,
    messages: HashMap<Uuid, Vec<ChatMessage>>,
    cases: Vec<Case>,
    time_entries: Vec<TimeEntry>,
    documents: Vec<CaseDocument>,
    requests: Vec<CommunityRequest>,
    proposals: Vec<RequestProposal>,
}

/// Process-local backend. Each trait method runs under a single lock, which
/// gives multi-step writes the same all-or-nothing behaviour as a transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored lawyer profile wholesale, for seeding fixtures.
    pub fn put_lawyer_profile(&self, lawyer: LawyerProfile) {
        self.tables().lawyers.insert(lawyer.user_id, lawyer);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn matches_ignore_case(value: Option<&str>, wanted: &str) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case(wanted))
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get_profile(&self, id: Uuid) -> Result<Option<UserProfile>> {
        Ok(self.tables().profiles.get(&id).cloned())
    }

    async fn get_profiles(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>> {
        let tables = self.tables();
        Ok(ids.iter().filter_map(|id| tables.profiles.get(id).cloned()).collect())
    }

    async fn create_profile(&self, profile: &UserProfile) -> Result<UserProfile> {
        let mut tables = self.tables();
        Ok(tables
            .profiles
            .entry(profile.id)
            .or_insert_with(|| profile.clone())
            .clone())
    }

    async fn update_profile_details(&self, id: Uuid, update: &ProfileUpdate) -> Result<UserProfile> {
        let mut tables = self.tables();
        let stored = tables.profiles.get_mut(&id).ok_or(Error::NotFound("profile"))?;
        if let Some(name) = &update.name {
            stored.name = name.clone();
        }
        if let Some(city) = &update.city {
            stored.city = Some(city.clone());
        }
        if let Some(photo_url) = &update.photo_url {
            stored.photo_url = Some(photo_url.clone());
        }
        Ok(stored.clone())
    }

    async fn set_role(&self, id: Uuid, role: Role) -> Result<UserProfile> {
        let mut tables = self.tables();
        let stored = tables.profiles.get_mut(&id).ok_or(Error::NotFound("profile"))?;
        stored.role = role;
        let profile = stored.clone();

        if role == Role::Lawyer {
            tables.lawyers.entry(id).or_insert_with(|| LawyerProfile::empty(id));
        } else {
            tables.lawyers.remove(&id);
        }
        Ok(profile)
    }

    async fn get_lawyer_profile(&self, user_id: Uuid) -> Result<Option<LawyerProfile>> {
        Ok(self.tables().lawyers.get(&user_id).cloned())
    }

    async fn ensure_lawyer_profile(&self, user_id: Uuid) -> Result<LawyerProfile> {
        let mut tables = self.tables();
        Ok(tables
            .lawyers
            .entry(user_id)
            .or_insert_with(|| LawyerProfile::empty(user_id))
            .clone())
    }

    async fn update_lawyer_details(&self, user_id: Uuid, update: &LawyerProfileUpdate) -> Result<LawyerProfile> {
        let mut tables = self.tables();
        let stored = tables.lawyers.get_mut(&user_id).ok_or(Error::NotFound("lawyer profile"))?;
        if let Some(specializations) = &update.specializations {
            stored.specializations = specializations.clone();
        }
        if let Some(price) = update.price {
            stored.price = Some(price);
        }
        if let Some(banner_url) = &update.banner_url {
            stored.banner_url = Some(banner_url.clone());
        }
        Ok(stored.clone())
    }

    async fn append_verification_document(&self, user_id: Uuid, url: &str) -> Result<LawyerProfile> {
        let mut tables = self.tables();
        let stored = tables.lawyers.get_mut(&user_id).ok_or(Error::NotFound("lawyer profile"))?;
        stored.verification_documents.push(url.to_string());
        Ok(stored.clone())
    }

    async fn set_lawyer_verified(&self, user_id: Uuid, verified: bool) -> Result<LawyerProfile> {
        let mut tables = self.tables();
        let is_lawyer = tables.profiles.get(&user_id).is_some_and(|p| p.role == Role::Lawyer);
        let stored = tables
            .lawyers
            .get_mut(&user_id)
            .filter(|_| is_lawyer)
            .ok_or(Error::NotFound("lawyer profile"))?;
        stored.verified = verified;
        Ok(stored.clone())
    }

    async fn search_lawyers(&self, filter: &LawyerSearch) -> Result<Vec<LawyerListing>> {
        let tables = self.tables();
        let mut listings: Vec<LawyerListing> = tables
            .lawyers
            .values()
            .filter_map(|lawyer| {
                let profile = tables.profiles.get(&lawyer.user_id)?;
                (profile.role == Role::Lawyer).then(|| LawyerListing {
                    profile: profile.clone(),
                    lawyer: lawyer.clone(),
                })
            })
            .filter(|listing| {
                filter
                    .city
                    .as_deref()
                    .map_or(true, |city| matches_ignore_case(listing.profile.city.as_deref(), city))
            })
            .filter(|listing| {
                filter.specialization.as_deref().map_or(true, |wanted| {
                    listing.lawyer.specializations.iter().any(|s| s == wanted)
                })
            })
            .filter(|listing| {
                filter
                    .max_price
                    .map_or(true, |max| listing.lawyer.price.is_some_and(|price| price <= max))
            })
            .filter(|listing| !filter.verified_only || listing.lawyer.verified)
            .collect();

        listings.sort_by(|a, b| b.lawyer.rating.total_cmp(&a.lawyer.rating));
        Ok(listings)
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn get_connection_request(&self, id: Uuid) -> Result<Option<ConnectionRequest>> {
        Ok(self
            .tables()
            .connection_requests
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn find_pending_request(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<ConnectionRequest>> {
        Ok(self
            .tables()
            .connection_requests
            .iter()
            .find(|r| {
                r.sender_id == sender_id
                    && r.receiver_id == receiver_id
                    && r.status == RequestStatus::Pending
            })
            .cloned())
    }

    async fn insert_connection_request(&self, request: &ConnectionRequest) -> Result<ConnectionRequest> {
        let mut tables = self.tables();
        if let Some(existing) = tables.connection_requests.iter().find(|r| {
            r.sender_id == request.sender_id
                && r.receiver_id == request.receiver_id
                && r.status == RequestStatus::Pending
        }) {
            return Ok(existing.clone());
        }
        tables.connection_requests.push(request.clone());
        Ok(request.clone())
    }

    async fn latest_request(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Option<ConnectionRequest>> {
        Ok(self
            .tables()
            .connection_requests
            .iter()
            .rev()
            .find(|r| r.sender_id == sender_id && r.receiver_id == receiver_id)
            .cloned())
    }

    async fn requests_to(&self, receiver_id: Uuid, status: RequestStatus) -> Result<Vec<ConnectionRequest>> {
        Ok(self
            .tables()
            .connection_requests
            .iter()
            .filter(|r| r.receiver_id == receiver_id && r.status == status)
            .cloned()
            .collect())
    }

    async fn requests_from(&self, sender_id: Uuid) -> Result<Vec<ConnectionRequest>> {
        Ok(self
            .tables()
            .connection_requests
            .iter()
            .filter(|r| r.sender_id == sender_id)
            .cloned()
            .collect())
    }

    async fn resolve_connection_request(
        &self,
        id: Uuid,
        status: RequestStatus,
        new_room_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(ConnectionRequest, Option<ChatRoom>)> {
        let mut tables = self.tables();
        let request = tables
            .connection_requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(Error::NotFound("connection request"))?;

        if request.status != RequestStatus::Pending {
            return Err(Error::InvalidState(format!(
                "connection request is already {}",
                request.status
            )));
        }
        request.status = status;
        let request = request.clone();

        if status != RequestStatus::Accepted {
            return Ok((request, None));
        }

        let (a, b) = ordered_pair(request.sender_id, request.receiver_id);
        let existing = tables
            .rooms
            .values()
            .find(|room| room.participants == [a, b])
            .cloned();
        let room = match existing {
            Some(room) => room,
            None => {
                let room = ChatRoom {
                    id: new_room_id,
                    participants: [a, b],
                    last_message: None,
                    updated_at: at,
                    unread_counts: HashMap::from([(a, 0), (b, 0)]),
                };
                tables.rooms.insert(room.id, room.clone());
                room
            }
        };
        Ok((request, Some(room)))
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn get_chat_room(&self, id: Uuid) -> Result<Option<ChatRoom>> {
        Ok(self.tables().rooms.get(&id).cloned())
    }

    async fn find_chat_room(&self, a: Uuid, b: Uuid) -> Result<Option<ChatRoom>> {
        let (a, b) = ordered_pair(a, b);
        Ok(self
            .tables()
            .rooms
            .values()
            .find(|room| room.participants == [a, b])
            .cloned())
    }

    async fn chat_rooms_for(&self, user_id: Uuid) -> Result<Vec<ChatRoom>> {
        let mut rooms: Vec<ChatRoom> = self
            .tables()
            .rooms
            .values()
            .filter(|room| room.has_participant(user_id))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rooms)
    }

    async fn append_message(
        &self,
        message: &ChatMessage,
        preview: &str,
        receiver_id: Uuid,
    ) -> Result<(ChatMessage, ChatRoom)> {
        let mut tables = self.tables();
        let room = tables
            .rooms
            .get_mut(&message.chat_id)
            .ok_or(Error::NotFound("chat room"))?;

        let mut message = message.clone();
        message.created_at = message.created_at.max(room.updated_at);

        room.last_message = Some(preview.to_string());
        room.updated_at = message.created_at;
        *room.unread_counts.entry(receiver_id).or_insert(0) += 1;
        let room = room.clone();

        tables
            .messages
            .entry(message.chat_id)
            .or_default()
            .push(message.clone());
        Ok((message, room))
    }

    async fn messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>> {
        Ok(self
            .tables()
            .messages
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn reset_unread(&self, chat_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut tables = self.tables();
        let room = tables.rooms.get_mut(&chat_id).ok_or(Error::NotFound("chat room"))?;
        if room.has_participant(user_id) {
            room.unread_counts.insert(user_id, 0);
        }
        Ok(())
    }

    async fn total_unread(&self, user_id: Uuid) -> Result<u64> {
        Ok(self
            .tables()
            .rooms
            .values()
            .filter(|room| room.has_participant(user_id))
            .map(|room| u64::from(room.unread_for(user_id)))
            .sum())
    }
}

#[async_trait]
impl CrmStore for MemoryStore {
    async fn insert_case(&self, case: &Case) -> Result<()> {
        self.tables().cases.push(case.clone());
        Ok(())
    }

    async fn get_case(&self, id: Uuid) -> Result<Option<Case>> {
        Ok(self.tables().cases.iter().find(|c| c.id == id).cloned())
    }

    async fn cases_for_lawyer(&self, lawyer_id: Uuid) -> Result<Vec<Case>> {
        let mut cases: Vec<Case> = self
            .tables()
            .cases
            .iter()
            .filter(|c| c.lawyer_id == lawyer_id)
            .cloned()
            .collect();
        cases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(cases)
    }

    async fn set_case_status(&self, id: Uuid, status: CaseStatus) -> Result<Case> {
        let mut tables = self.tables();
        let case = tables
            .cases
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(Error::NotFound("case"))?;
        case.status = status;
        Ok(case.clone())
    }

    async fn insert_time_entry(&self, entry: &TimeEntry) -> Result<()> {
        self.tables().time_entries.push(entry.clone());
        Ok(())
    }

    async fn get_time_entry(&self, id: Uuid) -> Result<Option<TimeEntry>> {
        Ok(self.tables().time_entries.iter().find(|e| e.id == id).cloned())
    }

    async fn time_entries_for_case(&self, case_id: Uuid) -> Result<Vec<TimeEntry>> {
        Ok(self
            .tables()
            .time_entries
            .iter()
            .filter(|e| e.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn stop_time_entry(&self, id: Uuid, stop: &TimeEntryStop) -> Result<Option<TimeEntry>> {
        let mut tables = self.tables();
        let entry = tables
            .time_entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(Error::NotFound("time entry"))?;
        if !entry.is_running() {
            return Ok(None);
        }
        entry.end_time = Some(stop.end_time);
        entry.duration_minutes = Some(stop.duration_minutes);
        entry.rate_per_hour = Some(stop.rate_per_hour);
        entry.total_amount = Some(stop.total_amount);
        Ok(Some(entry.clone()))
    }

    async fn insert_document(&self, document: &CaseDocument) -> Result<()> {
        self.tables().documents.push(document.clone());
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<CaseDocument>> {
        Ok(self.tables().documents.iter().find(|d| d.id == id).cloned())
    }

    async fn documents_for_case(&self, case_id: Uuid) -> Result<Vec<CaseDocument>> {
        let mut documents: Vec<CaseDocument> = self
            .tables()
            .documents
            .iter()
            .filter(|d| d.case_id == case_id)
            .cloned()
            .collect();
        documents.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(documents)
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables();
        let before = tables.documents.len();
        tables.documents.retain(|d| d.id != id);
        Ok(tables.documents.len() != before)
    }
}

#[async_trait]
impl MarketplaceStore for MemoryStore {
    async fn insert_request(&self, request: &CommunityRequest) -> Result<()> {
        self.tables().requests.push(request.clone());
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<CommunityRequest>> {
        Ok(self.tables().requests.iter().find(|r| r.id == id).cloned())
    }

    async fn requests_with_status(
        &self,
        status: CommunityRequestStatus,
        category: Option<&str>,
    ) -> Result<Vec<CommunityRequest>> {
        let mut requests: Vec<CommunityRequest> = self
            .tables()
            .requests
            .iter()
            .filter(|r| r.status == status)
            .filter(|r| category.map_or(true, |c| r.category.eq_ignore_ascii_case(c)))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn requests_by_client(&self, client_id: Uuid) -> Result<Vec<CommunityRequest>> {
        let mut requests: Vec<CommunityRequest> = self
            .tables()
            .requests
            .iter()
            .filter(|r| r.client_id == client_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn transition_request(
        &self,
        id: Uuid,
        from: &[CommunityRequestStatus],
        to: CommunityRequestStatus,
    ) -> Result<CommunityRequest> {
        let mut tables = self.tables();
        let request = tables
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(Error::NotFound("request"))?;
        if !from.contains(&request.status) {
            return Err(Error::InvalidState(format!(
                "request is {}, cannot move to {}",
                request.status, to
            )));
        }
        request.status = to;
        Ok(request.clone())
    }

    async fn insert_proposal(&self, proposal: &RequestProposal) -> Result<CommunityRequest> {
        let mut tables = self.tables();
        let request = tables
            .requests
            .iter_mut()
            .find(|r| r.id == proposal.request_id)
            .ok_or(Error::NotFound("request"))?;
        if !request.status.accepts_proposals() {
            return Err(Error::InvalidState(format!(
                "request is {} and no longer takes proposals",
                request.status
            )));
        }
        request.proposal_count += 1;
        let request = request.clone();
        tables.proposals.push(proposal.clone());
        Ok(request)
    }

    async fn get_proposal(&self, id: Uuid) -> Result<Option<RequestProposal>> {
        Ok(self.tables().proposals.iter().find(|p| p.id == id).cloned())
    }

    async fn proposals_for_request(&self, request_id: Uuid) -> Result<Vec<RequestProposal>> {
        Ok(self
            .tables()
            .proposals
            .iter()
            .filter(|p| p.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn accept_proposal(
        &self,
        request_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<(CommunityRequest, RequestProposal)> {
        let mut tables = self.tables();
        let Tables {
            requests,
            proposals,
            ..
        } = &mut *tables;

        let request = requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or(Error::NotFound("request"))?;
        let proposal = proposals
            .iter_mut()
            .find(|p| p.id == proposal_id && p.request_id == request_id)
            .ok_or(Error::NotFound("proposal"))?;

        if !request.status.accepts_proposals() {
            return Err(Error::InvalidState(format!("request is already {}", request.status)));
        }
        if proposal.status != ProposalStatus::Pending {
            return Err(Error::InvalidState(format!("proposal is already {}", proposal.status)));
        }

        proposal.status = ProposalStatus::Accepted;
        request.status = CommunityRequestStatus::Accepted;
        Ok((request.clone(), proposal.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn lawyer(store: &MemoryStore) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_profile(&UserProfile {
                id,
                role: Role::Lawyer,
                name: "Lola".to_string(),
                email: None,
                city: Some("Tashkent".to_string()),
                photo_url: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store.ensure_lawyer_profile(id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_detail_writes_leave_other_columns() {
        let store = MemoryStore::new();
        let id = lawyer(&store).await;
        store.set_lawyer_verified(id, true).await.unwrap();

        let update = ProfileUpdate {
            photo_url: Some("https://img.example/lola.png".to_string()),
            ..Default::default()
        };
        let profile = store.update_profile_details(id, &update).await.unwrap();
        assert_eq!(profile.role, Role::Lawyer);
        assert_eq!(profile.city.as_deref(), Some("Tashkent"));

        let update = LawyerProfileUpdate {
            banner_url: Some("https://img.example/banner.png".to_string()),
            ..Default::default()
        };
        let listing = store.update_lawyer_details(id, &update).await.unwrap();
        assert!(listing.verified);

        let listing = store.append_verification_document(id, "license.pdf").await.unwrap();
        assert!(listing.verified);
        assert_eq!(listing.banner_url.as_deref(), Some("https://img.example/banner.png"));
        assert_eq!(listing.verification_documents, vec!["license.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_set_role_moves_lawyer_row() {
        let store = MemoryStore::new();
        let id = lawyer(&store).await;

        store.set_role(id, Role::Client).await.unwrap();
        assert!(store.get_lawyer_profile(id).await.unwrap().is_none());
        assert!(matches!(
            store.set_lawyer_verified(id, true).await.unwrap_err(),
            Error::NotFound(_)
        ));

        store.set_role(id, Role::Lawyer).await.unwrap();
        let fresh = store.get_lawyer_profile(id).await.unwrap().unwrap();
        assert_eq!(fresh, LawyerProfile::empty(id));
    }
}
