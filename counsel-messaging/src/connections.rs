use counsel_core::realtime::{publish_json, topics};
use counsel_core::types::{ChatRoom, ConnectionRequest, ConnectionStatus, RequestStatus, Role};
use counsel_core::store::Store;
use counsel_core::{Clock, CounselContext, Error, RealtimeBus, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Created(ConnectionRequest),
    /// An identical request was still pending; nothing was written.
    AlreadyPending(ConnectionRequest),
}

impl SendOutcome {
    pub fn request(&self) -> &ConnectionRequest {
        match self {
            SendOutcome::Created(request) | SendOutcome::AlreadyPending(request) => request,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, SendOutcome::Created(_))
    }
}

/// Pending request enriched with the sender's public profile.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingRequest {
    #[serde(flatten)]
    pub request: ConnectionRequest,
    pub sender_name: Option<String>,
    pub sender_photo_url: Option<String>,
}

pub struct ConnectionService {
    store: Arc<dyn Store>,
    bus: Arc<dyn RealtimeBus>,
    clock: Arc<dyn Clock>,
}

impl ConnectionService {
    pub fn new(ctx: &CounselContext) -> Self {
        Self::with_parts(ctx.store.clone(), ctx.bus.clone(), ctx.clock.clone())
    }

    pub fn with_parts(store: Arc<dyn Store>, bus: Arc<dyn RealtimeBus>, clock: Arc<dyn Clock>) -> Self {
        Self { store, bus, clock }
    }

    pub async fn send_connection_request(&self, sender_id: Uuid, receiver_id: Uuid) -> Result<SendOutcome> {
        if sender_id == receiver_id {
            return Err(Error::Validation("cannot connect with yourself".to_string()));
        }
        let receiver = self
            .store
            .get_profile(receiver_id)
            .await?
            .ok_or(Error::NotFound("receiver"))?;
        if receiver.role != Role::Lawyer {
            return Err(Error::Validation("connection requests can only be sent to lawyers".to_string()));
        }

        if let Some(existing) = self.store.find_pending_request(sender_id, receiver_id).await? {
            return Ok(SendOutcome::AlreadyPending(existing));
        }

        let request = ConnectionRequest {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            status: RequestStatus::Pending,
            created_at: self.clock.now(),
        };
        // A concurrent send may have won the race; the store hands back its row.
        let stored = self.store.insert_connection_request(&request).await?;
        if stored.id != request.id {
            return Ok(SendOutcome::AlreadyPending(stored));
        }

        tracing::info!(sender = %sender_id, receiver = %receiver_id, "Connection request sent");
        self.notify(receiver_id, &stored).await;
        Ok(SendOutcome::Created(stored))
    }

    /// Status of the most recent request a→b, falling back to b→a.
    pub async fn get_connection_status(&self, a: Uuid, b: Uuid) -> Result<ConnectionStatus> {
        if let Some(request) = self.store.latest_request(a, b).await? {
            return Ok(request.status.into());
        }
        if let Some(request) = self.store.latest_request(b, a).await? {
            return Ok(request.status.into());
        }
        Ok(ConnectionStatus::None)
    }

    /// Accepting also opens the pair's chat room in the same atomic write.
    pub async fn respond_to_connection_request(
        &self,
        actor: Uuid,
        request_id: Uuid,
        status: RequestStatus,
    ) -> Result<(ConnectionRequest, Option<ChatRoom>)> {
        if status == RequestStatus::Pending {
            return Err(Error::Validation("response must be accepted or rejected".to_string()));
        }
        let request = self
            .store
            .get_connection_request(request_id)
            .await?
            .ok_or(Error::NotFound("connection request"))?;
        if request.receiver_id != actor {
            return Err(Error::Forbidden("only the receiver can respond to a request".to_string()));
        }
        if request.status != RequestStatus::Pending {
            return Err(Error::InvalidState(format!("connection request is already {}", request.status)));
        }

        let (request, room) = self
            .store
            .resolve_connection_request(request_id, status, Uuid::new_v4(), self.clock.now())
            .await?;

        tracing::info!(
            request_id = %request.id,
            status = %request.status,
            chat_id = ?room.as_ref().map(|r| r.id),
            "Connection request answered"
        );
        self.notify(request.sender_id, &request).await;
        Ok((request, room))
    }

    /// Pending requests addressed to `user_id`, with sender profiles fetched in one lookup.
    pub async fn get_incoming_requests(&self, user_id: Uuid) -> Result<Vec<IncomingRequest>> {
        let requests = self.store.requests_to(user_id, RequestStatus::Pending).await?;
        let sender_ids: Vec<Uuid> = requests
            .iter()
            .map(|r| r.sender_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let senders: HashMap<Uuid, _> = self
            .store
            .get_profiles(&sender_ids)
            .await?
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect();

        Ok(requests
            .into_iter()
            .map(|request| {
                let sender = senders.get(&request.sender_id);
                IncomingRequest {
                    sender_name: sender.map(|p| p.name.clone()),
                    sender_photo_url: sender.and_then(|p| p.photo_url.clone()),
                    request,
                }
            })
            .collect())
    }

    pub async fn get_outgoing_requests(&self, user_id: Uuid) -> Result<Vec<ConnectionRequest>> {
        self.store.requests_from(user_id).await
    }

    async fn notify(&self, user_id: Uuid, request: &ConnectionRequest) {
        let topic = topics::connections(user_id);
        if let Err(e) = publish_json(self.bus.as_ref(), &topic, request).await {
            tracing::warn!(user_id = %user_id, "Failed to publish connection change: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use counsel_core::store::{ChatStore, ConnectionStore, ProfileStore};
    use counsel_core::types::UserProfile;
    use counsel_core::{ManualClock, MemoryBus, MemoryStore};

    struct Harness {
        store: Arc<MemoryStore>,
        service: ConnectionService,
        client: Uuid,
        lawyer: Uuid,
    }

    async fn profile(store: &MemoryStore, role: Role, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_profile(&UserProfile {
                id,
                role,
                name: name.to_string(),
                email: None,
                city: Some("Tashkent".to_string()),
                photo_url: Some(format!("https://img.example/{}.png", name)),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        id
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let service = ConnectionService::with_parts(
            store.clone(),
            Arc::new(MemoryBus::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let client = profile(&store, Role::Client, "client").await;
        let lawyer = profile(&store, Role::Lawyer, "lawyer").await;
        Harness { store, service, client, lawyer }
    }

    #[tokio::test]
    async fn test_duplicate_pending_request_is_not_created() {
        let h = harness().await;

        let first = h.service.send_connection_request(h.client, h.lawyer).await.unwrap();
        let second = h.service.send_connection_request(h.client, h.lawyer).await.unwrap();

        assert!(first.is_created());
        assert_eq!(second, SendOutcome::AlreadyPending(first.request().clone()));
        assert_eq!(h.store.requests_to(h.lawyer, RequestStatus::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_is_symmetric_for_answered_requests() {
        for answer in [RequestStatus::Accepted, RequestStatus::Rejected] {
            let h = harness().await;
            assert_eq!(
                h.service.get_connection_status(h.client, h.lawyer).await.unwrap(),
                ConnectionStatus::None
            );

            let sent = h.service.send_connection_request(h.client, h.lawyer).await.unwrap();
            h.service
                .respond_to_connection_request(h.lawyer, sent.request().id, answer)
                .await
                .unwrap();

            let forward = h.service.get_connection_status(h.client, h.lawyer).await.unwrap();
            let backward = h.service.get_connection_status(h.lawyer, h.client).await.unwrap();
            assert_eq!(forward, backward);
            assert_eq!(forward, ConnectionStatus::from(answer));
        }
    }

    #[tokio::test]
    async fn test_accept_creates_exactly_one_room() {
        let h = harness().await;
        let sent = h.service.send_connection_request(h.client, h.lawyer).await.unwrap();

        let (request, room) = h
            .service
            .respond_to_connection_request(h.lawyer, sent.request().id, RequestStatus::Accepted)
            .await
            .unwrap();
        let room = room.unwrap();

        assert_eq!(request.status, RequestStatus::Accepted);
        assert!(room.has_participant(h.client));
        assert!(room.has_participant(h.lawyer));

        // A later request between the same pair reuses the room.
        let again = h.service.send_connection_request(h.client, h.lawyer).await.unwrap();
        let (_, second_room) = h
            .service
            .respond_to_connection_request(h.lawyer, again.request().id, RequestStatus::Accepted)
            .await
            .unwrap();
        assert_eq!(second_room.unwrap().id, room.id);

        let client_rooms = h.store.chat_rooms_for(h.client).await.unwrap();
        assert_eq!(client_rooms.len(), 1);
        assert_eq!(client_rooms[0].unread_for(h.client), 0);
    }

    #[tokio::test]
    async fn test_only_receiver_responds_once() {
        let h = harness().await;
        let sent = h.service.send_connection_request(h.client, h.lawyer).await.unwrap();
        let id = sent.request().id;

        let err = h
            .service
            .respond_to_connection_request(h.client, id, RequestStatus::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        h.service
            .respond_to_connection_request(h.lawyer, id, RequestStatus::Rejected)
            .await
            .unwrap();
        let err = h
            .service
            .respond_to_connection_request(h.lawyer, id, RequestStatus::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(h.store.find_chat_room(h.client, h.lawyer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requests_go_to_lawyers_only() {
        let h = harness().await;
        let other_client = profile(&h.store, Role::Client, "other").await;

        let err = h
            .service
            .send_connection_request(h.lawyer, other_client)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = h.service.send_connection_request(h.lawyer, h.lawyer).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_incoming_requests_carry_sender_profile() {
        let h = harness().await;
        let second_client = profile(&h.store, Role::Client, "second").await;
        h.service.send_connection_request(h.client, h.lawyer).await.unwrap();
        h.service.send_connection_request(second_client, h.lawyer).await.unwrap();

        let incoming = h.service.get_incoming_requests(h.lawyer).await.unwrap();
        assert_eq!(incoming.len(), 2);
        let names: HashSet<_> = incoming.iter().filter_map(|r| r.sender_name.clone()).collect();
        assert!(names.contains("client"));
        assert!(names.contains("second"));
        assert!(incoming.iter().all(|r| r.sender_photo_url.is_some()));

        let outgoing = h.service.get_outgoing_requests(h.client).await.unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].receiver_id, h.lawyer);
    }
}
