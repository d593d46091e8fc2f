use async_trait::async_trait;
use chrono::{DateTime, Utc};
use counsel_core::realtime::{publish_json, topics};
use counsel_core::store::Store;
use counsel_core::types::{ChatMessage, ChatRoom, MessageType, UserProfile};
use counsel_core::{ChatCipher, Clock, CounselContext, Error, RealtimeBus, Result};
use counsel_signaling::CallLog;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    File,
}

/// Uploaded file referenced by its public URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: Option<String>,
}

/// A room as listed for one of its participants.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub id: Uuid,
    pub other_participant_id: Uuid,
    pub other_participant: Option<UserProfile>,
    pub last_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub unread_count: u32,
}

#[derive(Serialize)]
struct MessageNotice {
    chat_id: Uuid,
    message_id: Uuid,
}

#[derive(Serialize)]
struct UnreadNotice {
    user_id: Uuid,
}

/// Two-party chat rooms with per-participant unread counters.
///
/// Message text and room previews are stored encrypted with the room key and
/// decrypted on every read.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn Store>,
    bus: Arc<dyn RealtimeBus>,
    clock: Arc<dyn Clock>,
    cipher: ChatCipher,
}

impl ChatService {
    pub fn new(ctx: &CounselContext) -> Self {
        Self::with_parts(ctx.store.clone(), ctx.bus.clone(), ctx.clock.clone(), ctx.cipher.clone())
    }

    pub fn with_parts(
        store: Arc<dyn Store>,
        bus: Arc<dyn RealtimeBus>,
        clock: Arc<dyn Clock>,
        cipher: ChatCipher,
    ) -> Self {
        Self { store, bus, clock, cipher }
    }

    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        text: &str,
        attachment: Option<Attachment>,
    ) -> Result<ChatMessage> {
        let text = text.trim();
        let (message_type, file_url, file_name) = match attachment {
            Some(attachment) => {
                let kind = match attachment.kind {
                    AttachmentKind::Image => MessageType::Image,
                    AttachmentKind::File => MessageType::File,
                };
                (kind, Some(attachment.url), attachment.name)
            }
            None if text.is_empty() => {
                return Err(Error::Validation("message must have text or an attachment".to_string()));
            }
            None => (MessageType::Text, None, None),
        };

        let preview = match (text.is_empty(), message_type, file_name.as_deref()) {
            (false, _, _) => text.to_string(),
            (true, _, Some(name)) => name.to_string(),
            (true, MessageType::Image, None) => "Photo".to_string(),
            (true, _, None) => "File".to_string(),
        };

        self.append(chat_id, sender_id, text, &preview, message_type, file_url, file_name)
            .await
    }

    /// Appends a `call_log` entry through the same path as ordinary messages.
    pub async fn log_call(&self, chat_id: Uuid, sender_id: Uuid, text: &str) -> Result<ChatMessage> {
        self.append(chat_id, sender_id, text, text, MessageType::CallLog, None, None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn append(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        text: &str,
        preview: &str,
        message_type: MessageType,
        file_url: Option<String>,
        file_name: Option<String>,
    ) -> Result<ChatMessage> {
        let room = self.room_for(chat_id, sender_id).await?;
        let receiver_id = room
            .other_participant(sender_id)
            .ok_or_else(|| Error::Forbidden("not a participant of this chat".to_string()))?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            chat_id,
            sender_id,
            text: self.cipher.encrypt(chat_id, text)?,
            message_type,
            file_url,
            file_name,
            created_at: self.clock.now(),
        };
        let sealed_preview = self.cipher.encrypt(chat_id, preview)?;

        let (mut stored, _room) = self
            .store
            .append_message(&message, &sealed_preview, receiver_id)
            .await?;
        stored.text = text.to_string();

        tracing::debug!(chat_id = %chat_id, sender = %sender_id, kind = %message_type, "Message appended");

        let notice = MessageNotice { chat_id, message_id: stored.id };
        self.publish(&topics::chat(chat_id), &notice).await;
        self.publish(&topics::unread(receiver_id), &UnreadNotice { user_id: receiver_id })
            .await;
        Ok(stored)
    }

    pub async fn mark_chat_read(&self, chat_id: Uuid, user_id: Uuid) -> Result<()> {
        self.room_for(chat_id, user_id).await?;
        self.store.reset_unread(chat_id, user_id).await?;
        self.publish(&topics::unread(user_id), &UnreadNotice { user_id }).await;
        Ok(())
    }

    /// Messages of a room, oldest first.
    pub async fn get_messages(&self, chat_id: Uuid, user_id: Uuid) -> Result<Vec<ChatMessage>> {
        self.room_for(chat_id, user_id).await?;
        self.load_messages(chat_id).await
    }

    /// Full message list now, then again after every change to the room.
    pub async fn subscribe_to_messages(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> Result<BoxStream<'static, Vec<ChatMessage>>> {
        self.room_for(chat_id, user_id).await?;
        // Subscribe before the first read so no change slips in between.
        let changes = self.bus.subscribe(&topics::chat(chat_id)).await?;
        let initial = self.load_messages(chat_id).await?;

        let service = self.clone();
        let updates = changes.filter_map(move |_| {
            let service = service.clone();
            async move {
                match service.load_messages(chat_id).await {
                    Ok(messages) => Some(messages),
                    Err(e) => {
                        tracing::warn!(chat_id = %chat_id, "Failed to reload messages: {}", e);
                        None
                    }
                }
            }
        });
        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }

    /// Total unread count across all rooms now, then after every change.
    pub async fn subscribe_to_unread_count(&self, user_id: Uuid) -> Result<BoxStream<'static, u64>> {
        let changes = self.bus.subscribe(&topics::unread(user_id)).await?;
        let initial = self.store.total_unread(user_id).await?;

        let store = self.store.clone();
        let updates = changes.filter_map(move |_| {
            let store = store.clone();
            async move {
                match store.total_unread(user_id).await {
                    Ok(total) => Some(total),
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, "Failed to reload unread count: {}", e);
                        None
                    }
                }
            }
        });
        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }

    pub async fn unread_total(&self, user_id: Uuid) -> Result<u64> {
        self.store.total_unread(user_id).await
    }

    /// Rooms of `user_id`, most recently active first.
    pub async fn list_chats(&self, user_id: Uuid) -> Result<Vec<ChatSummary>> {
        let rooms = self.store.chat_rooms_for(user_id).await?;
        let others: Vec<Uuid> = rooms
            .iter()
            .filter_map(|room| room.other_participant(user_id))
            .collect();
        let mut profiles: HashMap<Uuid, UserProfile> = self
            .store
            .get_profiles(&others)
            .await?
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect();

        rooms
            .into_iter()
            .filter_map(|room| {
                let other = room.other_participant(user_id)?;
                Some((room, other))
            })
            .map(|(room, other)| -> Result<ChatSummary> {
                Ok(ChatSummary {
                    id: room.id,
                    other_participant_id: other,
                    other_participant: profiles.remove(&other),
                    last_message: self.open_preview(&room)?,
                    updated_at: room.updated_at,
                    unread_count: room.unread_for(user_id),
                })
            })
            .collect()
    }

    /// The room shared by `a` and `b`, if they are connected.
    pub async fn find_chat(&self, a: Uuid, b: Uuid) -> Result<Option<ChatRoom>> {
        match self.store.find_chat_room(a, b).await? {
            Some(mut room) => {
                room.last_message = self.open_preview(&room)?;
                Ok(Some(room))
            }
            None => Ok(None),
        }
    }

    async fn room_for(&self, chat_id: Uuid, user_id: Uuid) -> Result<ChatRoom> {
        let room = self
            .store
            .get_chat_room(chat_id)
            .await?
            .ok_or(Error::NotFound("chat room"))?;
        if !room.has_participant(user_id) {
            return Err(Error::Forbidden("not a participant of this chat".to_string()));
        }
        Ok(room)
    }

    async fn load_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>> {
        let mut messages = self.store.messages(chat_id).await?;
        for message in &mut messages {
            message.text = self.cipher.decrypt(chat_id, &message.text)?;
        }
        Ok(messages)
    }

    fn open_preview(&self, room: &ChatRoom) -> Result<Option<String>> {
        room.last_message
            .as_deref()
            .map(|sealed| self.cipher.decrypt(room.id, sealed))
            .transpose()
    }

    async fn publish<T: Serialize>(&self, topic: &str, value: &T) {
        if let Err(e) = publish_json(self.bus.as_ref(), topic, value).await {
            tracing::warn!(topic = %topic, "Failed to publish chat change: {}", e);
        }
    }
}

#[async_trait]
impl CallLog for ChatService {
    async fn log_call(&self, author: Uuid, peer: Uuid, text: &str) -> Result<()> {
        let Some(room) = self.store.find_chat_room(author, peer).await? else {
            tracing::warn!(author = %author, peer = %peer, "No conversation to log the call in");
            return Ok(());
        };
        ChatService::log_call(self, room.id, author, text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use counsel_core::store::{ChatStore, ConnectionStore, ProfileStore};
    use counsel_core::types::{ConnectionRequest, RequestStatus, Role};
    use counsel_core::{ManualClock, MemoryBus, MemoryStore};
    use tokio::time::{timeout, Duration};

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        service: ChatService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = ChatService::with_parts(
            store.clone(),
            Arc::new(MemoryBus::new()),
            clock.clone(),
            ChatCipher::new("chat-test-key").unwrap(),
        );
        Harness { store, clock, service }
    }

    async fn user(store: &MemoryStore, role: Role, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_profile(&UserProfile {
                id,
                role,
                name: name.to_string(),
                email: None,
                city: None,
                photo_url: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        id
    }

    async fn open_room(store: &MemoryStore, a: Uuid, b: Uuid) -> Uuid {
        let request = ConnectionRequest {
            id: Uuid::new_v4(),
            sender_id: a,
            receiver_id: b,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
        };
        store.insert_connection_request(&request).await.unwrap();
        let (_, room) = store
            .resolve_connection_request(request.id, RequestStatus::Accepted, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        room.unwrap().id
    }

    #[tokio::test]
    async fn test_unread_counter_counts_every_send() {
        let h = harness();
        let client = user(&h.store, Role::Client, "client").await;
        let lawyer = user(&h.store, Role::Lawyer, "lawyer").await;
        let chat = open_room(&h.store, client, lawyer).await;

        for i in 0..5 {
            h.service
                .send_message(chat, client, &format!("message {}", i), None)
                .await
                .unwrap();
        }

        let room = h.store.get_chat_room(chat).await.unwrap().unwrap();
        assert_eq!(room.unread_for(lawyer), 5);
        assert_eq!(room.unread_for(client), 0);
        assert_eq!(h.service.unread_total(lawyer).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unread_subscription_after_read_excludes_room() {
        let h = harness();
        let client = user(&h.store, Role::Client, "client").await;
        let other_client = user(&h.store, Role::Client, "other").await;
        let lawyer = user(&h.store, Role::Lawyer, "lawyer").await;
        let first = open_room(&h.store, client, lawyer).await;
        let second = open_room(&h.store, other_client, lawyer).await;

        for _ in 0..3 {
            h.service.send_message(first, client, "hello", None).await.unwrap();
        }
        for _ in 0..2 {
            h.service.send_message(second, other_client, "hi", None).await.unwrap();
        }

        h.service.mark_chat_read(first, lawyer).await.unwrap();
        let mut counts = h.service.subscribe_to_unread_count(lawyer).await.unwrap();
        assert_eq!(counts.next().await, Some(2));

        h.service.send_message(first, client, "again", None).await.unwrap();
        let next = timeout(Duration::from_secs(5), counts.next()).await.unwrap();
        assert_eq!(next, Some(3));
    }

    #[tokio::test]
    async fn test_message_subscription_pushes_snapshots() {
        let h = harness();
        let client = user(&h.store, Role::Client, "client").await;
        let lawyer = user(&h.store, Role::Lawyer, "lawyer").await;
        let chat = open_room(&h.store, client, lawyer).await;
        h.service.send_message(chat, client, "first", None).await.unwrap();

        let mut snapshots = h.service.subscribe_to_messages(chat, lawyer).await.unwrap();
        let initial = snapshots.next().await.unwrap();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].text, "first");

        h.service.send_message(chat, lawyer, "second", None).await.unwrap();
        let updated = timeout(Duration::from_secs(5), snapshots.next()).await.unwrap().unwrap();
        let texts: Vec<&str> = updated.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_text_is_encrypted_at_rest() {
        let h = harness();
        let client = user(&h.store, Role::Client, "client").await;
        let lawyer = user(&h.store, Role::Lawyer, "lawyer").await;
        let chat = open_room(&h.store, client, lawyer).await;

        let sent = h.service.send_message(chat, client, "privileged advice", None).await.unwrap();
        assert_eq!(sent.text, "privileged advice");

        let raw = h.store.messages(chat).await.unwrap();
        assert_ne!(raw[0].text, "privileged advice");
        let raw_room = h.store.get_chat_room(chat).await.unwrap().unwrap();
        assert_ne!(raw_room.last_message.as_deref(), Some("privileged advice"));

        let read = h.service.get_messages(chat, lawyer).await.unwrap();
        assert_eq!(read[0].text, "privileged advice");
        let found = h.service.find_chat(lawyer, client).await.unwrap().unwrap();
        assert_eq!(found.last_message.as_deref(), Some("privileged advice"));
    }

    #[tokio::test]
    async fn test_outsiders_cannot_read_or_write() {
        let h = harness();
        let client = user(&h.store, Role::Client, "client").await;
        let lawyer = user(&h.store, Role::Lawyer, "lawyer").await;
        let outsider = user(&h.store, Role::Client, "outsider").await;
        let chat = open_room(&h.store, client, lawyer).await;

        let err = h.service.send_message(chat, outsider, "hi", None).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = h.service.get_messages(chat, outsider).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = h.service.send_message(chat, client, "   ", None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_created_at_never_goes_backwards() {
        let h = harness();
        let client = user(&h.store, Role::Client, "client").await;
        let lawyer = user(&h.store, Role::Lawyer, "lawyer").await;
        let chat = open_room(&h.store, client, lawyer).await;

        let first = h.service.send_message(chat, client, "one", None).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(-5));
        let second = h.service.send_message(chat, lawyer, "two", None).await.unwrap();

        assert!(second.created_at >= first.created_at);
    }

    #[tokio::test]
    async fn test_attachment_sets_message_type_and_preview() {
        let h = harness();
        let client = user(&h.store, Role::Client, "client").await;
        let lawyer = user(&h.store, Role::Lawyer, "lawyer").await;
        let chat = open_room(&h.store, client, lawyer).await;

        let sent = h
            .service
            .send_message(
                chat,
                client,
                "",
                Some(Attachment {
                    kind: AttachmentKind::File,
                    url: "https://files.example/contract.pdf".to_string(),
                    name: Some("contract.pdf".to_string()),
                }),
            )
            .await
            .unwrap();
        assert_eq!(sent.message_type, MessageType::File);

        let chats = h.service.list_chats(lawyer).await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].last_message.as_deref(), Some("contract.pdf"));
        assert_eq!(chats[0].unread_count, 1);
        assert_eq!(chats[0].other_participant_id, client);
        assert_eq!(chats[0].other_participant.as_ref().map(|p| p.name.as_str()), Some("client"));
    }

    #[tokio::test]
    async fn test_call_log_goes_into_shared_room() {
        let h = harness();
        let client = user(&h.store, Role::Client, "client").await;
        let lawyer = user(&h.store, Role::Lawyer, "lawyer").await;
        let chat = open_room(&h.store, client, lawyer).await;

        let log: &dyn CallLog = &h.service;
        log.log_call(lawyer, client, counsel_signaling::MISSED_CALL_TEXT).await.unwrap();

        let messages = h.service.get_messages(chat, client).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::CallLog);
        assert_eq!(messages[0].sender_id, lawyer);
        assert!(messages[0].text.contains("Missed"));

        let stranger = Uuid::new_v4();
        log.log_call(lawyer, stranger, "Missed video call").await.unwrap();
    }
}
