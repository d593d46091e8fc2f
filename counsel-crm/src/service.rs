use crate::billing::{amount_due, billable_minutes};
use counsel_core::store::Store;
use counsel_core::types::{Case, CaseDocument, CaseStatus, Role, TimeEntry, TimeEntryStop};
use counsel_core::{Clock, CounselContext, Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct NewCase {
    pub client_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
}

/// Metadata of an already uploaded file.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    pub name: String,
    pub file_url: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
}

pub struct CrmService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl CrmService {
    pub fn new(ctx: &CounselContext) -> Self {
        Self::with_parts(ctx.store.clone(), ctx.clock.clone())
    }

    pub fn with_parts(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_case(&self, lawyer_id: Uuid, new_case: NewCase) -> Result<Case> {
        let profile = self
            .store
            .get_profile(lawyer_id)
            .await?
            .ok_or(Error::NotFound("profile"))?;
        if profile.role != Role::Lawyer {
            return Err(Error::Forbidden("only lawyers keep cases".to_string()));
        }
        let title = new_case.title.trim();
        if title.is_empty() {
            return Err(Error::Validation("case title must not be empty".to_string()));
        }

        let case = Case {
            id: Uuid::new_v4(),
            lawyer_id,
            client_id: new_case.client_id,
            title: title.to_string(),
            description: new_case.description,
            status: CaseStatus::New,
            created_at: self.clock.now(),
        };
        self.store.insert_case(&case).await?;

        tracing::info!(case_id = %case.id, lawyer_id = %lawyer_id, "Case opened");
        Ok(case)
    }

    pub async fn list_cases(&self, lawyer_id: Uuid) -> Result<Vec<Case>> {
        self.store.cases_for_lawyer(lawyer_id).await
    }

    /// Visible to the owning lawyer and to the case's client.
    pub async fn get_case(&self, actor: Uuid, case_id: Uuid) -> Result<Case> {
        let case = self.load_case(case_id).await?;
        if case.lawyer_id != actor && case.client_id != Some(actor) {
            return Err(Error::Forbidden("not a party to this case".to_string()));
        }
        Ok(case)
    }

    /// Any status may follow any other; the owning lawyer decides.
    pub async fn update_case_status(&self, actor: Uuid, case_id: Uuid, status: CaseStatus) -> Result<Case> {
        self.owned_case(actor, case_id).await?;
        let case = self.store.set_case_status(case_id, status).await?;
        tracing::info!(case_id = %case_id, status = %status, "Case status changed");
        Ok(case)
    }

    pub async fn start_time_entry(&self, actor: Uuid, case_id: Uuid) -> Result<TimeEntry> {
        self.owned_case(actor, case_id).await?;
        let entry = TimeEntry {
            id: Uuid::new_v4(),
            case_id,
            lawyer_id: actor,
            start_time: self.clock.now(),
            end_time: None,
            duration_minutes: None,
            rate_per_hour: None,
            total_amount: None,
        };
        self.store.insert_time_entry(&entry).await?;

        tracing::debug!(entry_id = %entry.id, case_id = %case_id, "Time entry started");
        Ok(entry)
    }

    /// Stops a running entry and bills it at `rate_per_hour`. The end time is
    /// written once; later stops fail without recomputing anything.
    pub async fn stop_time_entry(&self, actor: Uuid, entry_id: Uuid, rate_per_hour: f64) -> Result<TimeEntry> {
        if !rate_per_hour.is_finite() || rate_per_hour < 0.0 {
            return Err(Error::Validation("rate per hour must be a non-negative number".to_string()));
        }
        let entry = self
            .store
            .get_time_entry(entry_id)
            .await?
            .ok_or(Error::NotFound("time entry"))?;
        if entry.lawyer_id != actor {
            return Err(Error::Forbidden("only the lawyer who started the entry can stop it".to_string()));
        }
        if !entry.is_running() {
            return Err(Error::InvalidState("time entry is already stopped".to_string()));
        }

        let end_time = self.clock.now();
        let duration_minutes = billable_minutes(entry.start_time, end_time);
        let stop = TimeEntryStop {
            end_time,
            duration_minutes,
            rate_per_hour,
            total_amount: amount_due(duration_minutes, rate_per_hour),
        };
        let stopped = self
            .store
            .stop_time_entry(entry_id, &stop)
            .await?
            .ok_or_else(|| Error::InvalidState("time entry is already stopped".to_string()))?;

        tracing::info!(
            entry_id = %entry_id,
            minutes = duration_minutes,
            total = stop.total_amount,
            "Time entry stopped"
        );
        Ok(stopped)
    }

    pub async fn list_time_entries(&self, actor: Uuid, case_id: Uuid) -> Result<Vec<TimeEntry>> {
        self.get_case(actor, case_id).await?;
        self.store.time_entries_for_case(case_id).await
    }

    pub async fn add_document(&self, actor: Uuid, case_id: Uuid, document: NewDocument) -> Result<CaseDocument> {
        self.owned_case(actor, case_id).await?;
        if document.name.trim().is_empty() || document.file_url.trim().is_empty() {
            return Err(Error::Validation("document needs a name and a file url".to_string()));
        }
        if matches!(document.size_bytes, Some(size) if size < 0) {
            return Err(Error::Validation("document size cannot be negative".to_string()));
        }

        let document = CaseDocument {
            id: Uuid::new_v4(),
            case_id,
            lawyer_id: actor,
            name: document.name.trim().to_string(),
            file_url: document.file_url,
            content_type: document.content_type,
            size_bytes: document.size_bytes,
            uploaded_at: self.clock.now(),
        };
        self.store.insert_document(&document).await?;

        tracing::info!(document_id = %document.id, case_id = %case_id, "Document attached");
        Ok(document)
    }

    pub async fn list_documents(&self, actor: Uuid, case_id: Uuid) -> Result<Vec<CaseDocument>> {
        self.get_case(actor, case_id).await?;
        self.store.documents_for_case(case_id).await
    }

    pub async fn delete_document(&self, actor: Uuid, document_id: Uuid) -> Result<()> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(Error::NotFound("document"))?;
        self.owned_case(actor, document.case_id).await?;

        if !self.store.delete_document(document_id).await? {
            return Err(Error::NotFound("document"));
        }
        tracing::info!(document_id = %document_id, "Document deleted");
        Ok(())
    }

    async fn load_case(&self, case_id: Uuid) -> Result<Case> {
        self.store.get_case(case_id).await?.ok_or(Error::NotFound("case"))
    }

    async fn owned_case(&self, actor: Uuid, case_id: Uuid) -> Result<Case> {
        let case = self.load_case(case_id).await?;
        if case.lawyer_id != actor {
            return Err(Error::Forbidden("only the case owner can change it".to_string()));
        }
        Ok(case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use counsel_core::types::UserProfile;
    use counsel_core::store::ProfileStore;
    use counsel_core::{ManualClock, MemoryStore};

    struct Harness {
        clock: Arc<ManualClock>,
        service: CrmService,
        lawyer: Uuid,
        client: Uuid,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let lawyer = Uuid::new_v4();
        let client = Uuid::new_v4();
        for (id, role) in [(lawyer, Role::Lawyer), (client, Role::Client)] {
            store
                .create_profile(&UserProfile {
                    id,
                    role,
                    name: role.to_string(),
                    email: None,
                    city: None,
                    photo_url: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let service = CrmService::with_parts(store, clock.clone());
        Harness { clock, service, lawyer, client }
    }

    async fn open_case(h: &Harness) -> Case {
        h.service
            .create_case(
                h.lawyer,
                NewCase {
                    client_id: Some(h.client),
                    title: "Lease dispute".to_string(),
                    description: None,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_stop_bills_whole_minutes_once() {
        let h = harness().await;
        let case = open_case(&h).await;

        let entry = h.service.start_time_entry(h.lawyer, case.id).await.unwrap();
        assert!(entry.is_running());
        h.clock.advance(Duration::minutes(90) + Duration::seconds(30));

        let stopped = h.service.stop_time_entry(h.lawyer, entry.id, 100.0).await.unwrap();
        assert_eq!(stopped.duration_minutes, Some(90));
        assert_eq!(stopped.total_amount, Some(150.0));
        assert_eq!(stopped.rate_per_hour, Some(100.0));

        h.clock.advance(Duration::minutes(10));
        let err = h.service.stop_time_entry(h.lawyer, entry.id, 200.0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let entries = h.service.list_time_entries(h.lawyer, case.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].end_time, stopped.end_time);
        assert_eq!(entries[0].total_amount, Some(150.0));
    }

    #[tokio::test]
    async fn test_amount_is_rounded_to_cents() {
        let h = harness().await;
        let case = open_case(&h).await;

        let entry = h.service.start_time_entry(h.lawyer, case.id).await.unwrap();
        h.clock.advance(Duration::minutes(1));
        let stopped = h.service.stop_time_entry(h.lawyer, entry.id, 100.0).await.unwrap();

        assert_eq!(stopped.duration_minutes, Some(1));
        assert_eq!(stopped.total_amount, Some(1.67));
    }

    #[tokio::test]
    async fn test_invalid_rate_and_foreign_lawyer_are_rejected() {
        let h = harness().await;
        let case = open_case(&h).await;
        let entry = h.service.start_time_entry(h.lawyer, case.id).await.unwrap();

        let err = h.service.stop_time_entry(h.lawyer, entry.id, -5.0).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = h.service.stop_time_entry(h.lawyer, entry.id, f64::NAN).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = h.service.stop_time_entry(h.client, entry.id, 50.0).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = h.service.start_time_entry(h.client, case.id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_clients_cannot_open_cases() {
        let h = harness().await;
        let err = h
            .service
            .create_case(
                h.client,
                NewCase {
                    client_id: None,
                    title: "Mine".to_string(),
                    description: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_status_moves_freely_for_owner() {
        let h = harness().await;
        let case = open_case(&h).await;

        let court = h.service.update_case_status(h.lawyer, case.id, CaseStatus::Court).await.unwrap();
        assert_eq!(court.status, CaseStatus::Court);
        let back = h.service.update_case_status(h.lawyer, case.id, CaseStatus::New).await.unwrap();
        assert_eq!(back.status, CaseStatus::New);

        let err = h
            .service
            .update_case_status(h.client, case.id, CaseStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(h.service.get_case(h.client, case.id).await.unwrap().status, CaseStatus::New);
    }

    #[tokio::test]
    async fn test_documents_follow_case_ownership() {
        let h = harness().await;
        let case = open_case(&h).await;

        let document = h
            .service
            .add_document(
                h.lawyer,
                case.id,
                NewDocument {
                    name: "contract.pdf".to_string(),
                    file_url: "https://files.example/contract.pdf".to_string(),
                    content_type: Some("application/pdf".to_string()),
                    size_bytes: Some(2048),
                },
            )
            .await
            .unwrap();

        let listed = h.service.list_documents(h.client, case.id).await.unwrap();
        assert_eq!(listed, vec![document.clone()]);

        let err = h.service.delete_document(h.client, document.id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        h.service.delete_document(h.lawyer, document.id).await.unwrap();
        assert!(h.service.list_documents(h.lawyer, case.id).await.unwrap().is_empty());
        let err = h.service.delete_document(h.lawyer, document.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
