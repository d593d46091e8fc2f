use counsel_core::store::Store;
use counsel_core::types::{
    CommunityRequest, CommunityRequestStatus, ProposalStatus, RequestProposal, Role, UserProfile,
};
use counsel_core::{Clock, CounselContext, Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct NewRequest {
    pub title: String,
    pub description: String,
    pub category: String,
    pub budget: Option<f64>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProposal {
    pub proposed_price: f64,
    pub message: String,
    pub estimated_duration: Option<String>,
}

pub struct MarketplaceService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl MarketplaceService {
    pub fn new(ctx: &CounselContext) -> Self {
        Self::with_parts(ctx.store.clone(), ctx.clock.clone())
    }

    pub fn with_parts(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_request(&self, client_id: Uuid, new_request: NewRequest) -> Result<CommunityRequest> {
        self.profile(client_id).await?;
        let title = new_request.title.trim();
        let category = new_request.category.trim();
        if title.is_empty() || category.is_empty() {
            return Err(Error::Validation("request needs a title and a category".to_string()));
        }
        if let Some(budget) = new_request.budget {
            if !budget.is_finite() || budget < 0.0 {
                return Err(Error::Validation("budget must be a non-negative number".to_string()));
            }
        }

        let request = CommunityRequest {
            id: Uuid::new_v4(),
            client_id,
            title: title.to_string(),
            description: new_request.description,
            category: category.to_string(),
            budget: new_request.budget,
            city: new_request.city,
            status: CommunityRequestStatus::Open,
            proposal_count: 0,
            created_at: self.clock.now(),
        };
        self.store.insert_request(&request).await?;

        tracing::info!(request_id = %request.id, category = %request.category, "Request posted");
        Ok(request)
    }

    pub async fn list_open_requests(&self, category: Option<&str>) -> Result<Vec<CommunityRequest>> {
        self.store
            .requests_with_status(CommunityRequestStatus::Open, category)
            .await
    }

    pub async fn list_client_requests(&self, client_id: Uuid) -> Result<Vec<CommunityRequest>> {
        self.store.requests_by_client(client_id).await
    }

    pub async fn get_request(&self, request_id: Uuid) -> Result<CommunityRequest> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or(Error::NotFound("request"))
    }

    /// The same lawyer may bid more than once; each bid is its own proposal.
    pub async fn submit_proposal(
        &self,
        lawyer_id: Uuid,
        request_id: Uuid,
        new_proposal: NewProposal,
    ) -> Result<RequestProposal> {
        let profile = self.profile(lawyer_id).await?;
        if profile.role != Role::Lawyer {
            return Err(Error::Forbidden("only lawyers can submit proposals".to_string()));
        }
        if !new_proposal.proposed_price.is_finite() || new_proposal.proposed_price < 0.0 {
            return Err(Error::Validation("proposed price must be a non-negative number".to_string()));
        }

        let proposal = RequestProposal {
            id: Uuid::new_v4(),
            request_id,
            lawyer_id,
            proposed_price: new_proposal.proposed_price,
            message: new_proposal.message,
            estimated_duration: new_proposal.estimated_duration,
            status: ProposalStatus::Pending,
            created_at: self.clock.now(),
        };
        let request = self.store.insert_proposal(&proposal).await?;

        tracing::info!(
            request_id = %request_id,
            proposal_id = %proposal.id,
            proposals = request.proposal_count,
            "Proposal submitted"
        );
        Ok(proposal)
    }

    /// The request's client sees every proposal; anyone else only their own.
    pub async fn list_proposals(&self, actor: Uuid, request_id: Uuid) -> Result<Vec<RequestProposal>> {
        let request = self.get_request(request_id).await?;
        let proposals = self.store.proposals_for_request(request_id).await?;
        if request.client_id == actor {
            return Ok(proposals);
        }
        Ok(proposals.into_iter().filter(|p| p.lawyer_id == actor).collect())
    }

    /// Competing proposals keep their `pending` status.
    pub async fn accept_proposal(
        &self,
        actor: Uuid,
        request_id: Uuid,
        proposal_id: Uuid,
        lawyer_id: Uuid,
    ) -> Result<(CommunityRequest, RequestProposal)> {
        let request = self.get_request(request_id).await?;
        if request.client_id != actor {
            return Err(Error::Forbidden("only the request owner can accept proposals".to_string()));
        }
        let proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or(Error::NotFound("proposal"))?;
        if proposal.request_id != request_id || proposal.lawyer_id != lawyer_id {
            return Err(Error::Validation("proposal does not match the request and lawyer".to_string()));
        }
        if !request.status.accepts_proposals() {
            return Err(Error::InvalidState(format!("request is already {}", request.status)));
        }

        let accepted = self.store.accept_proposal(request_id, proposal_id).await?;
        tracing::info!(
            request_id = %request_id,
            proposal_id = %proposal_id,
            lawyer_id = %lawyer_id,
            "Proposal accepted"
        );
        Ok(accepted)
    }

    pub async fn close_request(&self, actor: Uuid, request_id: Uuid) -> Result<CommunityRequest> {
        let request = self.get_request(request_id).await?;
        if request.client_id != actor {
            return Err(Error::Forbidden("only the request owner can close it".to_string()));
        }
        let closed = self
            .store
            .transition_request(
                request_id,
                &[CommunityRequestStatus::Open, CommunityRequestStatus::InReview],
                CommunityRequestStatus::Closed,
            )
            .await?;
        tracing::info!(request_id = %request_id, "Request closed");
        Ok(closed)
    }

    async fn profile(&self, user_id: Uuid) -> Result<UserProfile> {
        self.store
            .get_profile(user_id)
            .await?
            .ok_or(Error::NotFound("profile"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use counsel_core::store::ProfileStore;
    use counsel_core::{ManualClock, MemoryStore};

    struct Harness {
        service: MarketplaceService,
        client: Uuid,
        first_lawyer: Uuid,
        second_lawyer: Uuid,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let client = Uuid::new_v4();
        let first_lawyer = Uuid::new_v4();
        let second_lawyer = Uuid::new_v4();
        for (id, role) in [
            (client, Role::Client),
            (first_lawyer, Role::Lawyer),
            (second_lawyer, Role::Lawyer),
        ] {
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
        let service = MarketplaceService::with_parts(store, Arc::new(ManualClock::new(Utc::now())));
        Harness {
            service,
            client,
            first_lawyer,
            second_lawyer,
        }
    }

    fn new_request(category: &str) -> NewRequest {
        NewRequest {
            title: "Need help with a divorce".to_string(),
            description: "Two children, shared apartment".to_string(),
            category: category.to_string(),
            budget: Some(1000.0),
            city: Some("Tashkent".to_string()),
        }
    }

    fn bid(price: f64) -> NewProposal {
        NewProposal {
            proposed_price: price,
            message: "I can take this".to_string(),
            estimated_duration: Some("2 weeks".to_string()),
        }
    }

    #[tokio::test]
    async fn test_accepting_one_proposal_leaves_the_other_pending() {
        let h = harness().await;
        let request = h.service.create_request(h.client, new_request("family")).await.unwrap();
        let p1 = h.service.submit_proposal(h.first_lawyer, request.id, bid(500.0)).await.unwrap();
        let p2 = h.service.submit_proposal(h.second_lawyer, request.id, bid(700.0)).await.unwrap();
        assert_eq!(h.service.get_request(request.id).await.unwrap().proposal_count, 2);

        let (accepted_request, accepted) = h
            .service
            .accept_proposal(h.client, request.id, p1.id, h.first_lawyer)
            .await
            .unwrap();
        assert_eq!(accepted_request.status, CommunityRequestStatus::Accepted);
        assert_eq!(accepted.status, ProposalStatus::Accepted);

        let proposals = h.service.list_proposals(h.client, request.id).await.unwrap();
        let other = proposals.iter().find(|p| p.id == p2.id).unwrap();
        assert_eq!(other.status, ProposalStatus::Pending);

        let err = h
            .service
            .accept_proposal(h.client, request.id, p2.id, h.second_lawyer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let accepted_count = h
            .service
            .list_proposals(h.client, request.id)
            .await
            .unwrap()
            .iter()
            .filter(|p| p.status == ProposalStatus::Accepted)
            .count();
        assert_eq!(accepted_count, 1);
    }

    #[tokio::test]
    async fn test_lawyers_see_only_their_proposals() {
        let h = harness().await;
        let request = h.service.create_request(h.client, new_request("family")).await.unwrap();
        h.service.submit_proposal(h.first_lawyer, request.id, bid(500.0)).await.unwrap();
        h.service.submit_proposal(h.second_lawyer, request.id, bid(700.0)).await.unwrap();

        let own = h.service.list_proposals(h.first_lawyer, request.id).await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].lawyer_id, h.first_lawyer);
        assert_eq!(h.service.list_proposals(h.client, request.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_accept_checks_owner_and_lawyer() {
        let h = harness().await;
        let request = h.service.create_request(h.client, new_request("family")).await.unwrap();
        let p1 = h.service.submit_proposal(h.first_lawyer, request.id, bid(500.0)).await.unwrap();

        let err = h
            .service
            .accept_proposal(h.first_lawyer, request.id, p1.id, h.first_lawyer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let err = h
            .service
            .accept_proposal(h.client, request.id, p1.id, h.second_lawyer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_clients_cannot_bid() {
        let h = harness().await;
        let request = h.service.create_request(h.client, new_request("family")).await.unwrap();
        let err = h.service.submit_proposal(h.client, request.id, bid(10.0)).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_closed_request_stops_taking_proposals() {
        let h = harness().await;
        let request = h.service.create_request(h.client, new_request("tax")).await.unwrap();

        let err = h.service.close_request(h.first_lawyer, request.id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let closed = h.service.close_request(h.client, request.id).await.unwrap();
        assert_eq!(closed.status, CommunityRequestStatus::Closed);

        let err = h
            .service
            .submit_proposal(h.first_lawyer, request.id, bid(300.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = h.service.close_request(h.client, request.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_open_requests_filter_by_category() {
        let h = harness().await;
        h.service.create_request(h.client, new_request("family")).await.unwrap();
        let tax = h.service.create_request(h.client, new_request("tax")).await.unwrap();
        h.service.close_request(h.client, tax.id).await.unwrap();
        h.service.create_request(h.client, new_request("tax")).await.unwrap();

        assert_eq!(h.service.list_open_requests(None).await.unwrap().len(), 2);
        let open_tax = h.service.list_open_requests(Some("tax")).await.unwrap();
        assert_eq!(open_tax.len(), 1);
        assert_ne!(open_tax[0].id, tax.id);
        assert_eq!(h.service.list_client_requests(h.client).await.unwrap().len(), 3);
    }
}
