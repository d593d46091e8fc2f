use counsel_core::types::{
    LawyerListing, LawyerProfile, LawyerProfileUpdate, LawyerSearch, ProfileUpdate, Role, UserProfile,
};
use counsel_core::store::Store;
use counsel_core::{Clock, CounselContext, Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

/// Signup payload for the authenticated identity.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub role: Role,
    pub name: String,
    pub city: Option<String>,
}

pub struct ProfileService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ProfileService {
    pub fn new(ctx: &CounselContext) -> Self {
        Self::with_parts(ctx.store.clone(), ctx.clock.clone())
    }

    pub fn with_parts(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Creates the profile of `user_id`. Registering twice returns the
    /// existing profile untouched.
    pub async fn register(
        &self,
        user_id: Uuid,
        email: Option<String>,
        registration: Registration,
    ) -> Result<UserProfile> {
        if registration.role == Role::Admin {
            return Err(Error::Forbidden("admin role cannot be self-assigned".to_string()));
        }
        let name = registration.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("name must not be empty".to_string()));
        }

        let profile = UserProfile {
            id: user_id,
            role: registration.role,
            name: name.to_string(),
            email,
            city: registration.city,
            photo_url: None,
            created_at: self.clock.now(),
        };
        let stored = self.store.create_profile(&profile).await?;

        if stored.role == Role::Lawyer {
            self.store.ensure_lawyer_profile(stored.id).await?;
        }

        tracing::info!(user_id = %stored.id, role = %stored.role, "Profile registered");
        Ok(stored)
    }

    pub async fn get_profile(&self, id: Uuid) -> Result<UserProfile> {
        self.store
            .get_profile(id)
            .await?
            .ok_or(Error::NotFound("profile"))
    }

    /// One lookup for many ids; unknown ids are skipped.
    pub async fn get_profiles(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>> {
        self.store.get_profiles(ids).await
    }

    pub async fn get_lawyer(&self, id: Uuid) -> Result<LawyerListing> {
        let profile = self.get_profile(id).await?;
        if profile.role != Role::Lawyer {
            return Err(Error::NotFound("lawyer"));
        }
        let lawyer = self.store.ensure_lawyer_profile(id).await?;
        Ok(LawyerListing { profile, lawyer })
    }

    pub async fn update_profile(&self, actor: Uuid, id: Uuid, mut update: ProfileUpdate) -> Result<UserProfile> {
        if actor != id {
            return Err(Error::Forbidden("profiles can only be edited by their owner".to_string()));
        }
        if let Some(name) = update.name.take() {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::Validation("name must not be empty".to_string()));
            }
            update.name = Some(name.to_string());
        }

        self.store.update_profile_details(id, &update).await
    }

    /// Admin-only. Promoting to lawyer creates the lawyer profile; any other
    /// role drops it, along with its verification.
    pub async fn set_role(&self, actor: Uuid, target: Uuid, role: Role) -> Result<UserProfile> {
        self.require_role(actor, Role::Admin).await?;
        let profile = self.store.set_role(target, role).await?;

        tracing::info!(admin = %actor, user_id = %target, role = %role, "Role changed");
        Ok(profile)
    }

    pub async fn update_lawyer_profile(&self, actor: Uuid, mut update: LawyerProfileUpdate) -> Result<LawyerProfile> {
        self.require_role(actor, Role::Lawyer).await?;

        if let Some(specializations) = update.specializations.take() {
            update.specializations = Some(
                specializations
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }
        if let Some(price) = update.price {
            if !price.is_finite() || price < 0.0 {
                return Err(Error::Validation("price must be a non-negative number".to_string()));
            }
        }

        self.store.ensure_lawyer_profile(actor).await?;
        self.store.update_lawyer_details(actor, &update).await
    }

    pub async fn add_verification_document(&self, actor: Uuid, url: String) -> Result<LawyerProfile> {
        self.require_role(actor, Role::Lawyer).await?;
        if url.trim().is_empty() {
            return Err(Error::Validation("document url must not be empty".to_string()));
        }
        self.store.ensure_lawyer_profile(actor).await?;
        self.store.append_verification_document(actor, &url).await
    }

    pub async fn set_verified(&self, actor: Uuid, lawyer_id: Uuid, verified: bool) -> Result<LawyerProfile> {
        self.require_role(actor, Role::Admin).await?;
        let lawyer = self.store.set_lawyer_verified(lawyer_id, verified).await?;

        tracing::info!(admin = %actor, lawyer_id = %lawyer_id, verified, "Lawyer verification changed");
        Ok(lawyer)
    }

    pub async fn search_lawyers(&self, filter: &LawyerSearch) -> Result<Vec<LawyerListing>> {
        self.store.search_lawyers(filter).await
    }

    async fn require_role(&self, actor: Uuid, role: Role) -> Result<UserProfile> {
        let profile = self.get_profile(actor).await?;
        if profile.role != role {
            return Err(Error::Forbidden(format!("requires the {} role", role)));
        }
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use counsel_core::{ManualClock, MemoryStore};

    fn service() -> ProfileService {
        service_with_store().0
    }

    fn service_with_store() -> (ProfileService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = ProfileService::with_parts(store.clone(), Arc::new(ManualClock::new(Utc::now())));
        (service, store)
    }

    fn registration(role: Role, name: &str, city: &str) -> Registration {
        Registration {
            role,
            name: name.to_string(),
            city: Some(city.to_string()),
        }
    }

    async fn make_admin(service: &ProfileService, store_admin: Uuid) {
        service
            .register(store_admin, None, registration(Role::Client, "Root", "Tashkent"))
            .await
            .unwrap();
        service.store.set_role(store_admin, Role::Admin).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_lawyer_creates_lawyer_profile() {
        let service = service();
        let id = Uuid::new_v4();

        let profile = service
            .register(id, Some("l@example.com".to_string()), registration(Role::Lawyer, "Lola", "Tashkent"))
            .await
            .unwrap();

        assert_eq!(profile.role, Role::Lawyer);
        let listing = service.get_lawyer(id).await.unwrap();
        assert!(listing.lawyer.specializations.is_empty());
        assert!(!listing.lawyer.verified);
    }

    #[tokio::test]
    async fn test_register_twice_keeps_first_profile() {
        let service = service();
        let id = Uuid::new_v4();

        service.register(id, None, registration(Role::Client, "Ali", "Samarkand")).await.unwrap();
        let again = service
            .register(id, None, registration(Role::Lawyer, "Someone Else", "Bukhara"))
            .await
            .unwrap();

        assert_eq!(again.name, "Ali");
        assert_eq!(again.role, Role::Client);
    }

    #[tokio::test]
    async fn test_admin_cannot_be_self_assigned() {
        let service = service();
        let err = service
            .register(Uuid::new_v4(), None, registration(Role::Admin, "Eve", "Tashkent"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_only_admin_changes_roles() {
        let service = service();
        let admin = Uuid::new_v4();
        let user = Uuid::new_v4();
        make_admin(&service, admin).await;
        service.register(user, None, registration(Role::Client, "Ali", "Tashkent")).await.unwrap();

        let err = service.set_role(user, user, Role::Lawyer).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let promoted = service.set_role(admin, user, Role::Lawyer).await.unwrap();
        assert_eq!(promoted.role, Role::Lawyer);
        assert!(service.store.get_lawyer_profile(user).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_profile_owner_only() {
        let service = service();
        let owner = Uuid::new_v4();
        service.register(owner, None, registration(Role::Client, "Ali", "Tashkent")).await.unwrap();

        let err = service
            .update_profile(Uuid::new_v4(), owner, ProfileUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let updated = service
            .update_profile(
                owner,
                owner,
                ProfileUpdate {
                    city: Some("Namangan".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.city.as_deref(), Some("Namangan"));
        assert_eq!(updated.name, "Ali");
    }

    #[tokio::test]
    async fn test_search_filters_and_orders_by_rating() {
        let (service, store) = service_with_store();
        let admin = Uuid::new_v4();
        make_admin(&service, admin).await;

        let cheap = Uuid::new_v4();
        let pricey = Uuid::new_v4();
        for (id, name, price) in [(cheap, "Cheap", 100.0), (pricey, "Pricey", 900.0)] {
            service.register(id, None, registration(Role::Lawyer, name, "Tashkent")).await.unwrap();
            service
                .update_lawyer_profile(
                    id,
                    LawyerProfileUpdate {
                        specializations: Some(vec!["family".to_string()]),
                        price: Some(price),
                        banner_url: None,
                    },
                )
                .await
                .unwrap();
        }
        let mut rated = service.store.get_lawyer_profile(pricey).await.unwrap().unwrap();
        rated.rating = 4.9;
        store.put_lawyer_profile(rated);
        service.set_verified(admin, cheap, true).await.unwrap();

        let all = service
            .search_lawyers(&LawyerSearch {
                city: Some("tashkent".to_string()),
                specialization: Some("family".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<Uuid> = all.iter().map(|l| l.profile.id).collect();
        assert_eq!(ids, vec![pricey, cheap]);

        let affordable = service
            .search_lawyers(&LawyerSearch {
                max_price: Some(500.0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(affordable.len(), 1);
        assert_eq!(affordable[0].profile.id, cheap);

        let verified = service
            .search_lawyers(&LawyerSearch {
                verified_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(verified.len(), 1);
        assert!(verified[0].lawyer.verified);
    }

    #[tokio::test]
    async fn test_verification_documents_append() {
        let service = service();
        let lawyer = Uuid::new_v4();
        service.register(lawyer, None, registration(Role::Lawyer, "Lola", "Tashkent")).await.unwrap();

        service
            .add_verification_document(lawyer, "https://files.example/license.pdf".to_string())
            .await
            .unwrap();
        let updated = service
            .add_verification_document(lawyer, "https://files.example/diploma.pdf".to_string())
            .await
            .unwrap();

        assert_eq!(updated.verification_documents.len(), 2);
        assert_eq!(updated.verification_documents[0], "https://files.example/license.pdf");
    }

    #[tokio::test]
    async fn test_demoting_lawyer_drops_lawyer_profile() {
        let service = service();
        let admin = Uuid::new_v4();
        let lawyer = Uuid::new_v4();
        make_admin(&service, admin).await;
        service.register(lawyer, None, registration(Role::Lawyer, "Lola", "Tashkent")).await.unwrap();
        service.set_verified(admin, lawyer, true).await.unwrap();

        let demoted = service.set_role(admin, lawyer, Role::Client).await.unwrap();
        assert_eq!(demoted.role, Role::Client);
        assert!(service.store.get_lawyer_profile(lawyer).await.unwrap().is_none());
        assert!(matches!(service.get_lawyer(lawyer).await.unwrap_err(), Error::NotFound(_)));
        assert!(service.search_lawyers(&LawyerSearch::default()).await.unwrap().is_empty());

        let err = service.set_verified(admin, lawyer, true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let promoted = service.set_role(admin, lawyer, Role::Lawyer).await.unwrap();
        assert_eq!(promoted.role, Role::Lawyer);
        let listing = service.get_lawyer(lawyer).await.unwrap();
        assert!(!listing.lawyer.verified);
    }

    #[tokio::test]
    async fn test_set_verified_rejects_non_lawyers() {
        let service = service();
        let admin = Uuid::new_v4();
        let client = Uuid::new_v4();
        make_admin(&service, admin).await;
        service.register(client, None, registration(Role::Client, "Ali", "Tashkent")).await.unwrap();

        let err = service.set_verified(admin, client, true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(service.store.get_lawyer_profile(client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_owner_edit_keeps_role_set_by_admin() {
        let service = service();
        let admin = Uuid::new_v4();
        let owner = Uuid::new_v4();
        make_admin(&service, admin).await;
        service.register(owner, None, registration(Role::Client, "Ali", "Tashkent")).await.unwrap();

        // The owner loaded the profile before the admin promoted them.
        let stale = service.get_profile(owner).await.unwrap();
        service.set_role(admin, owner, Role::Lawyer).await.unwrap();

        let updated = service
            .update_profile(
                owner,
                owner,
                ProfileUpdate {
                    name: Some(format!("  {} Karimov ", stale.name)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Ali Karimov");
        assert_eq!(updated.role, Role::Lawyer);
        assert_eq!(updated.city.as_deref(), Some("Tashkent"));
    }

    #[tokio::test]
    async fn test_lawyer_edits_keep_verification() {
        let service = service();
        let admin = Uuid::new_v4();
        let lawyer = Uuid::new_v4();
        make_admin(&service, admin).await;
        service.register(lawyer, None, registration(Role::Lawyer, "Lola", "Tashkent")).await.unwrap();
        service
            .add_verification_document(lawyer, "https://files.example/license.pdf".to_string())
            .await
            .unwrap();
        service.set_verified(admin, lawyer, true).await.unwrap();

        let edited = service
            .update_lawyer_profile(
                lawyer,
                LawyerProfileUpdate {
                    price: Some(250.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(edited.verified);
        assert_eq!(edited.price, Some(250.0));
        assert_eq!(edited.verification_documents.len(), 1);

        let appended = service
            .add_verification_document(lawyer, "https://files.example/diploma.pdf".to_string())
            .await
            .unwrap();
        assert!(appended.verified);
        assert_eq!(appended.price, Some(250.0));
        assert_eq!(appended.verification_documents.len(), 2);
    }
}
