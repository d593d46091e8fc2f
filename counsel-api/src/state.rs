use counsel_core::{Config, CounselContext};
use counsel_crm::CrmService;
use counsel_directory::ProfileService;
use counsel_marketplace::MarketplaceService;
use counsel_messaging::{ChatService, ConnectionService};
use counsel_signaling::SignalRelay;
use std::sync::Arc;

/// Services shared by every handler and WebSocket session.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub profiles: Arc<ProfileService>,
    pub connections: Arc<ConnectionService>,
    pub chats: ChatService,
    pub crm: Arc<CrmService>,
    pub marketplace: Arc<MarketplaceService>,
    pub relay: SignalRelay,
}

impl AppState {
    pub fn new(ctx: &CounselContext) -> Self {
        Self {
            config: ctx.config.clone(),
            profiles: Arc::new(ProfileService::new(ctx)),
            connections: Arc::new(ConnectionService::new(ctx)),
            chats: ChatService::new(ctx),
            crm: Arc::new(CrmService::new(ctx)),
            marketplace: Arc::new(MarketplaceService::new(ctx)),
            relay: SignalRelay::new(ctx.bus.clone()),
        }
    }
}
