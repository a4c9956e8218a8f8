//! Shared server state, built once at startup and handed to every transport.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use concierge_core::{
    ChatCompletionClient, CompletionBackend, ConciergeConfig, DurableStore, HttpSchedulingClient,
    PgDurableStore, SchedulingApi,
};

use crate::subsystems::context_store::ContextStore;
use crate::subsystems::conversation::ConversationEngine;
use crate::subsystems::dispatcher::ToolDispatcher;
use crate::subsystems::modes::ModeRouter;
use crate::subsystems::registry::SessionRegistry;

pub struct ServerState {
    pub config: ConciergeConfig,
    pub store: Arc<ContextStore>,
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<ConversationEngine>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    /// Wire the production collaborators from config.
    ///
    /// An unreachable database degrades to volatile-only storage rather than
    /// failing startup.
    pub async fn build(config: ConciergeConfig) -> Result<Arc<Self>> {
        let durable: Option<Arc<dyn DurableStore>> = if config.database.enabled {
            match PgDurableStore::connect(&config.database).await {
                Ok(store) => {
                    tracing::info!(table = %config.database.table, "Durable context store ready");
                    Some(Arc::new(store))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Durable store unavailable; running volatile-only");
                    None
                }
            }
        } else {
            tracing::info!("Database disabled; contexts are kept in memory only");
            None
        };

        let scheduling = HttpSchedulingClient::new(config.scheduling.clone())?;
        let completion = ChatCompletionClient::new(config.completion.clone())?;

        Ok(Self::from_parts(
            config,
            durable,
            Arc::new(scheduling),
            Arc::new(completion),
        ))
    }

    /// Assemble state from already-built collaborators.
    pub fn from_parts(
        config: ConciergeConfig,
        durable: Option<Arc<dyn DurableStore>>,
        scheduling: Arc<dyn SchedulingApi>,
        completion: Arc<dyn CompletionBackend>,
    ) -> Arc<Self> {
        let tz = config.service.tz();
        let store = Arc::new(ContextStore::new(durable));
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(ToolDispatcher::new(scheduling, tz, config.scheduling.timeout()));
        let engine = Arc::new(ConversationEngine::new(
            store.clone(),
            registry.clone(),
            ModeRouter::keyword(config.router.recency_window),
            dispatcher,
            completion,
            config.completion.timeout(),
            config.completion.max_tool_rounds,
            tz,
        ));

        Arc::new(Self {
            config,
            store,
            registry,
            engine,
            started_at: Utc::now(),
        })
    }
}
