//! Boundary API server, Axum-based HTTP + JSON

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bobb_channels::{ConnectionManager, SendRequest};
use bobb_core::{AgentStatus, RegistryHandle};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::protocol::{
    AgentView, ApiError, CreateAgentRequest, SearchQuery, SendMessageRequest,
    SendMessageResponse, UpdateAgentRequest,
};

/// Shared state for all handlers
#[derive(Clone)]
pub struct GatewayState {
    pub registry: RegistryHandle,
    pub connections: Arc<ConnectionManager>,
    pub start_time: std::time::Instant,
}

/// The boundary API server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, registry: RegistryHandle, connections: Arc<ConnectionManager>) -> Self {
        let state = GatewayState {
            registry,
            connections,
            start_time: std::time::Instant::now(),
        };
        Self { state, bind }
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            .route(
                "/api/registry/agents",
                get(list_agents_handler).post(create_agent_handler),
            )
            .route("/api/registry/agents/pending", get(pending_agents_handler))
            .route("/api/registry/agents/search", get(search_agents_handler))
            .route(
                "/api/registry/agents/{id}",
                get(get_agent_handler).put(update_agent_handler),
            )
            .route("/api/discord/send", post(send_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("Boundary API listening on {}", self.bind);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("Boundary API stopped");
        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

// ── HTTP Handlers ──

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let online = state.connections.online_agents().await;
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "agents_online": online,
    }))
}

async fn list_agents_handler(
    State(state): State<GatewayState>,
) -> Result<Json<Vec<AgentView>>, ApiError> {
    let agents = state.registry.list().await?;
    Ok(Json(agents.into_iter().map(AgentView::from).collect()))
}

async fn pending_agents_handler(
    State(state): State<GatewayState>,
) -> Result<Json<Vec<AgentView>>, ApiError> {
    let agents = state.registry.list_by_status(AgentStatus::PendingToken).await?;
    Ok(Json(agents.into_iter().map(AgentView::from).collect()))
}

async fn search_agents_handler(
    State(state): State<GatewayState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<AgentView>>, ApiError> {
    let name = match query.name.as_deref().map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => return Err(ApiError::bad_request("missing 'name' query parameter")),
    };
    let agents = state.registry.find_by_name(&name).await?;
    Ok(Json(agents.into_iter().map(AgentView::from).collect()))
}

async fn create_agent_handler(
    State(state): State<GatewayState>,
    Json(req): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<AgentView>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("'name' must not be empty"));
    }
    let persona = req.persona.filter(|p| !p.trim().is_empty());
    let entry = state.registry.create(req.name.trim(), persona).await?;
    info!("Registered agent {} on port {}", entry.id, entry.port);
    Ok((StatusCode::CREATED, Json(entry.into())))
}

async fn get_agent_handler(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<Json<AgentView>, ApiError> {
    match state.registry.get(&id).await? {
        Some(entry) => Ok(Json(entry.into())),
        None => Err(bobb_core::BobbError::NotFound(id).into()),
    }
}

async fn update_agent_handler(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateAgentRequest>,
) -> Result<Json<AgentView>, ApiError> {
    let entry = match (req.token, req.status) {
        (Some(token), _) => {
            let entry = state.registry.activate(&id, token.trim()).await?;
            info!("Agent {} activated", entry.id);
            entry
        }
        (None, Some(status)) => {
            let entry = state.registry.set_status(&id, status).await?;
            info!("Agent {} status set to {}", entry.id, status);
            entry
        }
        (None, None) => {
            return Err(ApiError::bad_request("expected 'token' or 'status'"));
        }
    };
    Ok(Json(entry.into()))
}

async fn send_handler(
    State(state): State<GatewayState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    if req.channel_id.trim().is_empty() || req.content.is_empty() {
        return Err(ApiError::bad_request("'channel_id' and 'content' are required"));
    }

    let receipt = state
        .connections
        .send_as(
            req.bot_id.as_deref(),
            SendRequest {
                channel_id: req.channel_id,
                content: req.content,
                reply_to: req.reply_to,
                mention_targets: req.mention_bots,
            },
        )
        .await?;

    Ok(Json(SendMessageResponse {
        success: true,
        message_id: receipt.message_id,
        sent_by: receipt.sent_by,
        mentioned_bots: receipt.mentioned,
        unresolved_bots: receipt.unresolved,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bobb_channels::{AgentConnectConfig, ManagerConfig, Presence, Transport};
    use bobb_core::registry::{Registry, RegistryStore};
    use bobb_core::{DirMailbox, HistoryEntry, InboundEvent, Mailbox, OutgoingMessage, Result};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct EchoPresence {
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    #[async_trait]
    impl Presence for EchoPresence {
        fn identity(&self) -> &str {
            "100"
        }

        fn tag(&self) -> &str {
            "bobb#0001"
        }

        async fn send(&self, msg: OutgoingMessage) -> Result<String> {
            self.sent.lock().unwrap().push(msg);
            Ok("m-1".into())
        }

        async fn typing(&self, _channel_id: &str) -> Result<()> {
            Ok(())
        }

        async fn recent_history(
            &self,
            _channel_id: &str,
            _before: &str,
            _limit: usize,
        ) -> Result<Vec<HistoryEntry>> {
            Ok(vec![])
        }

        async fn shutdown(&self) {}
    }

    struct EchoTransport {
        presence: Arc<EchoPresence>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn connect(
            &self,
            _config: &AgentConnectConfig,
            _events: mpsc::Sender<InboundEvent>,
        ) -> Result<Arc<dyn Presence>> {
            Ok(self.presence.clone())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        mailbox: Arc<DirMailbox>,
        presence: Arc<EchoPresence>,
        state: GatewayState,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Arc::new(DirMailbox::new(dir.path().join(".activations")));
        let registry = Registry::new(
            RegistryStore::new(dir.path().join("registry.json"), 4097),
            mailbox.clone(),
            None,
        )
        .spawn();
        let presence = Arc::new(EchoPresence {
            sent: Mutex::new(Vec::new()),
        });
        let connections = ConnectionManager::new(
            Arc::new(EchoTransport {
                presence: presence.clone(),
            }),
            registry.clone(),
            ManagerConfig::default(),
        );
        let server = GatewayServer::new(
            "127.0.0.1:0".parse().unwrap(),
            registry,
            connections,
        );
        Fixture {
            _dir: dir,
            mailbox,
            presence,
            state: server.state.clone(),
        }
    }

    async fn create(f: &Fixture, name: &str) -> AgentView {
        let (status, Json(view)) = create_agent_handler(
            State(f.state.clone()),
            Json(CreateAgentRequest {
                name: name.into(),
                persona: Some("cooks".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        view
    }

    #[tokio::test]
    async fn test_create_list_and_search() {
        let f = fixture();
        let chef = create(&f, "Chef Bot").await;
        assert_eq!(chef.id, "chef-bot");
        assert_eq!(chef.port, 4097);
        assert_eq!(chef.status, AgentStatus::PendingToken);

        let second = create(&f, "Chef Bot").await;
        assert_eq!(second.id, "chef-bot-2");
        assert_eq!(second.port, 4098);

        let Json(all) = list_agents_handler(State(f.state.clone())).await.unwrap();
        assert_eq!(all.len(), 2);

        let Json(pending) = pending_agents_handler(State(f.state.clone())).await.unwrap();
        assert_eq!(pending.len(), 2);

        let Json(found) = search_agents_handler(
            State(f.state.clone()),
            Query(SearchQuery {
                name: Some("chef".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 2);

        let err = search_agents_handler(State(f.state.clone()), Query(SearchQuery::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let f = fixture();
        let err = create_agent_handler(
            State(f.state.clone()),
            Json(CreateAgentRequest {
                name: "   ".into(),
                persona: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.kind, "invalid_request");
    }

    #[tokio::test]
    async fn test_activate_through_put() {
        let f = fixture();
        let chef = create(&f, "Chef").await;

        let err = update_agent_handler(
            State(f.state.clone()),
            Path(chef.id.clone()),
            Json(UpdateAgentRequest {
                token: Some("not-a-token".into()),
                status: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.kind, "invalid_token_format");

        let Json(view) = update_agent_handler(
            State(f.state.clone()),
            Path(chef.id.clone()),
            Json(UpdateAgentRequest {
                token: Some("aaa.bbb.ccc".into()),
                status: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(view.status, AgentStatus::ReadyToStart);
        assert!(view.has_token);
        assert_eq!(f.mailbox.pending().await.unwrap(), vec![chef.id.clone()]);

        let err = update_agent_handler(
            State(f.state.clone()),
            Path("ghost".into()),
            Json(UpdateAgentRequest {
                token: Some("aaa.bbb.ccc".into()),
                status: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_override_and_conflict() {
        let f = fixture();
        let chef = create(&f, "Chef").await;

        let Json(view) = update_agent_handler(
            State(f.state.clone()),
            Path(chef.id.clone()),
            Json(UpdateAgentRequest {
                token: None,
                status: Some(AgentStatus::Active),
            }),
        )
        .await
        .unwrap();
        assert_eq!(view.status, AgentStatus::Active);

        let err = update_agent_handler(
            State(f.state.clone()),
            Path(chef.id.clone()),
            Json(UpdateAgentRequest {
                token: Some("aaa.bbb.ccc".into()),
                status: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = update_agent_handler(
            State(f.state.clone()),
            Path(chef.id),
            Json(UpdateAgentRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_missing_agent() {
        let f = fixture();
        let err = get_agent_handler(State(f.state.clone()), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.body.kind, "not_found");
    }

    #[tokio::test]
    async fn test_send_through_primary() {
        let f = fixture();
        let err = send_handler(
            State(f.state.clone()),
            Json(SendMessageRequest {
                channel_id: "555".into(),
                content: "hello".into(),
                reply_to: None,
                bot_id: None,
                mention_bots: vec![],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.body.kind, "transport_error");

        f.state
            .connections
            .start(AgentConnectConfig {
                id: "bobb".into(),
                name: "BoBB".into(),
                token: "a.b.c".into(),
            })
            .await
            .unwrap();

        let Json(resp) = send_handler(
            State(f.state.clone()),
            Json(SendMessageRequest {
                channel_id: "555".into(),
                content: "hello".into(),
                reply_to: Some("9".into()),
                bot_id: Some("missing".into()),
                mention_bots: vec!["Nobody".into()],
            }),
        )
        .await
        .unwrap();
        assert!(resp.success);
        assert_eq!(resp.message_id, "m-1");
        assert_eq!(resp.sent_by, "bobb");
        assert_eq!(resp.unresolved_bots, vec!["Nobody".to_string()]);

        let sent = f.presence.sent.lock().unwrap();
        assert_eq!(sent[0].content, "hello");
        assert_eq!(sent[0].reply_to.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_send_validates_body() {
        let f = fixture();
        let err = send_handler(
            State(f.state.clone()),
            Json(SendMessageRequest {
                channel_id: " ".into(),
                content: "hello".into(),
                reply_to: None,
                bot_id: None,
                mention_bots: vec![],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_router_builds() {
        let f = fixture();
        let server = GatewayServer {
            state: f.state.clone(),
            bind: "127.0.0.1:0".parse().unwrap(),
        };
        let _router = server.router();
    }
}
