use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use launchpad_common::{spawn_metric, AppError, Event, EventSystem, MetricsSink};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::registry::{ConnectionId, ConnectionRegistry};

/// Inbound client envelope: `{"type": ..., "data": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe {
        channels: Vec<String>,
    },
    Unsubscribe {
        channels: Vec<String>,
    },
    JoinRoom {
        room: String,
    },
    LeaveRoom {
        room: String,
    },
    TrackEvent(Value),
    GetRealtimeData {
        #[serde(rename = "dataType")]
        data_type: String,
    },
}

/// Client-facing websocket endpoint: handshake validation, one writer pump
/// and one reader loop per connection.
pub struct WebSocketServer {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<dyn MetricsSink>,
    event_system: Arc<EventSystem>,
    allowed_origins: Vec<String>,
    jwt_secret: Option<String>,
    port: u16,
}

impl WebSocketServer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<dyn MetricsSink>,
        event_system: Arc<EventSystem>,
        allowed_origins: Vec<String>,
        jwt_secret: Option<String>,
        port: u16,
    ) -> Self {
        Self {
            registry,
            metrics,
            event_system,
            allowed_origins,
            jwt_secret,
            port,
        }
    }

    pub async fn start(&self, stop_rx: watch::Receiver<bool>) -> Result<JoinHandle<()>, AppError> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::ServerError(format!("Failed to bind {}: {}", addr, e)))?;
        info!("WebSocket server listening on {}", addr);

        let registry = Arc::clone(&self.registry);
        let metrics = Arc::clone(&self.metrics);
        let event_system = Arc::clone(&self.event_system);
        let allowed_origins = self.allowed_origins.clone();
        let jwt_secret = self.jwt_secret.clone();
        let mut stop_rx = stop_rx;

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("New connection from {}", peer);
                            let registry = Arc::clone(&registry);
                            let metrics = Arc::clone(&metrics);
                            let event_system = Arc::clone(&event_system);
                            let allowed_origins = allowed_origins.clone();
                            let jwt_secret = jwt_secret.clone();
                            let stop_rx = stop_rx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    stream,
                                    registry,
                                    metrics,
                                    event_system,
                                    allowed_origins,
                                    jwt_secret,
                                    stop_rx,
                                )
                                .await
                                {
                                    debug!("Connection ended with error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            info!("WebSocket server stopped");
        }))
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<dyn MetricsSink>,
    event_system: Arc<EventSystem>,
    allowed_origins: Vec<String>,
    jwt_secret: Option<String>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let mut identity: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |req: &Request, response: Response| {
        match authorize_handshake(req, &allowed_origins, jwt_secret.as_deref()) {
            Ok(authorized) => {
                identity = authorized;
                Ok(response)
            }
            Err(reason) => {
                debug!("Refusing handshake: {}", reason);
                let mut refusal = ErrorResponse::new(Some(reason));
                *refusal.status_mut() = StatusCode::FORBIDDEN;
                Err(refusal)
            }
        }
    })
    .await
    .map_err(|e| AppError::WebSocketError(format!("Handshake failed: {}", e)))?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let connection_id = registry.register(outbound_tx.clone(), identity).await;
    event_system.emit(Event::ConnectionOpened { connection_id });
    {
        let metrics = Arc::clone(&metrics);
        spawn_metric(async move { metrics.increment("connections_opened").await });
    }

    // Writer pump: the registry and the session only ever touch the
    // channel, never the sink, so delivery cannot block a lock holder.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sender.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let _ = outbound_tx.send(Message::Text(
        json!({
            "type": "connected",
            "data": {
                "connectionId": connection_id,
                "timestamp": Utc::now().timestamp_millis(),
            }
        })
        .to_string()
        .into(),
    ));

    let session = ClientSession::new(connection_id, Arc::clone(&registry), Arc::clone(&metrics));

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    registry.touch(connection_id).await;
                    session.handle_text(&text, &outbound_tx).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    registry.touch(connection_id).await;
                    let _ = outbound_tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Pong(_))) => {
                    registry.touch(connection_id).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {}", connection_id, e);
                    break;
                }
            }
        }
    }

    registry.deregister(connection_id).await;
    event_system.emit(Event::ConnectionClosed { connection_id });
    drop(outbound_tx);
    let _ = writer.await;
    debug!("Connection {} closed", connection_id);
    Ok(())
}

/// Origin allow-list plus optional bearer verification, both before any
/// connection object exists. `Ok(None)` is an anonymous connection.
fn authorize_handshake(
    req: &Request,
    allowed_origins: &[String],
    jwt_secret: Option<&str>,
) -> Result<Option<String>, String> {
    if !allowed_origins.is_empty() {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok());
        match origin {
            Some(origin)
                if allowed_origins
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(origin)) => {}
            _ => return Err("origin not allowed".to_string()),
        }
    }

    let Some(header) = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| "malformed authorization header".to_string())?;
    let secret = jwt_secret.ok_or_else(|| "bearer credentials not accepted".to_string())?;
    let claims = verify_bearer(token, secret).map_err(|e| e.to_string())?;
    Ok(Some(claims.sub))
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

fn verify_bearer(token: &str, secret: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|e| AppError::AuthError(format!("Invalid bearer token: {}", e)))
}

/// Per-connection protocol logic, separated from the socket plumbing so it
/// can be driven directly in tests.
pub struct ClientSession {
    connection_id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<dyn MetricsSink>,
}

impl ClientSession {
    pub fn new(
        connection_id: ConnectionId,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            connection_id,
            registry,
            metrics,
        }
    }

    pub async fn handle_text(&self, text: &str, reply: &mpsc::UnboundedSender<Message>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_message(message, reply).await,
            Err(e) => {
                // Malformed input answers the sender only; the connection
                // stays open.
                self.send_error(reply, &format!("Invalid message: {}", e));
            }
        }
    }

    pub async fn handle_message(
        &self,
        message: ClientMessage,
        reply: &mpsc::UnboundedSender<Message>,
    ) {
        match message {
            ClientMessage::Ping => {
                self.send_json(
                    reply,
                    json!({
                        "type": "pong",
                        "data": {"timestamp": Utc::now().timestamp_millis()}
                    }),
                );
            }
            ClientMessage::Subscribe { channels } => {
                let mut accepted = Vec::new();
                for channel in channels {
                    if self.registry.join_room(self.connection_id, &channel).await {
                        accepted.push(channel);
                    }
                }
                // Unrecognized channels get no acknowledgement at all.
                if !accepted.is_empty() {
                    self.send_json(
                        reply,
                        json!({"type": "subscribed", "data": {"channels": accepted}}),
                    );
                }
            }
            ClientMessage::Unsubscribe { channels } => {
                let mut removed = Vec::new();
                for channel in channels {
                    if self.registry.leave_room(self.connection_id, &channel).await {
                        removed.push(channel);
                    }
                }
                if !removed.is_empty() {
                    self.send_json(
                        reply,
                        json!({"type": "unsubscribed", "data": {"channels": removed}}),
                    );
                }
            }
            ClientMessage::JoinRoom { room } => {
                if self.registry.join_room(self.connection_id, &room).await {
                    self.send_json(reply, json!({"type": "room_joined", "data": {"room": room}}));
                }
            }
            ClientMessage::LeaveRoom { room } => {
                if self.registry.leave_room(self.connection_id, &room).await {
                    self.send_json(reply, json!({"type": "room_left", "data": {"room": room}}));
                }
            }
            ClientMessage::TrackEvent(data) => {
                let name = data
                    .get("event")
                    .and_then(|value| value.as_str())
                    .unwrap_or("client_event")
                    .to_string();
                let metrics = Arc::clone(&self.metrics);
                spawn_metric(async move {
                    metrics.increment(&format!("client_{}", name)).await
                });
            }
            ClientMessage::GetRealtimeData { data_type } => match data_type.as_str() {
                "platform_stats" => {
                    let connections = self.registry.connection_count().await;
                    let rooms = self.registry.room_count().await;
                    self.send_json(
                        reply,
                        json!({
                            "type": "platform_stats",
                            "data": {
                                "connections": connections,
                                "rooms": rooms,
                                "timestamp": Utc::now().timestamp_millis(),
                            }
                        }),
                    );
                }
                other => self.send_error(reply, &format!("Unknown data type: {}", other)),
            },
        }
    }

    fn send_json(&self, reply: &mpsc::UnboundedSender<Message>, value: Value) {
        let _ = reply.send(Message::Text(value.to_string().into()));
    }

    fn send_error(&self, reply: &mpsc::UnboundedSender<Message>, message: &str) {
        let _ = reply.send(Message::Text(
            json!({"type": "error", "data": {"message": message}})
                .to_string()
                .into(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use launchpad_common::NullMetricsSink;
    use serde::Serialize;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn session() -> (ClientSession, Arc<ConnectionRegistry>, ConnectionId) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register(tx, None).await;
        let session = ClientSession::new(id, Arc::clone(&registry), Arc::new(NullMetricsSink));
        (session, registry, id)
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Value> {
        let mut seen = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                seen.push(serde_json::from_str(&text).unwrap());
            }
        }
        seen
    }

    #[test]
    fn inbound_envelopes_parse() {
        let subscribe: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","data":{"channels":["token_events"]}}"#)
                .unwrap();
        assert!(matches!(subscribe, ClientMessage::Subscribe { .. }));

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let join: ClientMessage =
            serde_json::from_str(r#"{"type":"join_room","data":{"room":"token:0xabc"}}"#).unwrap();
        assert!(matches!(join, ClientMessage::JoinRoom { .. }));

        let realtime: ClientMessage =
            serde_json::from_str(r#"{"type":"get_realtime_data","data":{"dataType":"platform_stats"}}"#)
                .unwrap();
        assert!(matches!(realtime, ClientMessage::GetRealtimeData { .. }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shutdown"}"#).is_err());
    }

    #[tokio::test]
    async fn subscribing_to_an_unknown_channel_is_silent() {
        let (session, registry, id) = session().await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        session
            .handle_text(
                r#"{"type":"subscribe","data":{"channels":["not-a-real-channel"]}}"#,
                &reply_tx,
            )
            .await;

        // No subscribed message and no membership change.
        assert!(drain(&mut reply_rx).is_empty());
        assert!(registry.rooms_of(id).await.is_empty());
    }

    #[tokio::test]
    async fn valid_subscriptions_are_acknowledged() {
        let (session, registry, id) = session().await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        session
            .handle_text(
                r#"{"type":"subscribe","data":{"channels":["token_events","bogus","token:0xabc"]}}"#,
                &reply_tx,
            )
            .await;

        let replies = drain(&mut reply_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "subscribed");
        assert_eq!(
            replies[0]["data"]["channels"],
            json!(["token_events", "token:0xabc"])
        );
        assert_eq!(registry.rooms_of(id).await.len(), 2);
    }

    #[tokio::test]
    async fn ping_gets_a_pong() {
        let (session, _registry, _id) = session().await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        session.handle_text(r#"{"type":"ping"}"#, &reply_tx).await;
        let replies = drain(&mut reply_rx);
        assert_eq!(replies[0]["type"], "pong");
    }

    #[tokio::test]
    async fn join_and_leave_rooms_round_trip() {
        let (session, registry, id) = session().await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        session
            .handle_text(r#"{"type":"join_room","data":{"room":"token:0xabc"}}"#, &reply_tx)
            .await;
        session
            .handle_text(r#"{"type":"leave_room","data":{"room":"token:0xabc"}}"#, &reply_tx)
            .await;
        // Leaving again is silent.
        session
            .handle_text(r#"{"type":"leave_room","data":{"room":"token:0xabc"}}"#, &reply_tx)
            .await;

        let replies = drain(&mut reply_rx);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["type"], "room_joined");
        assert_eq!(replies[1]["type"], "room_left");
        assert!(registry.rooms_of(id).await.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_answers_with_an_error() {
        let (session, registry, id) = session().await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        session.handle_text("{not json", &reply_tx).await;

        let replies = drain(&mut reply_rx);
        assert_eq!(replies[0]["type"], "error");
        // The connection survives the bad input.
        assert!(registry.join_room(id, "token_events").await);
    }

    #[tokio::test]
    async fn platform_stats_snapshot_is_served() {
        let (session, registry, id) = session().await;
        registry.join_room(id, "token_events").await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        session
            .handle_text(
                r#"{"type":"get_realtime_data","data":{"dataType":"platform_stats"}}"#,
                &reply_tx,
            )
            .await;
        session
            .handle_text(
                r#"{"type":"get_realtime_data","data":{"dataType":"secrets"}}"#,
                &reply_tx,
            )
            .await;

        let replies = drain(&mut reply_rx);
        assert_eq!(replies[0]["type"], "platform_stats");
        assert_eq!(replies[0]["data"]["connections"], 1);
        assert_eq!(replies[0]["data"]["rooms"], 1);
        assert_eq!(replies[1]["type"], "error");
    }

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
    }

    fn token_for(sub: &str, secret: &str) -> String {
        encode(
            &Header::default(),
            &TestClaims {
                sub: sub.to_string(),
                exp: 4102444800, // far future
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn bearer_tokens_verify_against_the_secret() {
        let token = token_for("user-42", "topsecret");
        let claims = verify_bearer(&token, "topsecret").unwrap();
        assert_eq!(claims.sub, "user-42");
        assert!(verify_bearer(&token, "wrong").is_err());
    }

    fn request_with(origin: Option<&str>, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("ws://localhost/ws");
        if let Some(origin) = origin {
            builder = builder.header("origin", origin);
        }
        if let Some(authorization) = authorization {
            builder = builder.header("authorization", authorization);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn disallowed_origins_are_refused() {
        let allowed = vec!["https://launchpad.example".to_string()];

        let ok = request_with(Some("https://launchpad.example"), None);
        assert_eq!(authorize_handshake(&ok, &allowed, None), Ok(None));

        let bad = request_with(Some("https://evil.example"), None);
        assert!(authorize_handshake(&bad, &allowed, None).is_err());

        let missing = request_with(None, None);
        assert!(authorize_handshake(&missing, &allowed, None).is_err());

        // An empty allow-list admits any origin.
        assert_eq!(authorize_handshake(&bad, &[], None), Ok(None));
    }

    #[test]
    fn bearer_identity_is_attached_at_the_handshake() {
        let token = token_for("user-42", "topsecret");
        let req = request_with(None, Some(&format!("Bearer {}", token)));

        let identity = authorize_handshake(&req, &[], Some("topsecret")).unwrap();
        assert_eq!(identity.as_deref(), Some("user-42"));

        // Invalid token refuses the handshake outright.
        let bad = request_with(None, Some("Bearer nope"));
        assert!(authorize_handshake(&bad, &[], Some("topsecret")).is_err());

        // Bearer presented but auth not configured.
        assert!(authorize_handshake(&req, &[], None).is_err());
    }
}
