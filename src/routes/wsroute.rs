use crate::middleware::guards::User;
use crate::models::UserId;
use crate::state::AppState;
use crate::websocket::rate_limit::frame_limiter;
use crate::websocket::{ConnectionId, ConnectionRegistry, Frame, WsInboundEvent};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use governor::DefaultDirectRateLimiter;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// WebSocket Actor
struct WsSession {
    user_id: UserId,
    connection_id: ConnectionId,
    state: web::Data<AppState>,
    frames: Option<Receiver<Frame>>,
    limiter: DefaultDirectRateLimiter,
    hb: Instant,
}

impl WsSession {
    fn new(
        user_id: UserId,
        connection_id: ConnectionId,
        frames: Receiver<Frame>,
        state: web::Data<AppState>,
    ) -> Self {
        let limiter = frame_limiter(
            state.config.ws.rate_limit_per_sec,
            state.config.ws.rate_limit_burst,
        );
        Self {
            user_id,
            connection_id,
            state,
            frames: Some(frames),
            limiter,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!(user_id = act.user_id, "WebSocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_text(&mut self, text: &str) {
        if self.limiter.check().is_err() {
            warn!(user_id = self.user_id, "WebSocket frame dropped by rate limit");
            return;
        }

        match serde_json::from_str::<WsInboundEvent>(text) {
            Ok(WsInboundEvent::Typing { conversation_id }) => {
                let state = self.state.clone();
                let user_id = self.user_id;
                actix::spawn(async move {
                    match state.messaging.typing(user_id, conversation_id).await {
                        Ok(outcome) => state.registry.dispatch(outcome.notifications).await,
                        Err(e) => {
                            warn!(user_id, %conversation_id, error = %e, "typing event failed")
                        }
                    }
                });
            }
            Err(e) => {
                debug!(user_id = self.user_id, error = %e, "ignoring unrecognised WS frame");
            }
        }
    }
}

/// Turns the hub's receiver into a stream the actor context can own.
fn frame_stream(rx: Receiver<Frame>) -> impl futures::Stream<Item = Frame> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (f, rx)) })
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(user_id = self.user_id, "WebSocket session started");
        self.hb(ctx);
        if let Some(rx) = self.frames.take() {
            ctx.add_stream(frame_stream(rx));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(user_id = self.user_id, "WebSocket session stopped");

        let registry: ConnectionRegistry = self.state.registry.clone();
        let user_id = self.user_id;
        let connection_id = self.connection_id;
        actix::spawn(async move {
            registry.unregister(user_id, connection_id).await;
        });
    }
}

// Outbound events pushed by the hub. When the hub drops this connection's
// sender the stream ends and the session stops.
impl StreamHandler<Frame> for WsSession {
    fn handle(&mut self, frame: Frame, ctx: &mut Self::Context) {
        ctx.text(frame.to_string());
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                self.handle_text(&text);
            }
            Ok(ws::Message::Binary(_)) => {
                warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                info!(user_id = self.user_id, ?reason, "WebSocket close message received");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(user_id = self.user_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

// HTTP handler
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, Error> {
    let (connection_id, rx) = state.registry.register(user.id).await;
    let session = WsSession::new(user.id, connection_id, rx, state.clone());

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            state.registry.unregister(user.id, connection_id).await;
            Err(e)
        }
    }
}
