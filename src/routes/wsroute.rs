//! WebSocket endpoints: handshake, in-session message handling, egress.
//!
//! Each accepted connection runs as one actor that is also the session's
//! egress writer: two bridge tasks forward the outbox and the control
//! channel into the actor mailbox, and the actor writes frames in sequence
//! order with `ctx.text`. A failed handshake still completes the WebSocket
//! upgrade and then closes with a policy-violation code, so clients always
//! observe an explicit close reason.

use std::sync::Arc;
use std::time::Duration;

use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::http::header;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use tracing::{info, warn};

use crate::models::Channel;
use crate::state::AppState;
use crate::websocket::messages::{
    parse_client_message, ClientMessage, ClientMessageError, ServerMessage, SubscriptionAction,
    CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, CLOSE_SERVER_ERROR, ERR_CHANNEL_FORBIDDEN,
    ERR_MESSAGE_PARSING, ERR_UNSUPPORTED_TYPE,
};
use crate::websocket::session::{
    OutboxEntry, Session, SessionControl, SessionHandle, SessionManager, REASON_CLIENT_CLOSE,
    REASON_POLICY_VIOLATION, REASON_WRITE_FAILURE,
};
use crate::websocket::subscription::SubscriptionRegistry;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct DeliverFrame(OutboxEntry);

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct ServerClose {
    code: u16,
    reason: String,
}

fn close_code(code: u16) -> ws::CloseCode {
    match code {
        CLOSE_NORMAL => ws::CloseCode::Normal,
        CLOSE_POLICY_VIOLATION => ws::CloseCode::Policy,
        CLOSE_SERVER_ERROR => ws::CloseCode::Error,
        other => ws::CloseCode::Other(other),
    }
}

pub fn extract_token(req: &HttpRequest, query_token: Option<&str>) -> Option<String> {
    query_token.map(str::to_string).or_else(|| {
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(str::to_string)
    })
}

/// Actor that completes the upgrade only to deliver a close frame.
struct RejectSession {
    description: String,
}

impl Actor for RejectSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason {
            code: close_code(CLOSE_POLICY_VIOLATION),
            description: Some(self.description.clone()),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RejectSession {
    fn handle(&mut self, _msg: Result<ws::Message, ws::ProtocolError>, _ctx: &mut Self::Context) {}
}

fn reject(
    req: &HttpRequest,
    stream: web::Payload,
    description: &str,
) -> Result<HttpResponse, Error> {
    ws::start(
        RejectSession {
            description: description.to_string(),
        },
        req,
        stream,
    )
}

struct WsSession {
    session: Arc<Session>,
    manager: Arc<SessionManager>,
    registry: Arc<SubscriptionRegistry>,
    drain_grace: Duration,
    close_reason: Option<String>,
}

impl WsSession {
    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: ServerMessage) {
        match message.to_json() {
            Ok(json) => ctx.text(json),
            Err(e) => warn!(error = %e, "failed to serialize server message"),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_client_message(text) {
            Ok(ClientMessage::Ping) => {
                self.send_message(ctx, ServerMessage::pong());
            }
            Ok(message) => {
                let Some((action, predicate)) = message.subscription() else {
                    return;
                };
                let channel = predicate.channel();
                if !self.session.may_access(channel) {
                    warn!(
                        session_id = %self.session.session_id,
                        channel = %channel,
                        "subscription denied by role policy"
                    );
                    self.send_message(
                        ctx,
                        ServerMessage::error(
                            ERR_CHANNEL_FORBIDDEN,
                            &format!("roles do not permit channel {channel}"),
                        ),
                    );
                    return;
                }

                match action {
                    SubscriptionAction::Subscribe => {
                        self.registry
                            .subscribe(self.session.session_id, predicate.clone());
                    }
                    SubscriptionAction::Unsubscribe => {
                        self.registry
                            .unsubscribe(self.session.session_id, &predicate);
                    }
                }
                self.send_message(
                    ctx,
                    ServerMessage::subscription_confirmed(channel, action, predicate.describe()),
                );
            }
            Err(ClientMessageError::Unsupported(message_type)) => {
                self.send_message(
                    ctx,
                    ServerMessage::error(
                        ERR_UNSUPPORTED_TYPE,
                        &format!("unsupported messageType {message_type}"),
                    ),
                );
            }
            Err(ClientMessageError::Malformed(detail)) => {
                self.send_message(ctx, ServerMessage::error(ERR_MESSAGE_PARSING, &detail));
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.session.mark_open();
        info!(
            session_id = %self.session.session_id,
            user_id = %self.session.user_id,
            endpoint = %self.session.endpoint,
            "websocket session open"
        );
        self.send_message(ctx, ServerMessage::connection_ack(self.session.session_id));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let reason = self
            .close_reason
            .take()
            .unwrap_or_else(|| REASON_CLIENT_CLOSE.to_string());
        self.manager.remove(self.session.session_id, &reason);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.session.touch();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.session.touch();
            }
            Ok(ws::Message::Text(text)) => {
                self.session.touch();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.send_message(
                    ctx,
                    ServerMessage::error(ERR_UNSUPPORTED_TYPE, "binary frames are not supported"),
                );
            }
            Ok(ws::Message::Close(reason)) => {
                self.close_reason = Some(REASON_CLIENT_CLOSE.to_string());
                ctx.close(reason);
                ctx.stop();
            }
            Err(ws::ProtocolError::Overflow) => {
                warn!(
                    session_id = %self.session.session_id,
                    "inbound frame exceeded the message size limit"
                );
                self.close_reason = Some(REASON_POLICY_VIOLATION.to_string());
                ctx.close(Some(ws::CloseReason {
                    code: close_code(CLOSE_POLICY_VIOLATION),
                    description: Some("message size limit exceeded".into()),
                }));
                ctx.stop();
            }
            Err(e) => {
                warn!(
                    session_id = %self.session.session_id,
                    error = %e,
                    "websocket protocol error"
                );
                self.close_reason = Some(REASON_WRITE_FAILURE.to_string());
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl Handler<DeliverFrame> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: DeliverFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0.payload.as_str());
        self.session.record_sent(&msg.0);
    }
}

impl Handler<ServerClose> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: ServerClose, ctx: &mut Self::Context) {
        self.close_reason = Some(msg.reason.clone());
        let code = close_code(msg.code);
        let reason = msg.reason;
        // Frames already queued in the mailbox flush during the grace
        // window before the close goes out.
        ctx.run_later(self.drain_grace, move |_, ctx| {
            ctx.close(Some(ws::CloseReason {
                code,
                description: Some(reason),
            }));
            ctx.stop();
        });
    }
}

async fn connect(
    channel: Channel,
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    params: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    if !state.config.allows_any_origin() {
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        let allowed = origin
            .map(|o| state.config.wire.allowed_origins.iter().any(|a| a == o))
            .unwrap_or(false);
        if !allowed {
            warn!(channel = %channel, ?origin, "connection rejected: origin not allowed");
            return reject(&req, stream, "origin not allowed");
        }
    }

    let Some(token) = extract_token(&req, params.token.as_deref()) else {
        warn!(channel = %channel, "connection rejected: no access token");
        return reject(&req, stream, "missing access token");
    };

    let auth = match state.validator.validate(&token) {
        Ok(auth) => auth,
        Err(e) => {
            warn!(channel = %channel, error = %e, "connection rejected: invalid token");
            return reject(&req, stream, "invalid access token");
        }
    };

    if !auth.may_access(channel) {
        warn!(
            channel = %channel,
            user_id = %auth.user_id,
            "connection rejected: role not permitted"
        );
        return reject(&req, stream, "role not permitted for channel");
    }

    let SessionHandle {
        session,
        mut outbox_rx,
        mut control_rx,
    } = state.sessions.register(&auth, channel);

    let actor = WsSession {
        session: session.clone(),
        manager: state.sessions.clone(),
        registry: state.registry.clone(),
        drain_grace: Duration::from_millis(state.config.session.drain_grace_ms),
        close_reason: None,
    };

    let (addr, resp) = ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(state.config.wire.message_size_limit as usize)
        .start_with_addr()?;

    // Bridge the session's outbox and control channel into the actor
    // mailbox; both tasks end when the session is torn down and the
    // senders drop.
    let outbox_addr = addr.clone();
    tokio::spawn(async move {
        while let Some(entry) = outbox_rx.recv().await {
            outbox_addr.do_send(DeliverFrame(entry));
        }
    });
    tokio::spawn(async move {
        while let Some(SessionControl::Close { code, reason }) = control_rx.recv().await {
            addr.do_send(ServerClose { code, reason });
        }
    });

    Ok(resp)
}

#[get("/ws/positions")]
pub async fn ws_positions(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    params: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    connect(Channel::Positions, req, stream, state, params).await
}

#[get("/ws/inventory")]
pub async fn ws_inventory(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    params: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    connect(Channel::Inventory, req, stream, state, params).await
}

#[get("/ws/locates")]
pub async fn ws_locates(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    params: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    connect(Channel::Locates, req, stream, state, params).await
}

#[get("/ws/alerts")]
pub async fn ws_alerts(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    params: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    connect(Channel::Alerts, req, stream, state, params).await
}

#[get("/ws/admin/rules")]
pub async fn ws_admin_rules(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    params: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    connect(Channel::Admin, req, stream, state, params).await
}
