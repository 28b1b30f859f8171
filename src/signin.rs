//! Interactive sign-in over WebSocket: a strict state machine that relays
//! between the client and a dedicated CM authentication session, and merges
//! the resulting token into the account fleet.

use std::sync::Arc;

use actix::{
    Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler, WrapFuture,
};
use actix_web_actors::ws;
use tracing::warn;

use crate::cm::{
    parse_auth_token, with_timeout, AuthEvent, AuthRequest, CmError, CmSession, ConfirmationKind,
};
use crate::coordinator::TokenAdopted;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::AppState;

/// Upper bound on incoming frames; larger messages are treated as abuse
/// and drop the connection.
const RX_BUFFER_SIZE: usize = 32 * 1024;
const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Which incoming messages are currently legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SigninState {
    AwaitingInit,
    AwaitingCmResponse,
    AwaitingConfirmation,
    Done,
    Disconnected,
}

#[derive(Message)]
#[rtype(result = "()")]
struct AuthReady(Arc<dyn CmSession>);

#[derive(Message)]
#[rtype(result = "()")]
struct AuthFailed(CmError);

#[derive(Message)]
#[rtype(result = "()")]
struct Progress(AuthEvent);

pub struct SigninSession {
    state: SigninState,
    app: AppState,
    session: Option<Arc<dyn CmSession>>,
}

type Ctx = ws::WebsocketContext<SigninSession>;

impl SigninSession {
    pub fn new(app: AppState) -> Self {
        Self {
            state: SigninState::AwaitingInit,
            app,
            session: None,
        }
    }

    fn send(&self, ctx: &mut Ctx, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(text) => ctx.text(text),
            Err(err) => warn!("Failed to serialize sign-in message: {err}"),
        }
    }

    fn fail(&mut self, ctx: &mut Ctx, err: &CmError) {
        self.send(ctx, &ServerMessage::Failure { error: err.wire() });
        ctx.stop();
    }

    /// Connect a fresh CM session and start the authentication flow; its
    /// progress events are pumped back into this actor.
    fn start_auth(&mut self, ctx: &mut Ctx, request: AuthRequest) {
        self.state = SigninState::AwaitingCmResponse;
        let connector = Arc::clone(&self.app.connector);
        let addr = ctx.address();
        ctx.spawn(
            async move {
                let session = match with_timeout(CONNECT_TIMEOUT_MS, connector.connect()).await {
                    Ok(session) => session,
                    Err(err) => {
                        addr.do_send(AuthFailed(err));
                        return;
                    }
                };
                let mut events = match session.begin_auth(&device_name(), request).await {
                    Ok(events) => events,
                    Err(err) => {
                        session.disconnect().await;
                        addr.do_send(AuthFailed(err));
                        return;
                    }
                };
                addr.do_send(AuthReady(session));
                while let Some(event) = events.recv().await {
                    let last = matches!(&event, AuthEvent::Completed(_));
                    addr.do_send(Progress(event));
                    if last {
                        break;
                    }
                }
            }
            .into_actor(self),
        );
    }

    fn submit(&mut self, ctx: &mut Ctx, kind: ConfirmationKind, code: String) {
        self.state = SigninState::AwaitingCmResponse;
        let Some(session) = self.session.clone() else {
            ctx.stop();
            return;
        };
        let addr = ctx.address();
        ctx.spawn(
            async move {
                if let Err(err) = session.submit_confirmation(kind, &code).await {
                    addr.do_send(AuthFailed(err));
                }
            }
            .into_actor(self),
        );
    }

    fn complete(&mut self, ctx: &mut Ctx, result: Result<String, CmError>) {
        let token = match result {
            Ok(token) => token,
            Err(err) => {
                self.fail(ctx, &err);
                return;
            }
        };
        let Some(info) = parse_auth_token(&token) else {
            warn!("Sign-in produced a token that does not parse");
            self.fail(ctx, &CmError::Transport("invalid token".into()));
            return;
        };
        self.state = SigninState::Done;
        self.send(
            ctx,
            &ServerMessage::Complete {
                renewable: info.renewable,
                expires: (!info.renewable).then_some(info.expires as u64),
            },
        );
        self.app.coordinator.do_send(TokenAdopted { token, info });
        if let Some(session) = self.session.take() {
            actix::spawn(async move { session.disconnect().await });
        }
        ctx.close(None);
        ctx.stop();
    }
}

impl Actor for SigninSession {
    type Context = Ctx;

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        // The auth session dies with the connection unless sign-in already
        // finished and handed its token over.
        if let Some(session) = self.session.take() {
            actix::spawn(async move { session.disconnect().await });
        }
        self.state = SigninState::Disconnected;
        Running::Stop
    }
}

impl Handler<AuthReady> for SigninSession {
    type Result = ();

    fn handle(&mut self, msg: AuthReady, _ctx: &mut Self::Context) {
        self.session = Some(msg.0);
    }
}

impl Handler<AuthFailed> for SigninSession {
    type Result = ();

    fn handle(&mut self, msg: AuthFailed, ctx: &mut Self::Context) {
        self.fail(ctx, &msg.0);
    }
}

impl Handler<Progress> for SigninSession {
    type Result = ();

    fn handle(&mut self, msg: Progress, ctx: &mut Self::Context) {
        match msg.0 {
            AuthEvent::NewUrl(url) => {
                self.send(ctx, &ServerMessage::Challenge { url });
            }
            AuthEvent::ConfirmationRequired(kinds) => {
                self.state = SigninState::AwaitingConfirmation;
                self.send(
                    ctx,
                    &ServerMessage::Confirmations {
                        confirmations: kinds.iter().map(|kind| kind.as_str()).collect(),
                    },
                );
            }
            AuthEvent::Completed(result) => self.complete(ctx, result),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SigninSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => ctx.pong(&payload),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Text(text)) => {
                if text.len() > RX_BUFFER_SIZE {
                    ctx.stop();
                    return;
                }
                let msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => msg,
                    Err(_) => {
                        ctx.stop();
                        return;
                    }
                };
                match (self.state, msg) {
                    (
                        SigninState::AwaitingInit,
                        ClientMessage::Credentials {
                            account_name,
                            password,
                        },
                    ) => self.start_auth(
                        ctx,
                        AuthRequest::Credentials {
                            account_name,
                            password,
                        },
                    ),
                    (SigninState::AwaitingInit, ClientMessage::Qr) => {
                        self.start_auth(ctx, AuthRequest::Qr)
                    }
                    (SigninState::AwaitingConfirmation, ClientMessage::GuardCode { code }) => {
                        self.submit(ctx, ConfirmationKind::GuardCode, code)
                    }
                    (SigninState::AwaitingConfirmation, ClientMessage::Email { code }) => {
                        self.submit(ctx, ConfirmationKind::Email, code)
                    }
                    // Anything out of order closes the connection.
                    _ => ctx.stop(),
                }
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            // Binary, continuation or malformed frames drop the connection.
            Ok(ws::Message::Nop) => {}
            _ => ctx.stop(),
        }
    }
}

fn device_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
    format!("tek-s3 {} @ {}", env!("CARGO_PKG_VERSION"), host)
}
