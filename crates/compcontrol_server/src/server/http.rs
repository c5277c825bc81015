#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use compcontrol_domain::{AuthKey, ConnectionId};
use compcontrol_protocol::{InboundEvent, KeyIssuedBody, MessageBody};
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error, info, warn};

use crate::server::auth::Authorizer;
use crate::server::gateway::LocalGateway;
use crate::server::handler::{EventHandler, EventResponse};
use crate::server::health::HealthState;
use crate::server::key_store::KeyIssuer;

/// Header carrying the presented key on connect and dispatch.
pub const AUTH_HEADER: &str = "auth";

/// Path prefix for dispatch requests: `/command/{command}`.
pub const COMMAND_PATH_PREFIX: &str = "/command/";

/// Path for key issuance.
pub const KEY_PATH: &str = "/key";

type HttpResponse = Response<Full<Bytes>>;

/// Everything the HTTP boundary needs to turn requests into events.
#[derive(Clone)]
pub struct AppState {
	pub handler: Arc<EventHandler>,
	pub authorizer: Authorizer,
	pub issuer: KeyIssuer,
	pub gateway: LocalGateway,
	pub health: HealthState,
	pub ws_path: String,
}

/// Accept HTTP/1.1 connections until `shutdown` flips to `true`.
pub async fn serve(listener: TcpListener, state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, remote) = match accepted {
					Ok(v) => v,
					Err(e) => {
						warn!(error = %e, "accept failed");
						continue;
					}
				};

				let io = TokioIo::new(stream);
				let state = state.clone();
				tokio::spawn(async move {
					let service = service_fn(move |req| route(req, state.clone()));
					if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
						debug!(%remote, error = %err, "http connection error");
					}
				});
			}
			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					info!("http server stopping");
					return Ok(());
				}
			}
		}
	}
}

async fn route(req: Request<Incoming>, state: AppState) -> Result<HttpResponse, Infallible> {
	let path = req.uri().path().to_string();
	let method = req.method().clone();

	if let Some((status, body)) = state.health.probe(&path) {
		if method != Method::GET {
			return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
		}
		return Ok(text_response(status, body));
	}

	if path == state.ws_path {
		if method != Method::GET {
			return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
		}
		return Ok(handle_upgrade(req, state).await);
	}

	if path == KEY_PATH {
		if method != Method::GET {
			return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
		}
		return Ok(handle_issue_key(&state).await);
	}

	if let Some(command) = path.strip_prefix(COMMAND_PATH_PREFIX) {
		if method != Method::GET && method != Method::POST {
			return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
		}
		if command.is_empty() || command.contains('/') {
			return Ok(empty_response(StatusCode::NOT_FOUND));
		}

		let event = InboundEvent::DispatchRequest {
			command: command.to_string(),
			presented_key: AuthKey::from_presented(auth_header(req.headers())),
		};
		let resp = state.handler.handle(event).await;
		return Ok(event_response(resp));
	}

	Ok(empty_response(StatusCode::NOT_FOUND))
}

async fn handle_issue_key(state: &AppState) -> HttpResponse {
	match state.issuer.issue().await {
		Ok(key) => json_response(
			StatusCode::OK,
			&KeyIssuedBody {
				key: key.expose().to_string(),
			},
		),
		Err(e) => {
			error!(error = %e, "key issuance failed");
			json_response(StatusCode::INTERNAL_SERVER_ERROR, &MessageBody::new("Internal server error"))
		}
	}
}

async fn handle_upgrade(mut req: Request<Incoming>, state: AppState) -> HttpResponse {
	let is_upgrade =
		header_has_token(req.headers(), &UPGRADE, "websocket") && header_has_token(req.headers(), &CONNECTION, "upgrade");
	let ws_key = req.headers().get(SEC_WEBSOCKET_KEY).map(|v| v.as_bytes().to_vec());
	let Some(ws_key) = ws_key.filter(|_| is_upgrade) else {
		return empty_response(StatusCode::BAD_REQUEST);
	};

	let presented = AuthKey::from_presented(auth_header(req.headers()));
	let decision = state.authorizer.authorize(&state.ws_path, presented.as_ref()).await;
	let (true, Some(key)) = (decision.is_allow(), presented) else {
		return empty_response(StatusCode::FORBIDDEN);
	};

	let accept = match HeaderValue::from_str(&derive_accept_key(&ws_key)) {
		Ok(v) => v,
		Err(e) => {
			warn!(error = %e, "invalid websocket accept key");
			return empty_response(StatusCode::BAD_REQUEST);
		}
	};

	let on_upgrade = hyper::upgrade::on(&mut req);
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
				run_socket(ws, key, state).await;
			}
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = empty_response(StatusCode::SWITCHING_PROTOCOLS);
	resp.headers_mut().insert(UPGRADE, HeaderValue::from_static("websocket"));
	resp.headers_mut().insert(CONNECTION, HeaderValue::from_static("Upgrade"));
	resp.headers_mut().insert(SEC_WEBSOCKET_ACCEPT, accept);
	resp
}

/// Drive one accepted socket: register, drain its outbound queue, and
/// deregister when the client goes away.
async fn run_socket<S>(mut ws: WebSocketStream<S>, key: AuthKey, state: AppState)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ActiveGaugeGuard;
	impl Drop for ActiveGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("compcontrol_active_connections").decrement(1.0);
		}
	}

	let conn_id = ConnectionId::new_v4();
	let mut outbound_rx = state.gateway.attach(conn_id.clone()).await;

	let connected = state
		.handler
		.handle(InboundEvent::ClientConnect {
			connection_id: conn_id.clone(),
			presented_token: Some(key),
		})
		.await;
	if !connected.is_success() {
		warn!(conn_id = %conn_id, status = connected.status, "closing socket: connect not recorded");
		state.gateway.detach(&conn_id).await;
		let _ = ws.close(None).await;
		return;
	}

	metrics::gauge!("compcontrol_active_connections").increment(1.0);
	let _gauge = ActiveGaugeGuard;

	let (mut sink, mut stream) = ws.split();
	let writer_conn_id = conn_id.clone();
	let writer = tokio::spawn(async move {
		while let Some(text) = outbound_rx.recv().await {
			if let Err(e) = sink.send(Message::text(text)).await {
				debug!(conn_id = %writer_conn_id, error = %e, "socket write failed");
				break;
			}
		}
		let _ = sink.close().await;
	});

	// Keep reading after a Close frame: the next poll flushes the queued close
	// reply and the stream ends once the handshake completes.
	while let Some(msg) = stream.next().await {
		match msg {
			Ok(Message::Close(frame)) => debug!(conn_id = %conn_id, ?frame, "client sent close"),
			Ok(Message::Ping(_) | Message::Pong(_)) => {}
			Ok(other) => debug!(conn_id = %conn_id, len = other.len(), "ignoring client frame"),
			Err(e) => {
				debug!(conn_id = %conn_id, error = %e, "socket read failed");
				break;
			}
		}
	}

	state.gateway.detach(&conn_id).await;
	writer.abort();

	let resp = state
		.handler
		.handle(InboundEvent::ClientDisconnect {
			connection_id: conn_id.clone(),
		})
		.await;
	let live = state.gateway.live_connections().await;
	debug!(conn_id = %conn_id, status = resp.status, live, "socket closed");
}

fn auth_header(headers: &HeaderMap) -> Option<&str> {
	headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok())
}

fn header_has_token(headers: &HeaderMap, name: &hyper::header::HeaderName, token: &str) -> bool {
	headers
		.get_all(name)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn event_response(resp: EventResponse) -> HttpResponse {
	let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	match resp.body {
		Some(body) => json_response(status, &body),
		None => empty_response(status),
	}
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
	match serde_json::to_vec(body) {
		Ok(bytes) => {
			let mut resp = Response::new(Full::new(Bytes::from(bytes)));
			*resp.status_mut() = status;
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			error!(error = %e, "failed to encode response body");
			empty_response(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}

fn empty_response(status: StatusCode) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}
