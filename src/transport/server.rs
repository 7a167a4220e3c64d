/// Listen Server
///
/// Websocket carrier for the framed, encrypted client protocol. Each
/// connection runs its own handshake, then three loops: a reader that
/// decrypts and reassembles in arrival order, pooled handler tasks for the
/// requests, and one writer that owns the sending AEAD stream so outbound
/// encryption stays strictly in order.
///
/// Any transport failure terminates the connection; the session is evicted
/// after a short grace period during which late replies are discarded.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::TransportError;
use crate::transport::encryption::{server_handshake, ClientHello, SecureChannel};
use crate::transport::framing::{serialize_message, Reassembler};
use crate::transport::peers::{AuthorizedPeers, IdentityKey};
use crate::wire::{decode_payload, encode_payload, Payload, UNSOLICITED_ID};

/// Replies still in flight when a connection dies get this long to finish
/// before the session is evicted.
const TEARDOWN_GRACE: Duration = Duration::from_millis(500);

pub struct ServerContext {
    pub dispatcher: Arc<Dispatcher>,
    pub identity: IdentityKey,
    pub authorized: AuthorizedPeers,
    pub rekey_threshold: u64,
}

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .layer(Extension(ctx))
}

/// Serve the wallet protocol on an already-bound listener.
pub async fn run_listen_server(
    ctx: Arc<ServerContext>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "wallet listen server running");
    axum::serve(listener, router(ctx)).await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(ctx): Extension<Arc<ServerContext>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
}

async fn next_binary(socket: &mut WebSocket) -> Result<Vec<u8>, TransportError> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionLost),
            Some(Ok(_)) => continue, // ping/pong noise
            Some(Err(_)) => return Err(TransportError::ConnectionLost),
        }
    }
}

async fn perform_handshake(
    socket: &mut WebSocket,
    ctx: &ServerContext,
) -> Result<SecureChannel, TransportError> {
    let hello_bytes = next_binary(socket).await?;
    let hello: ClientHello = bincode::deserialize(&hello_bytes)
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

    let (server_hello, mut channel) =
        server_handshake(&ctx.identity, &hello, &ctx.authorized, ctx.rekey_threshold)?;
    let reply = bincode::serialize(&server_hello)
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
    socket
        .send(Message::Binary(reply.into()))
        .await
        .map_err(|_| TransportError::ConnectionLost)?;

    // Encrypted confirm exchange: wrong keys fail as AuthRejected.
    let confirm = channel.confirm_frame()?;
    socket
        .send(Message::Binary(confirm.into()))
        .await
        .map_err(|_| TransportError::ConnectionLost)?;
    let client_confirm = next_binary(socket).await?;
    channel.verify_confirm(&client_confirm)?;
    Ok(channel)
}

async fn handle_connection(mut socket: WebSocket, ctx: Arc<ServerContext>) {
    let channel = match perform_handshake(&mut socket, &ctx).await {
        Ok(channel) => channel,
        Err(error) => {
            warn!(%error, "handshake failed");
            return;
        }
    };
    let SecureChannel {
        send: mut send_stream,
        recv: mut recv_stream,
        ..
    } = channel;

    let sessions = ctx.dispatcher.handles.sessions.clone();
    let session = sessions.create_session();
    debug!(session = session.id, "client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<(u64, Payload)>(256);

    // Writer: the single owner of the sending stream.
    let writer = tokio::spawn(async move {
        while let Some((message_id, payload)) = out_rx.recv().await {
            let bytes = encode_payload(&payload);
            let packets = match serialize_message(message_id, &bytes) {
                Ok(packets) => packets,
                Err(error) => {
                    warn!(%error, "unserializable outbound message");
                    break;
                }
            };
            for packet in packets {
                let frames = match send_stream.seal(&packet) {
                    Ok(frames) => frames,
                    Err(_) => return,
                };
                for frame in frames {
                    crate::metrics::TRANSPORT_BYTES_OUT.inc_by(frame.len() as u64);
                    if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    // Notification pump: session queue -> unsolicited pushes.
    let pump_session = session.clone();
    let pump_tx = out_tx.clone();
    let pump = tokio::spawn(async move {
        loop {
            let notification = pump_session.next_notification().await;
            if pump_tx
                .send((UNSOLICITED_ID, Payload::Notification(notification)))
                .await
                .is_err()
            {
                return;
            }
        }
    });

    // Reader: decrypt in order, reassemble, hand requests to the pool.
    let mut reassembler = Reassembler::new();
    let disconnect_reason: TransportError = loop {
        let data = match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break TransportError::ConnectionLost,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break TransportError::ConnectionLost,
        };
        crate::metrics::TRANSPORT_BYTES_IN.inc_by(data.len() as u64);

        let packet = match recv_stream.open(&data) {
            Ok(Some(packet)) => packet,
            Ok(None) => continue, // absorbed rekey
            Err(error) => break error,
        };
        let complete = match reassembler.feed(&packet) {
            Ok(Some(complete)) => complete,
            Ok(None) => continue,
            Err(error) => break error,
        };
        let (message_id, payload_bytes) = complete;

        let request = match decode_payload(&payload_bytes) {
            Ok(Payload::Request(request)) => request,
            Ok(_) => {
                break TransportError::FrameViolation("client sent a non-request payload".into())
            }
            Err(input_error) => {
                // Version and shape errors answer on the request id.
                let reply = crate::wire::error_reply(&input_error.into());
                if out_tx.send((message_id, Payload::Reply(reply))).await.is_err() {
                    break TransportError::ConnectionLost;
                }
                continue;
            }
        };

        let dispatcher = ctx.dispatcher.handles.clone();
        let handler_session = session.clone();
        let handler_tx = out_tx.clone();
        tokio::spawn(async move {
            let dispatcher = Dispatcher::new(dispatcher);
            let reply = dispatcher.handle(&handler_session, request).await;
            // A closed connection surfaces here; the work is discarded.
            let _ = handler_tx.send((message_id, Payload::Reply(reply))).await;
        });
    };

    debug!(session = session.id, reason = %disconnect_reason, "connection closed");
    drop(out_tx);
    tokio::time::sleep(TEARDOWN_GRACE).await;
    pump.abort();
    writer.abort();
    sessions.drop_session(session.id);
}
