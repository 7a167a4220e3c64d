/// Async Client
///
/// Websocket client speaking the framed encrypted protocol. Requests carry
/// client-assigned ids; a pending-request map routes each reply to its
/// single-shot completion. Unsolicited server pushes arrive on a separate
/// channel. Connection loss completes every pending request with
/// `ConnectionLost`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::notifications::Notification;
use crate::transport::encryption::{ClientHandshake, HandshakeMode, SecureChannel, ServerHello};
use crate::transport::framing::{serialize_message, Reassembler};
use crate::transport::peers::IdentityKey;
use crate::wire::{decode_payload, encode_payload, Payload, Reply, Request, UNSOLICITED_ID};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, TransportError>>>>>;

pub struct RemoteClient {
    out_tx: mpsc::Sender<(u64, Payload)>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl RemoteClient {
    /// Connect, handshake and spawn the io tasks. Returns the client and
    /// the unsolicited-notification stream.
    pub async fn connect(
        url: &str,
        identity: &IdentityKey,
        server_identity: [u8; 32],
        mode: HandshakeMode,
        rekey_threshold: u64,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notification>), TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws.split();

        // Handshake: hello out, hello back, confirm both ways.
        let (hello, state) = ClientHandshake::start(identity, server_identity, mode, rekey_threshold);
        let hello_bytes = bincode::serialize(&hello)
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        ws_sender
            .send(Message::Binary(hello_bytes))
            .await
            .map_err(|_| TransportError::ConnectionLost)?;

        let server_hello_bytes = next_binary(&mut ws_receiver).await?;
        let server_hello: ServerHello = bincode::deserialize(&server_hello_bytes)
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        let mut channel = state.finish(&server_hello)?;

        let server_confirm = next_binary(&mut ws_receiver).await?;
        channel.verify_confirm(&server_confirm)?;
        let confirm = channel.confirm_frame()?;
        ws_sender
            .send(Message::Binary(confirm))
            .await
            .map_err(|_| TransportError::ConnectionLost)?;

        let SecureChannel {
            send: mut send_stream,
            recv: mut recv_stream,
            ..
        } = channel;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (out_tx, mut out_rx) = mpsc::channel::<(u64, Payload)>(64);
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        // Writer task: sole owner of the sending stream. When the client
        // handle goes away the channel drains and the socket closes.
        tokio::spawn(async move {
            while let Some((message_id, payload)) = out_rx.recv().await {
                let bytes = encode_payload(&payload);
                let packets = match serialize_message(message_id, &bytes) {
                    Ok(packets) => packets,
                    Err(error) => {
                        warn!(%error, "outbound message too large");
                        continue;
                    }
                };
                for packet in packets {
                    let frames = match send_stream.seal(&packet) {
                        Ok(frames) => frames,
                        Err(_) => return,
                    };
                    for frame in frames {
                        if ws_sender.send(Message::Binary(frame)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Reader task: decrypt, reassemble, complete pending requests.
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut reassembler = Reassembler::new();
            loop {
                let data = match ws_receiver.next().await {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };
                let packet = match recv_stream.open(&data) {
                    Ok(Some(packet)) => packet,
                    Ok(None) => continue,
                    Err(error) => {
                        debug!(%error, "record layer failure");
                        break;
                    }
                };
                let (message_id, payload_bytes) = match reassembler.feed(&packet) {
                    Ok(Some(complete)) => complete,
                    Ok(None) => continue,
                    Err(error) => {
                        debug!(%error, "framing failure");
                        break;
                    }
                };
                match decode_payload(&payload_bytes) {
                    Ok(Payload::Notification(notification)) if message_id == UNSOLICITED_ID => {
                        let _ = push_tx.send(notification);
                    }
                    Ok(Payload::Reply(reply)) => {
                        let completion = reader_pending.lock().unwrap().remove(&message_id);
                        match completion {
                            Some(tx) => {
                                let _ = tx.send(Ok(reply));
                            }
                            None => debug!(message_id, "reply without a pending request"),
                        }
                    }
                    Ok(_) | Err(_) => {
                        debug!(message_id, "unexpected payload from server");
                        break;
                    }
                }
            }
            // Connection gone: every waiter completes with the loss.
            let mut pending = reader_pending.lock().unwrap();
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(TransportError::ConnectionLost));
            }
        });

        Ok((
            Self {
                out_tx,
                pending,
                next_id: AtomicU64::new(1),
            },
            push_rx,
        ))
    }

    fn allocate_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != UNSOLICITED_ID {
                return id;
            }
        }
    }

    /// Send one request and await its reply.
    pub async fn request(&self, request: Request) -> Result<Reply, TransportError> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        if self
            .out_tx
            .send((id, Payload::Request(request)))
            .await
            .is_err()
        {
            self.pending.lock().unwrap().remove(&id);
            return Err(TransportError::ConnectionLost);
        }

        rx.await.unwrap_or(Err(TransportError::ConnectionLost))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

async fn next_binary<S>(stream: &mut S) -> Result<Vec<u8>, TransportError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionLost),
            Some(Ok(_)) => continue,
            Some(Err(_)) => return Err(TransportError::ConnectionLost),
        }
    }
}
