/// Session Transport
///
/// Authenticated, framed, length-bounded message carrier between the
/// engine and its wallet clients: packet framing, the AEAD record layer
/// with its handshake, peer identity material, and the websocket server
/// and client endpoints.

pub mod client;
pub mod encryption;
pub mod framing;
pub mod peers;
pub mod server;
