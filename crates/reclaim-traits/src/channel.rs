//! Duplex channel abstraction.
//!
//! A session may hold a reference to the client connection it serves, but the
//! connection is owned by the transport layer. The core only ever closes it
//! from a session resource teardown.

use anyhow::Result;
use async_trait::async_trait;

/// Already-connected, bidirectional client channel.
///
/// # Example
///
/// ```ignore
/// struct WsChannel { id: String, sink: Sender<Message> }
///
/// #[async_trait]
/// impl DuplexChannel for WsChannel {
///     fn channel_id(&self) -> &str {
///         &self.id
///     }
///
///     async fn send(&self, payload: String) -> Result<()> {
///         self.sink.send(Message::Text(payload)).await?;
///         Ok(())
///     }
///
///     async fn close(&self, code: u16, reason: &str) -> Result<()> {
///         self.sink.send(Message::Close(code, reason.to_string())).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Stable identifier of the connection.
    fn channel_id(&self) -> &str;

    /// Send a text payload to the peer.
    async fn send(&self, payload: String) -> Result<()>;

    /// Close the channel with a status code and human readable reason.
    async fn close(&self, code: u16, reason: &str) -> Result<()>;
}
