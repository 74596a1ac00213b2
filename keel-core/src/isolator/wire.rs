//! Wire messages exchanged with the build executor.
//!
//! # Wire Format
//!
//! Messages are JSON bodies with a 4-byte big-endian length prefix:
//!
//! ```text
//! ┌─────────────────┬──────────────────────────────┐
//! │ Length (4 bytes)│ JSON body (variable)         │
//! │ big-endian      │                              │
//! └─────────────────┴──────────────────────────────┘
//! ```
//!
//! Exactly one `Completed` terminates each `Execute`, with zero or more
//! ordered `Log` messages in between. Unknown message kinds are a fatal
//! protocol error.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{KeelError, Result};

/// Upper bound on a single message body.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Which output stream a [`Message::Log`] line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Out,
    Err,
}

/// A message on the executor channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Run a command inside the sandbox. Client to executor.
    Execute { command: String },
    /// One line of command output, in emission order. Executor to client.
    Log { stream: LogStream, text: String },
    /// Terminates an `Execute`. Success iff `exit_code == 0` and `error`
    /// is empty. Executor to client.
    Completed { exit_code: i32, error: String },
}

/// Write one length-prefixed message.
pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let body = serde_json::to_vec(msg)
        .map_err(|e| KeelError::Protocol { reason: format!("encoding message: {e}") })?;
    writer
        .write_u32(body.len() as u32)
        .await
        .map_err(|e| KeelError::Protocol { reason: format!("sending message length: {e}") })?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| KeelError::Protocol { reason: format!("sending message: {e}") })?;
    writer
        .flush()
        .await
        .map_err(|e| KeelError::Protocol { reason: format!("flushing message: {e}") })?;
    Ok(())
}

/// Read one length-prefixed message.
pub async fn recv<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let len = reader
        .read_u32()
        .await
        .map_err(|e| KeelError::Protocol { reason: format!("reading message length: {e}") })?;
    if len > MAX_MESSAGE_SIZE {
        return Err(KeelError::Protocol { reason: format!("message of {len} bytes is too large") });
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| KeelError::Protocol { reason: format!("reading message: {e}") })?;
    serde_json::from_slice(&body)
        .map_err(|e| KeelError::Protocol { reason: format!("decoding message: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let messages = vec![
            Message::Execute { command: "echo hi".to_string() },
            Message::Log { stream: LogStream::Out, text: "hi".to_string() },
            Message::Log { stream: LogStream::Err, text: "warning".to_string() },
            Message::Completed { exit_code: 0, error: String::new() },
        ];
        for msg in &messages {
            send(&mut client, msg).await.unwrap();
        }
        for msg in &messages {
            assert_eq!(&recv(&mut server).await.unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_unknown_message_kind_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let body = br#"{"type":"reboot"}"#;
        client.write_u32(body.len() as u32).await.unwrap();
        client.write_all(body).await.unwrap();

        let err = recv(&mut server).await.unwrap_err();
        assert!(matches!(err, KeelError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(MAX_MESSAGE_SIZE + 1).await.unwrap();
        let err = recv(&mut server).await.unwrap_err();
        assert!(matches!(err, KeelError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_truncated_message_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_u32(100).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);
        let err = recv(&mut server).await.unwrap_err();
        assert!(matches!(err, KeelError::Protocol { .. }));
    }
}
