//! Control wire framing: 4-byte big-endian length prefix + UTF-8 JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are a protocol violation, not an allocation hint.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// One control-plane message. `data` carries type-specific fields (e.g. the
/// embedded `service` object for `register_service`, or `success`/`serviceId`
/// for a response) as a free-form JSON object, mirroring the wire's loosely
/// typed `data` map rather than a closed Rust enum per message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: String,
}

impl ControlMessage {
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            session_id: None,
            data,
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(std::time::SystemTime::now()).to_string()
}

/// First frame on a data connection socket: `{"type":"data_connection","connectionId":"<id>"}`.
pub fn is_data_connection_frame(msg: &ControlMessage) -> Option<String> {
    if msg.msg_type != "data_connection" {
        return None;
    }
    msg.data
        .get("connectionId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Read one length-prefixed frame, enforcing `0 < length <= MAX_FRAME_LEN`.
/// A zero or oversize length is a protocol violation and closes the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<ControlMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len == 0 || len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {} out of bounds", len),
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Encode and write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &ControlMessage,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "encoded frame exceeds max frame length",
        ));
    }
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        for msg_type in ["auth", "heartbeat", "register_service", "unregister_service", "response"] {
            let msg = ControlMessage::new(msg_type, serde_json::json!({"k": "v"}))
                .with_session("sess-1");
            let mut buf = Vec::new();
            write_frame(&mut buf, &msg).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let decoded = read_frame(&mut cursor).await.unwrap();
            assert_eq!(decoded.msg_type, msg.msg_type);
            assert_eq!(decoded.session_id, msg.session_id);
        }
    }

    #[tokio::test]
    async fn rejects_zero_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn rejects_oversize_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn detects_data_connection_discriminator() {
        let msg = ControlMessage::new(
            "data_connection",
            serde_json::json!({"connectionId": "abc123"}),
        );
        assert_eq!(is_data_connection_frame(&msg), Some("abc123".to_string()));
    }
}
