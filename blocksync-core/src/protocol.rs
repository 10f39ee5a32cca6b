//! Wire protocol: multipart framing, chunking, and the two frame shapes
//! (datablock pushes and control commands).
//!
//! A message is a sequence of length-prefixed parts: `u32` part count,
//! then `u32` length + raw bytes per part. Every connection opens with an
//! identity hello so the server can route replies to the right peer after
//! a reconnect. Datablock payloads larger than [`MAX_CHUNK_SIZE`] are
//! split across multiple parts and reassembled in order on receipt.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::command::Command;
use crate::datablock::Datablock;
use crate::error::{ReplicationError, Result};

/// Upper bound on a single payload chunk (2.5 GB), so arbitrarily large
/// payloads can be streamed without one oversized frame part.
pub const MAX_CHUNK_SIZE: usize = 2_500_000_000;

/// Sanity cap on parts per message.
pub const MAX_FRAME_PARTS: u32 = 4096;

/// Heartbeat channel messages (single-part).
pub const TTL_INIT: &[u8] = b"INIT";
pub const TTL_PING: &[u8] = b"PING";

// ─────────────────────────────────────────────────────
// Multipart framing
// ─────────────────────────────────────────────────────

/// Write one multipart message.
pub async fn write_parts<W: AsyncWrite + Unpin>(writer: &mut W, parts: &[Bytes]) -> Result<()> {
    if parts.is_empty() || parts.len() > MAX_FRAME_PARTS as usize {
        return Err(ReplicationError::NetworkFrame(format!(
            "refusing to send a {}-part message",
            parts.len()
        )));
    }
    writer.write_u32_le(parts.len() as u32).await?;
    for part in parts {
        writer.write_u32_le(part.len() as u32).await?;
        writer.write_all(part).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one complete multipart message.
pub async fn read_parts<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<Bytes>> {
    let count = reader.read_u32_le().await?;
    if count == 0 || count > MAX_FRAME_PARTS {
        return Err(ReplicationError::NetworkFrame(format!(
            "message part count {count} out of range"
        )));
    }
    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32_le().await? as usize;
        if len > MAX_CHUNK_SIZE {
            return Err(ReplicationError::NetworkFrame(format!(
                "frame part of {len} bytes exceeds the chunk bound"
            )));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        parts.push(Bytes::from(buf));
    }
    Ok(parts)
}

/// Send the identity hello that opens every connection.
pub async fn write_identity<W: AsyncWrite + Unpin>(writer: &mut W, identity: Uuid) -> Result<()> {
    write_parts(writer, &[Bytes::copy_from_slice(identity.as_bytes())]).await
}

/// Read the identity hello from a freshly accepted connection.
pub async fn read_identity<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Uuid> {
    let parts = read_parts(reader).await?;
    let [part] = parts.as_slice() else {
        return Err(ReplicationError::NetworkFrame(format!(
            "identity hello must be a single part, got {}",
            parts.len()
        )));
    };
    Uuid::from_slice(part)
        .map_err(|_| ReplicationError::NetworkFrame("identity part is not a uuid".to_string()))
}

// ─────────────────────────────────────────────────────
// Chunking
// ─────────────────────────────────────────────────────

/// Number of chunks a payload of `len` bytes splits into.
pub fn chunk_count(len: usize, max_chunk: usize) -> usize {
    len.div_ceil(max_chunk)
}

/// Split a payload into chunks of at most `max_chunk` bytes. Zero-copy:
/// each chunk is a slice of the source buffer.
pub fn chunk_payload(payload: &Bytes, max_chunk: usize) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(chunk_count(payload.len(), max_chunk));
    let mut offset = 0;
    while offset < payload.len() {
        let end = usize::min(offset + max_chunk, payload.len());
        chunks.push(payload.slice(offset..end));
        offset = end;
    }
    chunks
}

/// Concatenate received chunks back into the original payload.
pub fn reassemble_chunks(chunks: &[Bytes]) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let total = many.iter().map(Bytes::len).sum();
            let mut buf = Vec::with_capacity(total);
            for chunk in many {
                buf.extend_from_slice(chunk);
            }
            Bytes::from(buf)
        }
    }
}

// ─────────────────────────────────────────────────────
// Datablock frames
// ─────────────────────────────────────────────────────

/// A datablock push as it travels on the wire:
/// `[sender?, uuid, owner, type_name, chunk_count, dependencies]` followed
/// by exactly `chunk_count` payload chunks. Client-to-server frames carry
/// the sender identity part; server fan-out omits it.
#[derive(Debug, Clone)]
pub struct DatablockFrame {
    pub sender: Option<Uuid>,
    pub uuid: String,
    pub owner: String,
    pub type_name: String,
    pub dependencies: Vec<String>,
    pub payload: Bytes,
}

impl DatablockFrame {
    /// Build a frame from a committed node. Pushing from any state other
    /// than `Committed`/`Up` is a caller error.
    pub fn from_node(node: &Datablock, sender: Option<Uuid>) -> Result<Self> {
        if !node.state.can_push() {
            return Err(ReplicationError::State(format!(
                "cannot push node {} from state {:?}",
                node.uuid, node.state
            )));
        }
        let payload = node.buffer.clone().ok_or_else(|| {
            ReplicationError::State(format!("node {} has no committed payload", node.uuid))
        })?;
        Ok(Self {
            sender,
            uuid: node.uuid.clone(),
            owner: node.owner.clone(),
            type_name: node.type_name.clone(),
            dependencies: node.dependencies.clone(),
            payload,
        })
    }

    /// Encode into wire parts, validating before transmission: an empty
    /// payload or any empty required field is rejected as malformed.
    pub fn encode(&self, with_sender: bool) -> Result<Vec<Bytes>> {
        self.encode_chunked(with_sender, MAX_CHUNK_SIZE)
    }

    fn encode_chunked(&self, with_sender: bool, max_chunk: usize) -> Result<Vec<Bytes>> {
        if self.uuid.is_empty() || self.owner.is_empty() || self.type_name.is_empty() {
            return Err(ReplicationError::NetworkFrame(format!(
                "datablock {} has an empty required field",
                self.uuid
            )));
        }
        if self.payload.is_empty() {
            return Err(ReplicationError::NetworkFrame(format!(
                "refusing to push zero-size payload for node {}",
                self.uuid
            )));
        }
        let deps_blob = bincode::serialize(&self.dependencies).map_err(|e| {
            ReplicationError::Data(format!("failed to serialize dependencies: {e}"))
        })?;
        let chunks = chunk_payload(&self.payload, max_chunk);

        let mut parts = Vec::with_capacity(6 + chunks.len());
        if with_sender {
            let sender = self.sender.ok_or_else(|| {
                ReplicationError::NetworkFrame("client-bound frame is missing its sender".to_string())
            })?;
            parts.push(Bytes::copy_from_slice(sender.as_bytes()));
        }
        parts.push(Bytes::copy_from_slice(self.uuid.as_bytes()));
        parts.push(Bytes::copy_from_slice(self.owner.as_bytes()));
        parts.push(Bytes::copy_from_slice(self.type_name.as_bytes()));
        parts.push(Bytes::copy_from_slice(&(chunks.len() as u64).to_le_bytes()));
        parts.push(Bytes::from(deps_blob));
        parts.extend(chunks);
        Ok(parts)
    }

    /// Decode wire parts. The part count must match the expected shape
    /// for the direction exactly; anything else is a frame error the
    /// session logs and skips.
    pub fn decode(parts: &[Bytes], with_sender: bool) -> Result<Self> {
        let header_len = if with_sender { 6 } else { 5 };
        if parts.len() < header_len {
            return Err(ReplicationError::NetworkFrame(format!(
                "datablock frame has {} parts, expected at least {header_len}",
                parts.len()
            )));
        }
        let mut idx = 0;
        let sender = if with_sender {
            let sender = Uuid::from_slice(&parts[idx]).map_err(|_| {
                ReplicationError::NetworkFrame("sender part is not a uuid".to_string())
            })?;
            idx += 1;
            Some(sender)
        } else {
            None
        };
        let uuid = part_as_string(&parts[idx], "uuid")?;
        let owner = part_as_string(&parts[idx + 1], "owner")?;
        let type_name = part_as_string(&parts[idx + 2], "type_name")?;

        let count_bytes: [u8; 8] = parts[idx + 3].as_ref().try_into().map_err(|_| {
            ReplicationError::NetworkFrame("chunk count part is not a u64".to_string())
        })?;
        let chunks = u64::from_le_bytes(count_bytes) as usize;
        if chunks == 0 {
            return Err(ReplicationError::NetworkFrame(format!(
                "datablock {uuid} announces zero chunks"
            )));
        }
        if parts.len() != header_len + chunks {
            return Err(ReplicationError::NetworkFrame(format!(
                "datablock {uuid} announces {chunks} chunks but carries {}",
                parts.len() - header_len
            )));
        }

        let deps_part = &parts[idx + 4];
        if deps_part.is_empty() {
            return Err(ReplicationError::NetworkFrame(format!(
                "datablock {uuid} has an empty dependencies blob"
            )));
        }
        let dependencies: Vec<String> = bincode::deserialize(deps_part).map_err(|e| {
            ReplicationError::Data(format!("failed to deserialize dependencies: {e}"))
        })?;

        let payload = reassemble_chunks(&parts[header_len..]);
        if payload.is_empty() {
            return Err(ReplicationError::NetworkFrame(format!(
                "datablock {uuid} carries a zero-size payload"
            )));
        }

        Ok(Self {
            sender,
            uuid,
            owner,
            type_name,
            dependencies,
            payload,
        })
    }
}

// ─────────────────────────────────────────────────────
// Command frames
// ─────────────────────────────────────────────────────

/// A control command on the wire: `[owner, tag, payload]`, with a leading
/// sender identity part on client-to-server frames.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    pub sender: Option<Uuid>,
    pub owner: String,
    pub command: Command,
}

impl CommandFrame {
    pub fn new(owner: impl Into<String>, command: Command) -> Self {
        Self {
            sender: None,
            owner: owner.into(),
            command,
        }
    }

    pub fn with_sender(sender: Uuid, owner: impl Into<String>, command: Command) -> Self {
        Self {
            sender: Some(sender),
            owner: owner.into(),
            command,
        }
    }

    pub fn encode(&self, with_sender: bool) -> Result<Vec<Bytes>> {
        if self.owner.is_empty() {
            return Err(ReplicationError::NetworkFrame(
                "command frame has an empty owner".to_string(),
            ));
        }
        let payload = bincode::serialize(&self.command)
            .map_err(|e| ReplicationError::Data(format!("failed to serialize command: {e}")))?;

        let mut parts = Vec::with_capacity(4);
        if with_sender {
            let sender = self.sender.ok_or_else(|| {
                ReplicationError::NetworkFrame("client-bound command is missing its sender".to_string())
            })?;
            parts.push(Bytes::copy_from_slice(sender.as_bytes()));
        }
        parts.push(Bytes::copy_from_slice(self.owner.as_bytes()));
        parts.push(Bytes::copy_from_slice(self.command.tag().as_bytes()));
        parts.push(Bytes::from(payload));
        Ok(parts)
    }

    pub fn decode(parts: &[Bytes], with_sender: bool) -> Result<Self> {
        let expected = if with_sender { 4 } else { 3 };
        if parts.len() != expected {
            return Err(ReplicationError::NetworkFrame(format!(
                "command frame has {} parts, expected {expected}",
                parts.len()
            )));
        }
        let mut idx = 0;
        let sender = if with_sender {
            let sender = Uuid::from_slice(&parts[idx]).map_err(|_| {
                ReplicationError::NetworkFrame("sender part is not a uuid".to_string())
            })?;
            idx += 1;
            Some(sender)
        } else {
            None
        };
        let owner = part_as_string(&parts[idx], "owner")?;
        let tag = part_as_string(&parts[idx + 1], "tag")?;
        let command: Command = bincode::deserialize(&parts[idx + 2])
            .map_err(|e| ReplicationError::Data(format!("failed to deserialize command: {e}")))?;
        if command.tag() != tag {
            return Err(ReplicationError::NetworkFrame(format!(
                "command tag {tag:?} does not match payload {:?}",
                command.tag()
            )));
        }
        Ok(Self {
            sender,
            owner,
            command,
        })
    }
}

/// Encode and send a datablock frame in one step.
pub async fn send_datablock<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &DatablockFrame,
    with_sender: bool,
) -> Result<()> {
    let parts = frame.encode(with_sender)?;
    write_parts(writer, &parts).await
}

/// Encode and send a command frame in one step.
pub async fn send_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &CommandFrame,
    with_sender: bool,
) -> Result<()> {
    let parts = frame.encode(with_sender)?;
    write_parts(writer, &parts).await
}

fn part_as_string(part: &Bytes, field: &str) -> Result<String> {
    if part.is_empty() {
        return Err(ReplicationError::NetworkFrame(format!(
            "frame has an empty {field} part"
        )));
    }
    std::str::from_utf8(part)
        .map(str::to_string)
        .map_err(|_| ReplicationError::NetworkFrame(format!("{field} part is not utf-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AuthRequest, AuthRole, SnapshotMsg};
    use proptest::prelude::*;

    fn sample_frame(payload: &'static [u8]) -> DatablockFrame {
        DatablockFrame {
            sender: Some(Uuid::new_v4()),
            uuid: "node-1".to_string(),
            owner: "alice".to_string(),
            type_name: "bytes".to_string(),
            dependencies: vec!["node-0".to_string()],
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_multipart_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let parts = vec![Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")];
        write_parts(&mut client, &parts).await.unwrap();
        let received = read_parts(&mut server).await.unwrap();
        assert_eq!(received, parts);
    }

    #[tokio::test]
    async fn test_identity_hello_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let identity = Uuid::new_v4();
        write_identity(&mut client, identity).await.unwrap();
        assert_eq!(read_identity(&mut server).await.unwrap(), identity);
    }

    #[test]
    fn test_chunk_boundaries() {
        // N in {0, 1, MAX-1, MAX, MAX+1, 5*MAX} against a small bound.
        let max = 8;
        for (len, expected) in [(0, 0), (1, 1), (7, 1), (8, 1), (9, 2), (40, 5)] {
            let payload = Bytes::from(vec![0xAB; len]);
            let chunks = chunk_payload(&payload, max);
            assert_eq!(chunks.len(), expected, "len {len}");
            assert_eq!(chunk_count(len, max), expected, "len {len}");
            assert_eq!(reassemble_chunks(&chunks), payload, "len {len}");
        }
    }

    proptest! {
        #[test]
        fn test_chunking_is_idempotent(payload in proptest::collection::vec(any::<u8>(), 0..256), max in 1usize..32) {
            let payload = Bytes::from(payload);
            let chunks = chunk_payload(&payload, max);
            prop_assert_eq!(chunks.len(), chunk_count(payload.len(), max));
            prop_assert!(chunks.iter().all(|c| c.len() <= max && !c.is_empty()));
            prop_assert_eq!(reassemble_chunks(&chunks), payload);
        }
    }

    #[test]
    fn test_datablock_frame_roundtrip_with_sender() {
        let frame = sample_frame(b"mesh payload");
        let parts = frame.encode(true).unwrap();
        assert_eq!(parts.len(), 7); // 6 header parts + 1 chunk

        let decoded = DatablockFrame::decode(&parts, true).unwrap();
        assert_eq!(decoded.sender, frame.sender);
        assert_eq!(decoded.uuid, frame.uuid);
        assert_eq!(decoded.owner, frame.owner);
        assert_eq!(decoded.dependencies, frame.dependencies);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_datablock_frame_multi_chunk_roundtrip() {
        let frame = sample_frame(b"0123456789abcdef0123");
        let parts = frame.encode_chunked(false, 8).unwrap();
        assert_eq!(parts.len(), 5 + 3);

        let decoded = DatablockFrame::decode(&parts, false).unwrap();
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_empty_payload_rejected_before_transmission() {
        let mut frame = sample_frame(b"data");
        frame.payload = Bytes::new();
        match frame.encode(true) {
            Err(ReplicationError::NetworkFrame(_)) => {}
            other => panic!("expected NetworkFrame error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_required_field_rejected() {
        let mut frame = sample_frame(b"data");
        frame.owner = String::new();
        assert!(frame.encode(true).is_err());
    }

    #[test]
    fn test_chunk_count_mismatch_rejected() {
        let frame = sample_frame(b"data");
        let mut parts = frame.encode(true).unwrap();
        // Claim two chunks while carrying one.
        parts[4] = Bytes::copy_from_slice(&2u64.to_le_bytes());
        match DatablockFrame::decode(&parts, true) {
            Err(ReplicationError::NetworkFrame(_)) => {}
            other => panic!("expected NetworkFrame error, got {other:?}"),
        }
    }

    #[test]
    fn test_command_frame_part_count_enforced() {
        let frame = CommandFrame::new("alice", Command::Snapshot(SnapshotMsg::RequestInit));
        let parts = frame.encode(false).unwrap();
        assert_eq!(parts.len(), 3);

        // A server-received frame must be 4 parts; the 3-part shape is
        // rejected rather than crashing the session.
        match CommandFrame::decode(&parts, true) {
            Err(ReplicationError::NetworkFrame(_)) => {}
            other => panic!("expected NetworkFrame error, got {other:?}"),
        }
    }

    #[test]
    fn test_command_frame_roundtrip() {
        let identity = Uuid::new_v4();
        let frame = CommandFrame::with_sender(
            identity,
            "alice",
            Command::Auth(AuthRequest {
                auth_type: AuthRole::Client,
                auth_id: "alice".to_string(),
                password: None,
                version: "0.1.0".to_string(),
            }),
        );
        let parts = frame.encode(true).unwrap();
        let decoded = CommandFrame::decode(&parts, true).unwrap();
        assert_eq!(decoded.sender, Some(identity));
        assert_eq!(decoded.owner, "alice");
        match decoded.command {
            Command::Auth(req) => assert_eq!(req.auth_id, "alice"),
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_tag_rejected() {
        let frame = CommandFrame::new("alice", Command::Snapshot(SnapshotMsg::Done));
        let mut parts = frame.encode(false).unwrap();
        parts[1] = Bytes::from_static(b"Delete");
        match CommandFrame::decode(&parts, false) {
            Err(ReplicationError::NetworkFrame(_)) => {}
            other => panic!("expected NetworkFrame error, got {other:?}"),
        }
    }
}
