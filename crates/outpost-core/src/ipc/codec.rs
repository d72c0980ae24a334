//! Length-prefixed, HMAC-signed envelope framing.
//!
//! Wire format: `[u32 big-endian length][JSON envelope]`. Every envelope carries
//! `HMAC-SHA256(key, id || seq || type || payload)`; the key is all zeroes until the
//! handshake installs a session key. Receivers reject non-increasing sequence numbers.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::{Envelope, MAX_MESSAGE_SIZE};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("ipc: connection closed")]
    Closed,

    #[error("ipc: {0}")]
    Io(#[from] std::io::Error),

    #[error("ipc: message too large: {0} > {MAX_MESSAGE_SIZE}")]
    TooLarge(usize),

    #[error("ipc: zero-length message")]
    Empty,

    #[error("ipc: malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("ipc: HMAC mismatch")]
    HmacMismatch,

    #[error("ipc: sequence number {got} <= last {last} (replay/duplicate)")]
    Replay { got: u64, last: u64 },

    #[error("ipc: invalid session key")]
    InvalidKey,
}

/// Session key shared by both halves of one connection.
#[derive(Debug, Clone, Default)]
pub struct SessionKey {
    inner: Arc<RwLock<[u8; SESSION_KEY_LEN]>>,
}

impl SessionKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate() -> [u8; SESSION_KEY_LEN] {
        rand::random()
    }

    pub fn set(&self, key: [u8; SESSION_KEY_LEN]) {
        *self.inner.write() = key;
    }

    /// Install a hex-encoded key received in an auth response.
    pub fn set_hex(&self, encoded: &str) -> Result<(), CodecError> {
        let bytes = hex::decode(encoded).map_err(|_| CodecError::InvalidKey)?;
        let key: [u8; SESSION_KEY_LEN] = bytes.try_into().map_err(|_| CodecError::InvalidKey)?;
        self.set(key);
        Ok(())
    }

    fn mac(&self, env: &Envelope) -> Result<HmacSha256, CodecError> {
        let key = *self.inner.read();
        let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| CodecError::InvalidKey)?;
        mac.update(env.id.as_bytes());
        mac.update(env.seq.to_string().as_bytes());
        mac.update(env.kind.as_str().as_bytes());
        if !env.payload.is_null() {
            mac.update(&serde_json::to_vec(&env.payload)?);
        }
        Ok(mac)
    }

    pub fn sign(&self, env: &Envelope) -> Result<String, CodecError> {
        Ok(hex::encode(self.mac(env)?.finalize().into_bytes()))
    }

    pub fn verify(&self, env: &Envelope) -> Result<(), CodecError> {
        let tag = hex::decode(&env.hmac).map_err(|_| CodecError::HmacMismatch)?;
        self.mac(env)?
            .verify_slice(&tag)
            .map_err(|_| CodecError::HmacMismatch)
    }
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct EnvelopeWriter<W> {
    inner: W,
    key: SessionKey,
    seq: u64,
}

impl<W: AsyncWrite + Send + Unpin + 'static> EnvelopeWriter<W> {
    pub fn boxed(self) -> EnvelopeWriter<BoxedWriter> {
        EnvelopeWriter {
            inner: Box::new(self.inner),
            key: self.key,
            seq: self.seq,
        }
    }
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    pub fn new(inner: W, key: SessionKey) -> Self {
        Self { inner, key, seq: 0 }
    }

    /// Assign the next sequence number, sign, and write one frame.
    pub async fn send(&mut self, mut env: Envelope) -> Result<(), CodecError> {
        self.seq += 1;
        env.seq = self.seq;
        env.hmac = self.key.sign(&env)?;

        let data = serde_json::to_vec(&env)?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge(data.len()));
        }

        self.inner.write_all(&(data.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

pub struct EnvelopeReader<R> {
    inner: R,
    key: SessionKey,
    last_seq: u64,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(inner: R, key: SessionKey) -> Self {
        Self {
            inner,
            key,
            last_seq: 0,
        }
    }

    /// Read one frame and validate its HMAC and sequence number.
    pub async fn recv(&mut self) -> Result<Envelope, CodecError> {
        let mut header = [0u8; 4];
        if let Err(err) = self.inner.read_exact(&mut header).await {
            return Err(match err.kind() {
                std::io::ErrorKind::UnexpectedEof => CodecError::Closed,
                _ => CodecError::Io(err),
            });
        }

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Err(CodecError::Empty);
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge(len));
        }

        let mut data = vec![0u8; len];
        self.inner.read_exact(&mut data).await?;
        let env: Envelope = serde_json::from_slice(&data)?;

        self.key.verify(&env)?;
        if self.last_seq > 0 && env.seq <= self.last_seq {
            return Err(CodecError::Replay {
                got: env.seq,
                last: self.last_seq,
            });
        }
        self.last_seq = env.seq;

        Ok(env)
    }
}

/// Wrap the two halves of a stream with a shared key.
pub fn framed<R, W>(reader: R, writer: W) -> (EnvelopeReader<R>, EnvelopeWriter<W>, SessionKey)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let key = SessionKey::new();
    (
        EnvelopeReader::new(reader, key.clone()),
        EnvelopeWriter::new(writer, key.clone()),
        key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::MessageType;
    use serde_json::json;
    use tokio::io::{duplex, split};

    #[tokio::test]
    async fn test_signed_frame_is_accepted() {
        let (a, b) = duplex(4096);
        let (_, a_write) = split(a);
        let (b_read, _) = split(b);
        let mut writer = EnvelopeWriter::new(a_write, SessionKey::new());
        let mut reader = EnvelopeReader::new(b_read, SessionKey::new());

        let env = Envelope::new("1", MessageType::Ping, &json!({"n": 1})).unwrap();
        writer.send(env).await.unwrap();

        let received = reader.recv().await.unwrap();
        assert_eq!(received.id, "1");
        assert_eq!(received.seq, 1);
        assert_eq!(received.payload["n"], 1);
    }

    #[tokio::test]
    async fn test_key_mismatch_rejected() {
        let (a, b) = duplex(4096);
        let (_, a_write) = split(a);
        let (b_read, _) = split(b);
        let sender_key = SessionKey::new();
        sender_key.set(SessionKey::generate());
        let mut writer = EnvelopeWriter::new(a_write, sender_key);
        let mut reader = EnvelopeReader::new(b_read, SessionKey::new());

        writer.send(Envelope::empty("1", MessageType::Ping)).await.unwrap();
        assert!(matches!(reader.recv().await, Err(CodecError::HmacMismatch)));
    }

    #[tokio::test]
    async fn test_replayed_sequence_rejected() {
        let (mut raw, b) = duplex(8192);
        let (b_read, _) = split(b);
        let key = SessionKey::new();
        let mut reader = EnvelopeReader::new(b_read, key.clone());

        let mut env = Envelope::empty("1", MessageType::Ping);
        env.seq = 4;
        env.hmac = key.sign(&env).unwrap();
        let data = serde_json::to_vec(&env).unwrap();
        for _ in 0..2 {
            raw.write_all(&(data.len() as u32).to_be_bytes()).await.unwrap();
            raw.write_all(&data).await.unwrap();
        }

        assert_eq!(reader.recv().await.unwrap().seq, 4);
        assert!(matches!(
            reader.recv().await,
            Err(CodecError::Replay { got: 4, last: 4 })
        ));
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let (mut raw, b) = duplex(64);
        let (b_read, _) = split(b);
        let mut reader = EnvelopeReader::new(b_read, SessionKey::new());
        raw.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(matches!(reader.recv().await, Err(CodecError::Empty)));
    }

    #[tokio::test]
    async fn test_eof_reports_closed() {
        let (raw, b) = duplex(64);
        let (b_read, _) = split(b);
        let mut reader = EnvelopeReader::new(b_read, SessionKey::new());
        drop(raw);
        assert!(matches!(reader.recv().await, Err(CodecError::Closed)));
    }

    #[test]
    fn test_set_hex_rejects_short_key() {
        let key = SessionKey::new();
        assert!(key.set_hex("abcd").is_err());
        assert!(key.set_hex(&hex::encode([7u8; SESSION_KEY_LEN])).is_ok());
    }
}
