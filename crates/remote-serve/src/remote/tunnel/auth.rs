//! Challenge-response handshake that runs on a fresh control link before any
//! framed message.
//!
//! Tokens are base64 text terminated by a single space:
//!
//! 1. client → `"<port>,<key>"`
//! 2. server → `"<key>:<server time>:<32 random chars>"`
//! 3. client → hex HMAC-SHA256 of the challenge, keyed by the shared secret
//! 4. server → the hello token from step 1 as acknowledgment

use std::{collections::HashMap, time::SystemTime};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::remote::tunnel::{
    protocol::{self, Receiver, Sender},
    token,
    transport::BoxedStream,
};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_TERMINATOR: u8 = b' ';
const CHALLENGE_NONCE_LEN: usize = 32;
pub const MAX_TOKEN_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("closed")]
    Closed,
    #[error("token exceeds {MAX_TOKEN_BYTES} bytes")]
    TokenTooLong,
    #[error("malformed token")]
    Malformed,
    #[error("incorrect hello")]
    IncorrectHello,
    #[error("no such key")]
    NoSuchKey(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid secret")]
    InvalidSecret,
    #[error("unexpected acknowledgment")]
    UnexpectedAck,
}

/// Key → shared secret lookup consulted by the server.
#[derive(Debug, Clone, Default)]
pub struct AuthTable {
    secrets: HashMap<String, String>,
}

impl AuthTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, secret: impl Into<String>) {
        self.secrets.insert(key.into(), secret.into());
    }

    pub fn secret(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl<K: Into<String>, S: Into<String>> FromIterator<(K, S)> for AuthTable {
    fn from_iter<I: IntoIterator<Item = (K, S)>>(iter: I) -> Self {
        let mut t = Self::new();
        for (k, s) in iter {
            t.insert(k, s);
        }
        t
    }
}

/// Result of a successful server-side handshake.
pub struct Handshake {
    pub key: String,
    pub port: String,
    pub sender: Sender,
    pub receiver: Receiver,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("key", &self.key)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

async fn write_token<W: AsyncWrite + Unpin>(w: &mut W, msg: &str) -> Result<(), AuthError> {
    let mut out = STANDARD.encode(msg.as_bytes()).into_bytes();
    out.push(TOKEN_TERMINATOR);
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

// Byte at a time: anything past the terminator belongs to the framed stream.
async fn read_token<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, AuthError> {
    let mut raw = Vec::new();
    loop {
        let b = match r.read_u8().await {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(AuthError::Closed);
            }
            Err(err) => return Err(err.into()),
        };
        if b == TOKEN_TERMINATOR {
            break;
        }
        if raw.len() >= MAX_TOKEN_BYTES {
            return Err(AuthError::TokenTooLong);
        }
        raw.push(b);
    }
    let decoded = STANDARD.decode(&raw).map_err(|_| AuthError::Malformed)?;
    String::from_utf8(decoded).map_err(|_| AuthError::Malformed)
}

fn sign_challenge(challenge: &str, secret: &str) -> Result<String, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidSecret)?;
    mac.update(challenge.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_response(challenge: &str, secret: &str, response: &str) -> Result<bool, AuthError> {
    let expected = sign_challenge(challenge, secret)?;
    Ok(expected.as_bytes().ct_eq(response.as_bytes()).into())
}

async fn shutdown_quietly(stream: &mut BoxedStream) {
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), stream.shutdown()).await;
}

/// Server side. Protocol failures and unknown keys close the stream
/// explicitly; every failure drops it, which releases the socket.
pub async fn accept(mut stream: BoxedStream, auths: &AuthTable) -> Result<Handshake, AuthError> {
    let hello = read_token(&mut stream).await?;
    let mut parts = hello.split(',');
    let (Some(port), Some(key), None) = (parts.next(), parts.next(), parts.next()) else {
        shutdown_quietly(&mut stream).await;
        return Err(AuthError::IncorrectHello);
    };
    let (port, key) = (port.to_string(), key.to_string());

    let Some(secret) = auths.secret(&key) else {
        shutdown_quietly(&mut stream).await;
        return Err(AuthError::NoSuchKey(key));
    };

    let challenge = format!(
        "{key}:{}:{}",
        humantime::format_rfc3339_nanos(SystemTime::now()),
        token::chars(CHALLENGE_NONCE_LEN)
    );
    write_token(&mut stream, &challenge).await?;
    let response = read_token(&mut stream).await?;
    if !verify_response(&challenge, secret, &response)? {
        return Err(AuthError::Unauthorized);
    }

    write_token(&mut stream, &hello).await?;
    let (sender, receiver) = protocol::link(stream);
    Ok(Handshake {
        key,
        port,
        sender,
        receiver,
    })
}

/// Client side: asks the server to expose `port` on behalf of `key`.
pub async fn connect(
    mut stream: BoxedStream,
    key: &str,
    secret: &str,
    port: &str,
) -> Result<(Sender, Receiver), AuthError> {
    let hello = format!("{port},{key}");
    write_token(&mut stream, &hello).await?;
    let challenge = read_token(&mut stream).await?;
    write_token(&mut stream, &sign_challenge(&challenge, secret)?).await?;
    let ack = read_token(&mut stream).await?;
    if ack != hello {
        return Err(AuthError::UnexpectedAck);
    }
    Ok(protocol::link(stream))
}
