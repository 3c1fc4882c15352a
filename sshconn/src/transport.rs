//! The boundary between the connection layer and whatever carries its
//! messages.
//!
//! A [`Transport`] delivers whole, already decrypted message payloads
//! in order. Key exchange, encryption and packet padding all live
//! behind this trait; this crate only needs the session identifier
//! (signed during public key authentication) and, on the client, the
//! host key the server proved possession of.
//!
//! [`ClearTransport`] is a minimal implementation over any byte
//! stream: each payload is prefixed with its 32-bit big-endian
//! length, and the server starts by sending a random session
//! identifier and its host public key. It offers no confidentiality
//! and is meant for in-process pipes and tests.

use std::future::Future;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};
use log::{debug, trace};
use rand::RngCore;
use ssh_encoding::{Decode, Encode};
use ssh_key::{PrivateKey, PublicKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::keys;
use crate::Error;

/// Largest payload accepted from the peer.
pub const MAXIMUM_PACKET_LEN: usize = 256 * 1024;

const PACKET_LENGTH_LEN: usize = 4;

/// Ordered, reliable delivery of message payloads.
pub trait Transport: Send + 'static {
    /// Sends one payload. The first byte is the message number.
    fn send(&mut self, payload: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Receives the next payload, or `None` once the peer is gone.
    ///
    /// This future is dropped whenever the connection loop has
    /// something else to do, so it must be cancel safe: no payload may
    /// be lost when it is dropped before completion.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send;

    /// Flushes and shuts the transport down.
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// The exchange hash of the first key exchange.
    fn session_id(&self) -> &[u8];

    /// The server host key, as seen by a client. Servers return `None`.
    fn remote_host_key(&self) -> Option<&PublicKey>;
}

/// Length-prefixed payloads over a byte stream, without encryption.
pub struct ClearTransport<S> {
    stream: S,
    buffer: BytesMut,
    session_id: Vec<u8>,
    host_key: Option<PublicKey>,
}

impl<S> std::fmt::Debug for ClearTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearTransport")
            .field("buffered", &self.buffer.len())
            .field("host_key", &self.host_key)
            .finish()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> ClearTransport<S> {
    /// Server side: pick a session identifier and announce it together
    /// with the public half of `host_key`.
    pub async fn server(stream: S, host_key: &PrivateKey) -> Result<Self, Error> {
        let mut session_id = vec![0; 32];
        rand::thread_rng().fill_bytes(&mut session_id);
        let mut transport = ClearTransport {
            stream,
            buffer: BytesMut::new(),
            session_id,
            host_key: None,
        };
        let mut hello = Vec::new();
        transport.session_id.as_slice().encode(&mut hello)?;
        keys::public_key_blob(host_key.public_key())?
            .as_slice()
            .encode(&mut hello)?;
        transport.send(&hello).await?;
        debug!("clear transport: hello sent");
        Ok(transport)
    }

    /// Client side: wait for the server's hello.
    pub async fn client(stream: S) -> Result<Self, Error> {
        let mut transport = ClearTransport {
            stream,
            buffer: BytesMut::new(),
            session_id: Vec::new(),
            host_key: None,
        };
        let hello = transport.recv().await?.ok_or(Error::HUP)?;
        let mut r = &hello[..];
        transport.session_id = Vec::<u8>::decode(&mut r)?;
        let blob = Vec::<u8>::decode(&mut r)?;
        transport.host_key = Some(keys::parse_public_key(&blob)?);
        debug!("clear transport: hello received");
        Ok(transport)
    }

    /// Returns the next complete payload if one is buffered.
    fn take_packet(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let Some(header) = self.buffer.get(..PACKET_LENGTH_LEN) else {
            return Ok(None);
        };
        let len = BigEndian::read_u32(header) as usize;
        if len > MAXIMUM_PACKET_LEN {
            return Err(Error::PacketSize(len));
        }
        if self.buffer.len() < PACKET_LENGTH_LEN + len {
            return Ok(None);
        }
        self.buffer.advance(PACKET_LENGTH_LEN);
        Ok(Some(self.buffer.split_to(len).to_vec()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for ClearTransport<S> {
    async fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > MAXIMUM_PACKET_LEN {
            return Err(Error::PacketSize(payload.len()));
        }
        let mut header = [0; PACKET_LENGTH_LEN];
        BigEndian::write_u32(&mut header, payload.len() as u32);
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            if let Some(packet) = self.take_packet()? {
                trace!("clear transport: read {} bytes", packet.len());
                return Ok(Some(packet));
            }
            // `read_buf` is cancel safe, partial packets stay in `buffer`.
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if !self.buffer.is_empty() {
                    debug!("clear transport: {} bytes left unread", self.buffer.len());
                }
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    fn remote_host_key(&self) -> Option<&PublicKey> {
        self.host_key.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_key() -> PrivateKey {
        keys::load_secret_key(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/host_ed25519"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn hello_and_payloads() {
        let _ = env_logger::try_init();
        let (a, b) = tokio::io::duplex(16);
        let key = host_key();
        let (server, client) = tokio::join!(ClearTransport::server(b, &key), ClearTransport::client(a));
        let mut server = server.unwrap();
        let mut client = client.unwrap();
        assert_eq!(server.session_id(), client.session_id());
        assert_eq!(server.session_id().len(), 32);
        assert!(server.remote_host_key().is_none());
        assert_eq!(
            client.remote_host_key().unwrap().key_data(),
            key.public_key().key_data()
        );

        let big = vec![7u8; 1000];
        let (sent, received) = tokio::join!(
            async {
                server.send(b"\x5ehello").await?;
                server.send(&big).await?;
                server.close().await
            },
            async {
                let mut packets = Vec::new();
                while let Some(p) = client.recv().await? {
                    packets.push(p);
                }
                Ok::<_, Error>(packets)
            }
        );
        sent.unwrap();
        let received = received.unwrap();
        assert_eq!(received, vec![b"\x5ehello".to_vec(), big]);
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut t = ClearTransport {
            stream: b,
            buffer: BytesMut::new(),
            session_id: Vec::new(),
            host_key: None,
        };
        a.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        assert!(matches!(t.recv().await, Err(Error::PacketSize(_))));
    }
}
