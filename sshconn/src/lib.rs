#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The connection layer of SSH2: user authentication, channel
//! multiplexing and session requests, driven over any [`Transport`]
//! that already takes care of key exchange and encryption.
//!
//! Both clients and servers are written by implementing *handlers*,
//! i.e. types that implement `client::Handler` for clients and
//! `server::Handler` for servers.
//!
//! * [Writing clients - the `sshconn::client` module](client)
//! * [Writing servers - the `sshconn::server` module](server)
//!
//! # The connection protocol
//!
//! Once authenticated, clients and servers open *channels*, which
//! are just integers used to handle multiple requests in parallel in
//! a single connection. A client that wants to run one command
//! usually calls `client::Handle::exec`, which opens a `session`
//! channel, sends the environment, pty and forwarding requests it
//! was configured with, and finally the `exec` request. The returned
//! [`Channel`] then yields the command's output and its exit status.
//!
//! Every channel has a window in each direction. Data beyond the
//! window advertised by the peer is never sent: writers suspend until
//! the peer grants more room with a window adjustment.
//!
//! # Internal details of the event loop
//!
//! Each connection is driven by a single task. The loop waits for
//! either an incoming message from the transport or a message from a
//! `Handle`/[`Channel`], reacts by calling the provided handler,
//! which fills an outgoing packet buffer, then sends the buffer to
//! the transport and starts again. Handlers of one connection never
//! run concurrently.

use std::convert::TryFrom;
use std::fmt::{Debug, Display, Formatter};
use std::future::{Future, Pending};

use futures::future::Either as EitherFuture;
use ssh_encoding::{Decode, Encode};
use thiserror::Error;

mod auth;
pub use auth::{AuthResult, MethodKind, MethodSet};

mod channels;
pub use channels::{Channel, ChannelMsg, ChannelReadHalf, ChannelTx, ChannelWriteHalf};

mod helpers;
pub mod keys;
mod msg;
mod parsing;
pub use parsing::ChannelType;

mod pty;
pub use pty::{Pty, PtyInfo};

mod request;
pub use request::{ChannelRequest, Decision, ProcessKind, ProcessRequest, X11Request};

mod session;

mod stream;
pub use stream::{ExitStatus, Output, SessionStream, StreamReader};

pub mod transport;
pub use transport::{ClearTransport, Transport};

/// Client side of this library.
pub mod client;

/// Server side of this library.
pub mod server;

#[derive(Debug, Error)]
pub enum Error {
    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// The client is not yet authenticated.
    #[error("Not yet authenticated")]
    NotAuthenticated,

    /// Unknown server key.
    #[error("Unknown server key")]
    UnknownKey,

    /// Excessive packet size.
    #[error("Bad packet size: {0}")]
    PacketSize(usize),

    /// The peer refused to open a channel.
    #[error("Failed to open channel ({reason:?}): {description}")]
    ChannelOpenFailure {
        reason: ChannelOpenFailure,
        description: String,
    },

    /// No open channel has this id.
    #[error("Channel not open")]
    WrongChannel,

    /// The connection is gone, pending operations can no longer complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection closed by the remote side.
    #[error("Connection closed by the remote side")]
    HUP,

    /// Authentication did not complete in time.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// Inactivity timeout.
    #[error("Inactivity timeout")]
    InactivityTimeout,

    /// Every configured authentication method was rejected.
    #[error("All configured authentication methods failed")]
    NoMoreAuthMethods,

    #[error("Channel send error")]
    SendError,

    #[error("The request was rejected by the other party")]
    RequestDenied,

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl TryFrom<u32> for Disconnect {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MACError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => return Err(crate::Error::Inconsistent),
        })
    }
}

/// Why a connection loop stopped, reported once to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent `SSH_MSG_DISCONNECT`.
    ReceivedDisconnect {
        reason: Option<Disconnect>,
        description: String,
    },
    /// We disconnected, through a `Handle` or a `Session`.
    Local,
    /// The transport reached end of stream without a disconnect message.
    Hangup,
    /// The loop failed, the error is returned by the session future.
    Error,
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    pub fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }

    pub fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel, as numbered by the local side.
pub struct ChannelId(u32);

impl Decode for ChannelId {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        Ok(Self(u32::decode(reader)?))
    }
}

impl Encode for ChannelId {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.0.encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.0.encode(writer)
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns `f(val)` if `val` it is [Some], or a forever pending [Future] if it is [None].
pub(crate) fn future_or_pending<R, F: Future<Output = R>, T>(
    val: Option<T>,
    f: impl FnOnce(T) -> F,
) -> EitherFuture<Pending<R>, F> {
    match val {
        None => EitherFuture::Left(core::future::pending()),
        Some(x) => EitherFuture::Right(f(x)),
    }
}

#[cfg(test)]
mod tests;
