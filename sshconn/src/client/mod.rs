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
//

//! # Implementing clients
//!
//! Maybe surprisingly, the data types used by this crate to
//! implement clients are relatively more complicated than for
//! servers. This is mostly related to the fact that clients are
//! generally used both in a synchronous way (in the case of SSH, we
//! can think of sending a shell command), and asynchronously (because
//! the server may send unsollicited messages), and hence need to
//! handle multiple interfaces.
//!
//! The [`Session`] is passed to the [`Handler`]. A [`Handle`] is
//! returned by [`connect`], and is used to authenticate, open
//! channels and run commands from outside the event loop.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshconn::client::{self, Credentials, ExecOptions};
//! use sshconn::keys::{self, PublicKey};
//! use sshconn::ClearTransport;
//!
//! struct Client;
//!
//! impl client::Handler for Client {
//!     type Error = sshconn::Error;
//!
//!     async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
//!         Ok(true)
//!     }
//! }
//!
//! # async fn run(stream: tokio::io::DuplexStream) -> Result<(), sshconn::Error> {
//! let transport = ClearTransport::client(stream).await?;
//! let mut session = client::connect(Arc::new(client::Config::default()), transport, Client).await?;
//! let key = keys::load_secret_key("id_ed25519")?;
//! session
//!     .authenticate(Credentials::new("user").key(key))
//!     .await?;
//! let channel = session.exec("uname -a", ExecOptions::default()).await?;
//! let output = channel.output().await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use log::debug;
use ssh_key::{PrivateKey, PublicKey};
use tokio::sync::mpsc::{channel, unbounded_channel, Sender, UnboundedReceiver};
use tokio::task::JoinHandle;

pub use crate::auth::{Method, Prompt};
use crate::auth::{AuthResult, MethodSet};
use crate::channels::{Channel, ChannelMsg, ChannelRef, Window};
use crate::keys::{self, HostHash};
use crate::request::X11Request;
use crate::transport::Transport;
use crate::{ChannelId, ChannelOpenFailure, ChannelType, Disconnect, DisconnectReason, Error, PtyInfo, Sig};

mod auth;
pub(crate) use auth::AuthState;
pub use auth::{AuthPolicy, Credentials, KeyboardInteractive, KeyboardInteractiveAuthResponse};

mod dispatch;
mod session;
pub use session::Session;

/// Messages from a [`Handle`] or a [`Channel`] to the event loop.
#[derive(Debug)]
pub enum Msg {
    Authenticate {
        user: String,
        method: Method,
    },
    AuthInfoResponse {
        responses: Vec<String>,
    },
    ChannelOpenSession {
        channel_ref: ChannelRef,
    },
    Disconnect {
        reason: Disconnect,
        description: String,
        language_tag: String,
    },
    Channel(ChannelId, ChannelMsg),
}

impl From<(ChannelId, ChannelMsg)> for Msg {
    fn from((id, msg): (ChannelId, ChannelMsg)) -> Self {
        Msg::Channel(id, msg)
    }
}

/// Messages from the event loop to the [`Handle`].
#[derive(Debug)]
pub(crate) enum Reply {
    AuthSuccess,
    AuthFailure {
        proceed_with_methods: MethodSet,
        partial_success: bool,
    },
    AuthInfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
}

/// Requests sent along with a command by [`Handle::exec`],
/// [`Handle::shell`] and [`Handle::subsystem`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Environment variables, each sent as an `env` request. Servers
    /// commonly ignore them.
    pub env: HashMap<String, String>,
    /// Ask for a pseudo-terminal.
    pub pty: Option<PtyInfo>,
    /// Ask for X11 forwarding, with a random cookie.
    pub x11: bool,
    /// Ask for agent forwarding.
    pub agent_forward: bool,
}

impl ExecOptions {
    /// Options asking for a terminal with default dimensions.
    pub fn with_pty() -> Self {
        ExecOptions {
            pty: Some(PtyInfo::default()),
            ..Default::default()
        }
    }
}

/// Handle to a session, used to send messages to a client outside of
/// the request/response cycle.
pub struct Handle<H: Handler> {
    sender: Sender<Msg>,
    receiver: UnboundedReceiver<Reply>,
    join: JoinHandle<Result<(), H::Error>>,
    config: Arc<Config>,
    authenticated: bool,
    /// Set when [`Handle::authenticate`] gave up. Replies to the
    /// abandoned attempt may still be queued, so no new one is made.
    auth_timed_out: bool,
}

impl<H: Handler> Drop for Handle<H> {
    fn drop(&mut self) {
        debug!("drop handle")
    }
}

impl<H: Handler> Handle<H> {
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether an authentication attempt through this handle succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Perform no authentication. This is useful for testing, and to
    /// learn which methods the server accepts.
    pub async fn authenticate_none<U: Into<String>>(&mut self, user: U) -> Result<AuthResult, Error> {
        self.send_auth(user.into(), Method::None).await?;
        self.wait_recv_reply().await
    }

    /// Perform password-based SSH authentication.
    pub async fn authenticate_password<U: Into<String>, P: Into<String>>(
        &mut self,
        user: U,
        password: P,
    ) -> Result<AuthResult, Error> {
        let method = Method::Password {
            password: password.into(),
        };
        self.send_auth(user.into(), method).await?;
        self.wait_recv_reply().await
    }

    /// Perform public key-based SSH authentication. The signature
    /// covers the session identifier of the transport.
    pub async fn authenticate_publickey<U: Into<String>>(
        &mut self,
        user: U,
        key: Arc<PrivateKey>,
    ) -> Result<AuthResult, Error> {
        self.send_auth(user.into(), Method::PublicKey { key }).await?;
        self.wait_recv_reply().await
    }

    /// Initiate Keyboard-Interactive based SSH authentication.
    ///
    /// * `submethods` - Hints to the server the preferred methods to be used for authentication
    pub async fn authenticate_keyboard_interactive_start<U: Into<String>, S: Into<Option<String>>>(
        &mut self,
        user: U,
        submethods: S,
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        let method = Method::KeyboardInteractive {
            submethods: submethods.into().unwrap_or_default(),
        };
        self.send_auth(user.into(), method).await?;
        self.wait_recv_keyboard_interactive_reply().await
    }

    /// Respond to the prompts of an
    /// [`KeyboardInteractiveAuthResponse::InfoRequest`].
    pub async fn authenticate_keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        if self.auth_timed_out {
            return Err(Error::ConnectionTimeout);
        }
        self.sender
            .send(Msg::AuthInfoResponse { responses })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_recv_keyboard_interactive_reply().await
    }

    async fn send_auth(&self, user: String, method: Method) -> Result<(), Error> {
        if self.auth_timed_out {
            return Err(Error::ConnectionTimeout);
        }
        self.sender
            .send(Msg::Authenticate { user, method })
            .await
            .map_err(|_| Error::SendError)
    }

    async fn wait_recv_reply(&mut self) -> Result<AuthResult, Error> {
        loop {
            match self.receiver.recv().await {
                Some(Reply::AuthSuccess) => {
                    self.authenticated = true;
                    return Ok(AuthResult::Success);
                }
                Some(Reply::AuthFailure {
                    proceed_with_methods,
                    partial_success,
                }) => {
                    return Ok(AuthResult::Failure {
                        remaining_methods: proceed_with_methods,
                        partial_success,
                    })
                }
                Some(reply) => debug!("unexpected reply {:?}", reply),
                None => return Err(Error::ConnectionClosed),
            }
        }
    }

    async fn wait_recv_keyboard_interactive_reply(
        &mut self,
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        match self.receiver.recv().await {
            Some(Reply::AuthSuccess) => {
                self.authenticated = true;
                Ok(KeyboardInteractiveAuthResponse::Success)
            }
            Some(Reply::AuthFailure {
                proceed_with_methods,
                partial_success,
            }) => Ok(KeyboardInteractiveAuthResponse::Failure {
                remaining_methods: proceed_with_methods,
                partial_success,
            }),
            Some(Reply::AuthInfoRequest {
                name,
                instructions,
                prompts,
            }) => Ok(KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            }),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Wait for confirmation that a channel is open
    async fn wait_channel_confirmation(
        &self,
        mut receiver: UnboundedReceiver<ChannelMsg>,
        window: Arc<Window>,
    ) -> Result<Channel<Msg>, Error> {
        loop {
            match receiver.recv().await {
                Some(ChannelMsg::Open { id, .. }) => {
                    return Ok(Channel::new(id, self.sender.clone(), receiver, window));
                }
                Some(ChannelMsg::OpenFailure {
                    reason,
                    description,
                }) => {
                    return Err(Error::ChannelOpenFailure {
                        reason,
                        description,
                    });
                }
                None => {
                    return Err(Error::ConnectionClosed);
                }
                msg => {
                    debug!("msg = {:?}", msg);
                }
            }
        }
    }

    /// Request a session channel (the most basic type of
    /// channel). This function returns `Ok(..)` immediately if the
    /// connection is authenticated, but the channel only becomes
    /// usable when it's confirmed by the server, as indicated by the
    /// `confirmed` field of the corresponding `Channel`.
    pub async fn channel_open_session(&self) -> Result<Channel<Msg>, Error> {
        if !self.authenticated {
            return Err(Error::NotAuthenticated);
        }
        let (sender, receiver) = unbounded_channel();
        let channel_ref = ChannelRef::new(sender);
        let window = channel_ref.window().clone();
        self.sender
            .send(Msg::ChannelOpenSession { channel_ref })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_channel_confirmation(receiver, window).await
    }

    /// Open a session channel and run `command` on it, after sending
    /// the requests `options` asks for. Fails if the channel or any
    /// of the requests (except `env`) is refused, in which case the
    /// channel is closed again.
    pub async fn exec<C: Into<String>>(
        &self,
        command: C,
        options: ExecOptions,
    ) -> Result<Channel<Msg>, Error> {
        let command = command.into();
        self.start(options, |channel| async move {
            channel.exec(true, command).await
        })
        .await
    }

    /// Like [`Handle::exec`], for an interactive shell.
    pub async fn shell(&self, options: ExecOptions) -> Result<Channel<Msg>, Error> {
        self.start(options, |channel| async move {
            channel.request_shell(true).await
        })
        .await
    }

    /// Like [`Handle::exec`], for a subsystem such as `sftp`.
    pub async fn subsystem<N: Into<String>>(
        &self,
        name: N,
        options: ExecOptions,
    ) -> Result<Channel<Msg>, Error> {
        let name = name.into();
        self.start(options, |channel| async move {
            channel.request_subsystem(true, name).await
        })
        .await
    }

    async fn start<F, Fut>(&self, options: ExecOptions, run: F) -> Result<Channel<Msg>, Error>
    where
        F: FnOnce(crate::ChannelWriteHalf<Msg>) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let channel = self.channel_open_session().await?;
        let writer = channel.write_half.clone();
        let requests = async {
            for (name, value) in options.env {
                writer.set_env(false, name, value).await?;
            }
            if let Some(pty) = options.pty {
                writer.request_pty(true, &pty).await?;
            }
            if options.x11 {
                writer
                    .request_x11(true, X11Request::with_random_cookie())
                    .await?;
            }
            if options.agent_forward {
                writer.agent_forward(true).await?;
            }
            run(writer.clone()).await
        };
        if let Err(e) = requests.await {
            debug!("channel {}: setup failed: {:?}", channel.id(), e);
            if let Err(close) = channel.close().await {
                debug!("channel {}: could not close: {:?}", channel.id(), close);
            }
            return Err(e);
        }
        Ok(channel)
    }

    /// Sends a disconnect message.
    pub async fn disconnect(
        &self,
        reason: Disconnect,
        description: &str,
        language_tag: &str,
    ) -> Result<(), Error> {
        self.sender
            .send(Msg::Disconnect {
                reason,
                description: description.into(),
                language_tag: language_tag.into(),
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn abandon_authentication(&mut self) {
        self.auth_timed_out = true;
    }
}

impl<H: Handler> Future for Handle<H> {
    type Output = Result<(), H::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Future::poll(Pin::new(&mut self.join), cx) {
            Poll::Ready(r) => Poll::Ready(match r {
                Ok(Ok(x)) => Ok(x),
                Err(e) => Err(crate::Error::from(e).into()),
                Ok(Err(e)) => Err(e),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Start a client session over an established transport. The server
/// host key is checked with [`Handler::check_server_key`] and, when
/// [`Config::host_hash`] is set, [`Handler::verify_host_fingerprint`];
/// the connection only proceeds if both accept it.
pub async fn connect<H, T>(config: Arc<Config>, transport: T, mut handler: H) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    T: Transport,
{
    let host_key = transport
        .remote_host_key()
        .cloned()
        .ok_or(Error::UnknownKey)?;
    if !handler.check_server_key(&host_key).await? {
        debug!("server key rejected");
        return Err(Error::UnknownKey.into());
    }
    if let Some(hash) = config.host_hash {
        let fingerprint = keys::fingerprint(hash, &host_key)?;
        if !handler.verify_host_fingerprint(hash, &fingerprint).await? {
            debug!("host fingerprint {} rejected", fingerprint);
            return Err(Error::UnknownKey.into());
        }
    }

    let (sender, receiver) = channel(config.event_buffer_size);
    let (reply_sender, reply_receiver) = unbounded_channel();
    let session = Session::new(
        config.clone(),
        transport.session_id().to_vec(),
        receiver,
        reply_sender,
        sender.downgrade(),
    )?;
    let join = tokio::spawn(session.run(transport, handler));

    Ok(Handle {
        sender,
        receiver: reply_receiver,
        join,
        config,
        authenticated: false,
        auth_timed_out: false,
    })
}

/// The configuration of clients.
#[derive(Debug)]
pub struct Config {
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Also present the host key fingerprint, computed with this hash,
    /// to [`Handler::verify_host_fingerprint`].
    pub host_hash: Option<HostHash>,
    /// Time allowed to [`Handle::authenticate`] for the whole negotiation.
    pub ready_timeout: Option<Duration>,
    /// Buffer size for each channel (a number of unprocessed messages to store before propagating backpressure to the TCP stream)
    pub event_buffer_size: usize,
    /// Time after which the connection is garbage-collected.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            window_size: 2097152,
            maximum_packet_size: 32768,
            host_hash: None,
            ready_timeout: Some(Duration::from_secs(20)),
            event_buffer_size: 10,
            inactivity_timeout: None,
        }
    }
}

/// A client handler. Note that messages can be received from the
/// server at any time during a session.
///
/// Note: this is an async trait. The default implementations of the
/// channel events do nothing: the corresponding [`Channel`] receives
/// the same events as [`ChannelMsg`]s.
#[cfg_attr(feature = "async-trait", async_trait::async_trait)]
pub trait Handler: Sized + Send {
    type Error: From<crate::Error> + Send + core::fmt::Debug;

    /// Called when the server sends us an authentication banner. This
    /// is usually meant to be shown to the user, see
    /// [RFC4252](https://tools.ietf.org/html/rfc4252#section-5.4) for
    /// more details.
    #[allow(unused_variables)]
    fn auth_banner(
        &mut self,
        banner: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called to check the server's public key. This is a very important
    /// step to help prevent man-in-the-middle attacks. The default
    /// implementation rejects all keys.
    #[allow(unused_variables)]
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(false) }
    }

    /// Called with the lowercase hex digest of the server's host key
    /// when [`Config::host_hash`] is set.
    #[allow(unused_variables)]
    fn verify_host_fingerprint(
        &mut self,
        hash: HostHash,
        fingerprint: &str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(true) }
    }

    /// Called when the server confirmed our request to open a
    /// channel.
    #[allow(unused_variables)]
    fn channel_open_confirmation(
        &mut self,
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server rejected our request to open a channel.
    #[allow(unused_variables)]
    fn channel_open_failure(
        &mut self,
        channel: ChannelId,
        reason: &ChannelOpenFailure,
        description: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server closes a channel.
    #[allow(unused_variables)]
    fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server sends EOF to a channel.
    #[allow(unused_variables)]
    fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server opens a channel of its own: X11 or agent
    /// forwardings, mostly. Returning `false`, the default, refuses it.
    #[allow(unused_variables)]
    fn server_channel_open(
        &mut self,
        channel: Channel<Msg>,
        kind: &ChannelType,
        session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(false) }
    }

    /// Called when the server sends us data. The `extended_code`
    /// parameter is a stream identifier, `None` is usually the
    /// standard output, and `Some(1)` is the standard error. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-5.2).
    #[allow(unused_variables)]
    fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server sends us data on an extended stream.
    #[allow(unused_variables)]
    fn extended_data(
        &mut self,
        channel: ChannelId,
        ext: u32,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// The server informs this client of whether the client may
    /// perform control-S/control-Q flow control. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6.8).
    #[allow(unused_variables)]
    fn xon_xoff(
        &mut self,
        channel: ChannelId,
        client_can_do: bool,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// The remote process has exited, with the given exit status.
    #[allow(unused_variables)]
    fn exit_status(
        &mut self,
        channel: ChannelId,
        exit_status: u32,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// The remote process exited upon receiving a signal.
    #[allow(unused_variables)]
    fn exit_signal(
        &mut self,
        channel: ChannelId,
        signal_name: Sig,
        core_dumped: bool,
        error_message: &str,
        lang_tag: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the network window is adjusted, meaning that we
    /// can send more bytes.
    #[allow(unused_variables)]
    fn window_adjusted(
        &mut self,
        channel: ChannelId,
        new_size: u32,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called once, when the connection is over, whatever the reason.
    #[allow(unused_variables)]
    fn disconnected(
        &mut self,
        reason: DisconnectReason,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }
}
