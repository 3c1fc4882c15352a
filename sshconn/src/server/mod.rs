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

//! # Writing servers
//!
//! There are two ways of accepting connections:
//! * implement the [`Server`] trait and let [`Server::serve`] handle everything
//! * accept connections yourself and pass them to [`run_stream`]
//!
//! In both cases, you'll first need to implement the [`Handler`] trait,
//! this is where you'll handle various events.
//!
//! Requests on a session channel reach the handler only when they
//! make sense at that point of the session: a second `exec`, or a
//! `pty-req` once the program runs, are refused without asking. When
//! the handler accepts `exec`, `shell` or `subsystem`, it receives a
//! [`ProcessRequest`] with everything accepted before on that channel
//! (environment, terminal, forwardings), and is expected to start the
//! program and report its output and exit status on the channel.
//!
//! Here is an example server, which runs a canned program for every
//! `exec`:
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshconn::server::{self, Auth, Msg, PublicKeyAttempt, Session};
//! use sshconn::{Channel, ChannelId, Decision, ProcessRequest};
//!
//! struct Server;
//!
//! impl server::Handler for Server {
//!     type Error = sshconn::Error;
//!
//!     async fn auth_publickey(&mut self, _: &str, attempt: &PublicKeyAttempt) -> Result<Auth, Self::Error> {
//!         if attempt.signature.is_none() || attempt.verify_signature() {
//!             Ok(Auth::Accept)
//!         } else {
//!             Ok(Auth::reject())
//!         }
//!     }
//!
//!     async fn channel_open_session(&mut self, _: Channel<Msg>, _: &mut Session) -> Result<bool, Self::Error> {
//!         Ok(true)
//!     }
//!
//!     async fn exec_request(
//!         &mut self,
//!         channel: ChannelId,
//!         process: &ProcessRequest,
//!         session: &mut Session,
//!     ) -> Result<Decision, Self::Error> {
//!         let output = format!("would run {:?}\n", process.command());
//!         session.data(channel, output.into())?;
//!         session.exit_status_request(channel, 0)?;
//!         session.eof(channel)?;
//!         session.close(channel)?;
//!         Ok(Decision::Accept)
//!     }
//! }
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, error};
use tokio::task::JoinHandle;

use crate::auth::MethodSet;
use crate::request::X11Request;
use crate::transport::Transport;
use crate::{Channel, ChannelId, ChannelType, Decision, DisconnectReason, ProcessRequest, PtyInfo, Sig};

mod auth;
pub use auth::PublicKeyAttempt;
pub(crate) use auth::AuthState;

mod dispatch;
mod session;
pub use session::{Handle, Msg, Session, WindowRequest};

/// Configuration of a server.
#[derive(Debug)]
pub struct Config {
    /// Authentication methods proposed to the client.
    pub methods: MethodSet,
    /// The authentication banner, usually a warning message shown to the client.
    pub auth_banner: Option<&'static str>,
    /// Authentication rejections must happen in constant time for
    /// security reasons. Rejections are held back until this much time
    /// has passed since the request arrived.
    pub auth_rejection_time: Duration,
    /// Authentication rejection time override for the initial "none" auth attempt.
    /// Clients send an initial "none" auth to probe for authentication methods.
    pub auth_rejection_time_initial: Option<Duration>,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Internal event buffer size
    pub event_buffer_size: usize,
    /// Maximal number of allowed authentication attempts.
    pub max_auth_attempts: usize,
    /// Time after which the connection is garbage-collected.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            methods: MethodSet::all(),
            auth_banner: None,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: None,
            window_size: 2097152,
            maximum_packet_size: 32768,
            event_buffer_size: 10,
            max_auth_attempts: 10,
            inactivity_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// An authentication decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// Reject the authentication request.
    Reject {
        /// The methods to advertise instead of the remaining ones.
        proceed_with_methods: Option<MethodSet>,
    },
    /// Accept the authentication request.
    Accept,
    /// The method succeeded, but more are needed.
    Partial { proceed_with_methods: MethodSet },
    /// Ask the client more questions, in a keyboard-interactive
    /// exchange.
    Prompt {
        /// Name of this challenge.
        name: Cow<'static, str>,
        /// Instructions for this challenge.
        instructions: Cow<'static, str>,
        /// A number of prompts to the user. Each prompt has a `bool`
        /// indicating whether the terminal must echo the characters
        /// typed by the user.
        prompts: Cow<'static, [(Cow<'static, str>, bool)]>,
    },
}

impl Auth {
    /// Reject, advertising the remaining methods.
    pub fn reject() -> Self {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }
}

/// Server handler. Each client will have their own handler.
///
/// Note: this is an async trait. Hooks deciding on a request return
/// the decision; the reply is sent in the order the requests arrived.
#[cfg_attr(feature = "async-trait", async_trait::async_trait)]
pub trait Handler: Sized + Send {
    type Error: From<crate::Error> + Send + core::fmt::Debug;

    /// Check authentication using the "none" method. Rejections
    /// happen no sooner than `config.auth_rejection_time_initial`
    /// after the request.
    #[allow(unused_variables)]
    fn auth_none(&mut self, user: &str) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        async { Ok(Auth::reject()) }
    }

    /// Check authentication using the "password" method. Rejections
    /// happen no sooner than `config.auth_rejection_time` after the
    /// request.
    #[allow(unused_variables)]
    fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        async { Ok(Auth::reject()) }
    }

    /// Check authentication using the "publickey" method. This is
    /// called for queries (without a signature), for which accepting
    /// only means the key would be acceptable, and for signed
    /// attempts, which must be checked with
    /// [`PublicKeyAttempt::verify_signature`].
    #[allow(unused_variables)]
    fn auth_publickey(
        &mut self,
        user: &str,
        attempt: &PublicKeyAttempt,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        async { Ok(Auth::reject()) }
    }

    /// Check authentication using the "keyboard-interactive"
    /// method. `response` is `None` at the start of the exchange, and
    /// holds the answers to the last [`Auth::Prompt`] afterwards.
    #[allow(unused_variables)]
    fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        submethods: &str,
        response: Option<&[String]>,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        async { Ok(Auth::reject()) }
    }

    /// Called when authentication succeeds for a session.
    #[allow(unused_variables)]
    fn auth_succeeded(
        &mut self,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when a new session channel is created. Return `true`
    /// to accept the channel, and keep `channel` to talk on it.
    #[allow(unused_variables)]
    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(false) }
    }

    /// Called when the client opens any other kind of channel.
    #[allow(unused_variables)]
    fn channel_open(
        &mut self,
        channel: Channel<Msg>,
        kind: &ChannelType,
        session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(false) }
    }

    /// Called when the client closes a channel.
    #[allow(unused_variables)]
    fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the client sends EOF to a channel.
    #[allow(unused_variables)]
    fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when a data packet is received. A response can be
    /// written to the `response` argument.
    #[allow(unused_variables)]
    fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when an extended data packet is received. Code 1 means
    /// that this packet comes from stderr, other codes are not
    /// defined (see
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-5.2)).
    #[allow(unused_variables)]
    fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
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

    /// The client requests a pseudo-terminal with the given
    /// specifications.
    #[allow(unused_variables)]
    fn pty_request(
        &mut self,
        channel: ChannelId,
        pty: &PtyInfo,
        session: &mut Session,
    ) -> impl Future<Output = Result<Decision, Self::Error>> + Send {
        async { Ok(Decision::Reject) }
    }

    /// The client wants to set the given environment variable. Check
    /// these carefully, as it is dangerous to allow any variable
    /// environment to be set.
    #[allow(unused_variables)]
    fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<Decision, Self::Error>> + Send {
        async { Ok(Decision::Reject) }
    }

    /// The client requests an X11 connection.
    #[allow(unused_variables)]
    fn x11_request(
        &mut self,
        channel: ChannelId,
        x11: &X11Request,
        session: &mut Session,
    ) -> impl Future<Output = Result<Decision, Self::Error>> + Send {
        async { Ok(Decision::Reject) }
    }

    /// The client requests OpenSSH agent forwarding
    #[allow(unused_variables)]
    fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<Decision, Self::Error>> + Send {
        async { Ok(Decision::Reject) }
    }

    /// The client sends a command to execute, to be passed to a
    /// shell. Make sure to check the command before doing so.
    #[allow(unused_variables)]
    fn exec_request(
        &mut self,
        channel: ChannelId,
        process: &ProcessRequest,
        session: &mut Session,
    ) -> impl Future<Output = Result<Decision, Self::Error>> + Send {
        async { Ok(Decision::Reject) }
    }

    /// The client requests a shell.
    #[allow(unused_variables)]
    fn shell_request(
        &mut self,
        channel: ChannelId,
        process: &ProcessRequest,
        session: &mut Session,
    ) -> impl Future<Output = Result<Decision, Self::Error>> + Send {
        async { Ok(Decision::Reject) }
    }

    /// The client asks to start the subsystem with the given name
    /// (such as sftp).
    #[allow(unused_variables)]
    fn subsystem_request(
        &mut self,
        channel: ChannelId,
        process: &ProcessRequest,
        session: &mut Session,
    ) -> impl Future<Output = Result<Decision, Self::Error>> + Send {
        async { Ok(Decision::Reject) }
    }

    /// The client's pseudo-terminal window size has changed.
    #[allow(unused_variables)]
    fn window_change_request(
        &mut self,
        channel: ChannelId,
        cols: u32,
        rows: u32,
        width: u32,
        height: u32,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// The client is sending a signal (usually to pass to the
    /// currently running process).
    #[allow(unused_variables)]
    fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
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

/// Trait used to create new handlers when clients connect.
pub trait Server {
    /// The type of handlers.
    type Handler: Handler + Send + 'static;

    /// Called when a new client connects.
    fn new_client(&mut self) -> Self::Handler;

    /// Called when a session ends with an error.
    #[allow(unused_variables)]
    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {}

    /// Runs a session for every transport `transports` yields, until
    /// it ends. Sessions run in their own tasks.
    fn serve<T, S>(
        &mut self,
        config: Arc<Config>,
        mut transports: S,
    ) -> impl Future<Output = ()> + Send
    where
        Self: Send,
        T: Transport,
        S: Stream<Item = T> + Unpin + Send,
    {
        async move {
            let (errors, mut failed) = tokio::sync::mpsc::unbounded_channel();
            loop {
                tokio::select! {
                    transport = transports.next() => {
                        let Some(transport) = transport else {
                            break;
                        };
                        let handler = self.new_client();
                        let session = run_stream(config.clone(), transport, handler);
                        let errors = errors.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session.await {
                                debug!("session ended with an error: {:?}", e);
                                if let Err(e) = errors.send(e) {
                                    debug!("server stopped, dropping session error: {:?}", e.0);
                                }
                            }
                        });
                    }
                    Some(e) = failed.recv() => {
                        error!("session error: {:?}", e);
                        self.handle_session_error(e);
                    }
                }
            }
            debug!("no more connections");
        }
    }
}

/// An active server session returned by [run_stream].
///
/// Implements [Future] and needs to be awaited to allow the session to run.
pub struct RunningSession<H: Handler> {
    handle: Handle,
    join: JoinHandle<Result<(), H::Error>>,
}

impl<H: Handler> RunningSession<H> {
    /// Returns a new handle for the session.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl<H: Handler> Future for RunningSession<H> {
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

/// Run a single connection to completion.
pub fn run_stream<H, T>(config: Arc<Config>, transport: T, handler: H) -> RunningSession<H>
where
    H: Handler + Send + 'static,
    T: Transport,
{
    let (sender, receiver) = tokio::sync::mpsc::channel(config.event_buffer_size);
    let handle = Handle { sender };
    let session = Session::new(config, transport.session_id().to_vec(), receiver, handle.clone());
    let join = tokio::spawn(session.run(transport, handler));
    debug!("session is running");
    RunningSession { handle, join }
}
