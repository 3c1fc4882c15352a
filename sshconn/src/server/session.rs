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

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::oneshot;

use super::{dispatch, AuthState, Config, Handler};
use crate::channels::Window;
use crate::request::Peer;
use crate::session::CommonSession;
use crate::transport::Transport;
use crate::{
    future_or_pending, ChannelId, ChannelMsg, ChannelWriteHalf, Disconnect, DisconnectReason,
    Error, Sig,
};

/// Messages from a [`Handle`] or a [`crate::Channel`] to the event loop.
#[derive(Debug)]
#[non_exhaustive]
pub enum Msg {
    Channel(ChannelId, ChannelMsg),
    Disconnect {
        reason: Disconnect,
        description: String,
        language_tag: String,
    },
    /// Used by [`Handle::data`] to wait for room in a channel's window.
    Window(WindowRequest),
}

/// Asks the event loop for the outgoing window of a channel.
#[derive(Debug)]
pub struct WindowRequest {
    id: ChannelId,
    reply: oneshot::Sender<Option<Arc<Window>>>,
}

impl From<(ChannelId, ChannelMsg)> for Msg {
    fn from((id, msg): (ChannelId, ChannelMsg)) -> Self {
        Msg::Channel(id, msg)
    }
}

/// Handle to a session, used to send messages to a client outside of
/// the request/response cycle.
#[derive(Clone, Debug)]
pub struct Handle {
    pub(crate) sender: Sender<Msg>,
}

impl Handle {
    async fn send(&self, id: ChannelId, msg: ChannelMsg) -> Result<(), Error> {
        self.sender
            .send(Msg::Channel(id, msg))
            .await
            .map_err(|_| Error::SendError)
    }

    /// A writer for channel `id`, sharing the channel's window with
    /// every other writer.
    async fn writer(&self, id: ChannelId) -> Result<ChannelWriteHalf<Msg>, Error> {
        let (reply, window) = oneshot::channel();
        self.sender
            .send(Msg::Window(WindowRequest { id, reply }))
            .await
            .map_err(|_| Error::SendError)?;
        match window.await {
            Ok(Some(window)) => Ok(ChannelWriteHalf {
                id,
                sender: self.sender.clone(),
                window,
            }),
            Ok(None) => Err(Error::WrongChannel),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Send data to a channel. Waits while the client's window is full.
    pub async fn data(&self, id: ChannelId, data: Bytes) -> Result<(), Error> {
        self.writer(id).await?.data(&data[..]).await
    }

    /// Send data on an extended stream of a channel. Waits while the
    /// client's window is full.
    pub async fn extended_data(&self, id: ChannelId, ext: u32, data: Bytes) -> Result<(), Error> {
        self.writer(id).await?.extended_data(ext, &data[..]).await
    }

    /// Send EOF to a channel
    pub async fn eof(&self, id: ChannelId) -> Result<(), Error> {
        self.send(id, ChannelMsg::Eof).await
    }

    /// Close a channel.
    pub async fn close(&self, id: ChannelId) -> Result<(), Error> {
        self.send(id, ChannelMsg::Close).await
    }

    /// Send the exit status of a program.
    pub async fn exit_status_request(&self, id: ChannelId, exit_status: u32) -> Result<(), Error> {
        self.send(id, ChannelMsg::ExitStatus { exit_status }).await
    }

    /// Report the signal that killed a program.
    pub async fn exit_signal_request(
        &self,
        id: ChannelId,
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    ) -> Result<(), Error> {
        self.send(
            id,
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            },
        )
        .await
    }

    /// Allows a server to disconnect a client session
    pub async fn disconnect(
        &self,
        reason: Disconnect,
        description: String,
        language_tag: String,
    ) -> Result<(), Error> {
        self.sender
            .send(Msg::Disconnect {
                reason,
                description,
                language_tag,
            })
            .await
            .map_err(|_| Error::SendError)
    }
}

/// A connected server session. This type is unique to a client.
#[derive(Debug)]
pub struct Session {
    pub(crate) common: CommonSession<Arc<Config>>,
    receiver: Receiver<Msg>,
    pub(super) sender: Handle,
    pub(super) auth: AuthState,
}

impl Session {
    pub(super) fn new(
        config: Arc<Config>,
        session_id: Vec<u8>,
        receiver: Receiver<Msg>,
        sender: Handle,
    ) -> Self {
        let auth = AuthState::new(config.methods.clone());
        Session {
            common: CommonSession::new(config, session_id, Peer::Client),
            receiver,
            sender,
            auth,
        }
    }

    /// The user name the client authenticated as, empty until then.
    pub fn auth_user(&self) -> &str {
        &self.common.auth_user
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.authenticated
    }

    pub fn config(&self) -> &Config {
        &self.common.config
    }

    /// Get a handle to this session.
    pub fn handle(&self) -> Handle {
        self.sender.clone()
    }

    /// Send data to a channel. Data beyond the client's window is
    /// queued, and other writers of the channel wait until the client
    /// has made room for it.
    pub fn data(&mut self, channel: ChannelId, data: Bytes) -> Result<(), Error> {
        self.common.unreserved_data(channel, None, data)
    }

    /// Send data on an extended stream of a channel, usually 1 for stderr.
    pub fn extended_data(&mut self, channel: ChannelId, ext: u32, data: Bytes) -> Result<(), Error> {
        self.common.unreserved_data(channel, Some(ext), data)
    }

    /// Send EOF to a channel, after its queued data.
    pub fn eof(&mut self, channel: ChannelId) -> Result<(), Error> {
        self.common.channel_msg(channel, ChannelMsg::Eof)
    }

    /// Close a channel, after its queued data.
    pub fn close(&mut self, channel: ChannelId) -> Result<(), Error> {
        self.common.channel_msg(channel, ChannelMsg::Close)
    }

    /// Send the exit status of a program.
    pub fn exit_status_request(&mut self, channel: ChannelId, exit_status: u32) -> Result<(), Error> {
        self.common
            .channel_msg(channel, ChannelMsg::ExitStatus { exit_status })
    }

    /// Report the signal that killed a program.
    pub fn exit_signal_request(
        &mut self,
        channel: ChannelId,
        signal_name: Sig,
        core_dumped: bool,
        error_message: &str,
        lang_tag: &str,
    ) -> Result<(), Error> {
        self.common.channel_msg(
            channel,
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message: error_message.to_string(),
                lang_tag: lang_tag.to_string(),
            },
        )
    }

    /// Sends a disconnect message. The event loop stops once the
    /// current event has been handled.
    pub fn disconnect(
        &mut self,
        reason: Disconnect,
        description: &str,
        language_tag: &str,
    ) -> Result<(), Error> {
        self.common.disconnect(reason, description, language_tag)
    }

    pub(super) async fn run<H: Handler, T: Transport>(
        mut self,
        mut transport: T,
        mut handler: H,
    ) -> Result<(), H::Error> {
        let result = self.run_inner(&mut transport, &mut handler).await;
        self.common.teardown().await;
        if let Err(e) = self.common.write.flush(&mut transport).await {
            debug!("flushing before close: {:?}", e);
        }
        if let Err(e) = transport.close().await {
            debug!("closing transport: {:?}", e);
        }
        let reason = match &result {
            Ok(reason) => reason.clone(),
            Err(e) => {
                debug!("session ended with an error: {:?}", e);
                DisconnectReason::Error
            }
        };
        handler.disconnected(reason).await?;
        result.map(|_| ())
    }

    async fn run_inner<H: Handler, T: Transport>(
        &mut self,
        transport: &mut T,
        handler: &mut H,
    ) -> Result<DisconnectReason, H::Error> {
        #[allow(clippy::panic)] // false positive in select! macro
        loop {
            let inactivity = future_or_pending(self.common.config.inactivity_timeout, tokio::time::sleep);
            tokio::pin!(inactivity);

            tokio::select! {
                r = transport.recv() => {
                    match r? {
                        Some(buf) => {
                            if let Some(reason) = dispatch::reply(self, handler, &buf).await? {
                                return Ok(reason);
                            }
                        }
                        None => {
                            debug!("transport closed by the client");
                            return Ok(DisconnectReason::Hangup);
                        }
                    }
                }
                msg = self.receiver.recv() => {
                    if let Some(msg) = msg {
                        self.handle_msg(msg).await?;
                    }

                    // eagerly take all outgoing messages so writes are batched
                    while let Ok(next) = self.receiver.try_recv() {
                        self.handle_msg(next).await?;
                    }
                }
                () = &mut inactivity => {
                    debug!("inactivity timeout");
                    self.common.disconnect(Disconnect::ByApplication, "inactivity timeout", "en")?;
                    return Err(Error::InactivityTimeout.into());
                }
            }

            self.common.settle_windows().await;
            if !self.common.write.is_empty() {
                trace!("flushing outgoing packets");
                self.common.write.flush(transport).await?;
            }
            if self.common.disconnected {
                return Ok(DisconnectReason::Local);
            }
        }
    }

    async fn handle_msg(&mut self, msg: Msg) -> Result<(), Error> {
        match msg {
            Msg::Channel(id, msg) => {
                self.common.channel_msg(id, msg)?;
                self.common.remove_if_closed(id).await;
            }
            Msg::Disconnect {
                reason,
                description,
                language_tag,
            } => self
                .common
                .disconnect(reason, &description, &language_tag)?,
            Msg::Window(WindowRequest { id, reply }) => {
                let window = self
                    .common
                    .channels
                    .get(&id)
                    .map(|params| params.sink.window().clone());
                if reply.send(window).is_err() {
                    trace!("window request abandoned");
                }
            }
        }
        Ok(())
    }
}
