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
use tokio::sync::mpsc::{Receiver, UnboundedSender, WeakSender};

use super::{dispatch, AuthState, Config, Handler, Msg, Reply};
use crate::request::Peer;
use crate::session::CommonSession;
use crate::transport::Transport;
use crate::{future_or_pending, ChannelId, ChannelMsg, ChannelType, Disconnect, DisconnectReason, Error};

/// Actual client session's state.
///
/// It is in charge of multiplexing and keeping track of various channels
/// that may get opened and closed during the lifetime of an SSH session and
/// allows sending messages to the server.
#[derive(Debug)]
pub struct Session {
    pub(crate) common: CommonSession<Arc<Config>>,
    receiver: Receiver<Msg>,
    pub(super) sender: UnboundedSender<Reply>,
    /// Lets server-opened channels talk to this loop without keeping it
    /// alive once every handle is gone.
    pub(super) channel_sender: WeakSender<Msg>,
    pub(super) auth: AuthState,
}

impl Session {
    pub(super) fn new(
        config: Arc<Config>,
        session_id: Vec<u8>,
        receiver: Receiver<Msg>,
        sender: UnboundedSender<Reply>,
        channel_sender: WeakSender<Msg>,
    ) -> Result<Self, Error> {
        let mut session = Session {
            common: CommonSession::new(config, session_id, Peer::Server),
            receiver,
            sender,
            channel_sender,
            auth: AuthState::default(),
        };
        session.request_userauth_service()?;
        Ok(session)
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.authenticated
    }

    pub fn config(&self) -> &Config {
        &self.common.config
    }

    /// Send data to a channel. Data that does not fit in the server's
    /// window is queued and sent once the window grows. Other writers
    /// of the channel wait until then.
    pub fn data(&mut self, channel: ChannelId, data: Bytes) -> Result<(), Error> {
        self.common.unreserved_data(channel, None, data)
    }

    /// Send data on an extended stream of a channel.
    pub fn extended_data(&mut self, channel: ChannelId, ext: u32, data: Bytes) -> Result<(), Error> {
        self.common.unreserved_data(channel, Some(ext), data)
    }

    /// Signal the end of our data on a channel.
    pub fn eof(&mut self, channel: ChannelId) -> Result<(), Error> {
        self.common.channel_msg(channel, ChannelMsg::Eof)
    }

    /// Close a channel, after its queued data.
    pub fn close(&mut self, channel: ChannelId) -> Result<(), Error> {
        self.common.channel_msg(channel, ChannelMsg::Close)
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
        self.common.write.flush(transport).await?;

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
                            debug!("transport closed by the server");
                            return Ok(DisconnectReason::Hangup);
                        }
                    }
                }
                msg = self.receiver.recv() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg).await?,
                        None => {
                            debug!("all handles dropped");
                            self.common.disconnect(Disconnect::ByApplication, "", "en")?;
                        }
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
            Msg::Authenticate { user, method } => self.authenticate(user, method)?,
            Msg::AuthInfoResponse { responses } => self.auth_info_response(responses)?,
            Msg::ChannelOpenSession { channel_ref } => {
                let window_size = self.common.config.window_size;
                let maximum_packet_size = self.common.config.maximum_packet_size;
                self.common.open_channel(
                    ChannelType::Session,
                    channel_ref,
                    window_size,
                    maximum_packet_size,
                )?;
            }
            Msg::Disconnect {
                reason,
                description,
                language_tag,
            } => self
                .common
                .disconnect(reason, &description, &language_tag)?,
            Msg::Channel(id, msg) => {
                self.common.channel_msg(id, msg)?;
                self.common.remove_if_closed(id).await;
            }
        }
        Ok(())
    }
}
