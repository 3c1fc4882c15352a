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

use bytes::Bytes;
use log::{debug, trace, warn};
use ssh_encoding::{Decode, Encode};

use crate::channels::table::{ChannelParams, ChannelTable};
use crate::channels::ChannelRef;
use crate::parsing::{ChannelOpenConfirmation, ChannelOpenRefusal, ChannelType, OpenChannelMessage};
use crate::request::{ChannelRequest, Peer, ReplyToken, Route};
use crate::transport::Transport;
use crate::{msg, ChannelId, ChannelMsg, ChannelOpenFailure, Disconnect, DisconnectReason, Error};

/// Largest amount of data handed to the event loop at once by a writer.
pub(crate) const DATA_CHUNK: usize = 32768;

/// Payloads produced while handling one event, sent to the transport
/// once the event has been handled.
#[derive(Debug, Default)]
pub(crate) struct PacketWriter {
    packets: Vec<Vec<u8>>,
}

impl PacketWriter {
    pub fn packet<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), ssh_encoding::Error>,
    {
        let mut payload = Vec::new();
        f(&mut payload)?;
        self.push(payload);
        Ok(())
    }

    pub fn push(&mut self, payload: Vec<u8>) {
        if let Some(&typ) = payload.first() {
            trace!("queueing {}", msg::name(typ));
        }
        self.packets.push(payload)
    }

    pub fn take(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.packets)
    }

    pub fn extend(&mut self, payloads: Vec<Vec<u8>>) {
        for payload in payloads {
            self.push(payload)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub async fn flush<T: Transport>(&mut self, transport: &mut T) -> Result<(), Error> {
        for payload in self.take() {
            transport.send(&payload).await?;
        }
        Ok(())
    }
}

/// A `CHANNEL_REQUEST` from the peer.
#[derive(Debug)]
pub(crate) struct IncomingRequest {
    pub id: ChannelId,
    pub request: ChannelRequest,
    /// Present when the peer wants a reply.
    pub token: Option<ReplyToken>,
}

/// The state both sides of a connection share.
#[derive(Debug)]
pub(crate) struct CommonSession<Config> {
    pub config: Config,
    pub write: PacketWriter,
    pub channels: ChannelTable,
    pub session_id: Vec<u8>,
    pub auth_user: String,
    /// The side at the other end of the transport.
    pub peer: Peer,
    pub disconnected: bool,
}

impl<C> CommonSession<C> {
    pub fn new(config: C, session_id: Vec<u8>, peer: Peer) -> Self {
        CommonSession {
            config,
            write: PacketWriter::default(),
            channels: ChannelTable::default(),
            session_id,
            auth_user: String::new(),
            peer,
            disconnected: false,
        }
    }

    /// Sends a disconnect message. Only the first call has an effect.
    pub fn disconnect(
        &mut self,
        reason: Disconnect,
        description: &str,
        language_tag: &str,
    ) -> Result<(), Error> {
        if self.disconnected {
            return Ok(());
        }
        debug!("disconnecting: {:?} {:?}", reason, description);
        self.disconnected = true;
        self.write.packet(|w| {
            msg::DISCONNECT.encode(w)?;
            (reason as u32).encode(w)?;
            description.encode(w)?;
            language_tag.encode(w)
        })
    }

    /// Starts opening a channel. The channel is usable once the peer
    /// confirms it.
    pub fn open_channel(
        &mut self,
        kind: ChannelType,
        sink: ChannelRef,
        window_size: u32,
        maximum_packet_size: u32,
    ) -> Result<ChannelId, Error> {
        let id = self.channels.next_id();
        self.write
            .push(kind.open_message(id, window_size, maximum_packet_size)?);
        debug!("opening {} channel {}", kind.name(), id);
        self.channels.insert(ChannelParams::new(
            id,
            kind,
            sink,
            window_size,
            maximum_packet_size,
        ));
        Ok(id)
    }

    /// Confirms a channel the peer opened, under an id obtained from
    /// `self.channels.next_id()`.
    pub async fn accept_channel(
        &mut self,
        id: ChannelId,
        open: OpenChannelMessage,
        sink: ChannelRef,
        window_size: u32,
        maximum_packet_size: u32,
    ) -> Result<(), Error> {
        self.write
            .push(open.confirm(id, window_size, maximum_packet_size)?);
        sink.window()
            .set(open.recipient_window_size, open.recipient_maximum_packet_size)
            .await;
        let mut params = ChannelParams::new(id, open.typ, sink, window_size, maximum_packet_size);
        params.confirm(
            open.recipient_channel,
            open.recipient_window_size,
            open.recipient_maximum_packet_size,
        );
        debug!("accepted {} channel {}", params.kind.name(), id);
        self.channels.insert(params);
        Ok(())
    }

    pub fn reject_channel(
        &mut self,
        open: &OpenChannelMessage,
        reason: ChannelOpenFailure,
        description: &str,
    ) -> Result<(), Error> {
        debug!("refusing {} channel: {}", open.typ.name(), description);
        self.write.push(open.fail(reason, description)?);
        Ok(())
    }

    /// Handles a message from a [`crate::Channel`] or a handle.
    pub fn channel_msg(&mut self, id: ChannelId, msg: ChannelMsg) -> Result<(), Error> {
        let Some(params) = self.channels.get_mut(&id) else {
            debug!("message for closed channel {}: {:?}", id, msg);
            return Ok(());
        };
        match msg {
            ChannelMsg::Data { data } => params.data(&mut self.write, None, data)?,
            ChannelMsg::ExtendedData { data, ext } => {
                params.data(&mut self.write, Some(ext), data)?
            }
            ChannelMsg::Eof => params.eof(&mut self.write)?,
            ChannelMsg::Close => params.close(&mut self.write)?,
            ChannelMsg::Request { request, reply } => {
                let want_reply = reply.is_some();
                if let Some(reply) = reply {
                    params.awaiting.push(reply);
                }
                params.request(&mut self.write, request, want_reply)?
            }
            ChannelMsg::ExitStatus { exit_status } => params.request(
                &mut self.write,
                ChannelRequest::ExitStatus(exit_status),
                false,
            )?,
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => params.request(
                &mut self.write,
                ChannelRequest::ExitSignal {
                    signal: signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                },
                false,
            )?,
            msg => warn!("channel {}: cannot send {:?}", id, msg),
        }
        Ok(())
    }

    /// Data from a handler's session, sent without waiting for the
    /// window. [`CommonSession::settle_windows`] charges it to the
    /// channel's writers.
    pub fn unreserved_data(&mut self, id: ChannelId, ext: Option<u32>, data: Bytes) -> Result<(), Error> {
        let Some(params) = self.channels.get_mut(&id) else {
            debug!("data for closed channel {}", id);
            return Ok(());
        };
        params.unreserved_data(&mut self.write, ext, data)
    }

    /// Takes the data sent through [`CommonSession::unreserved_data`] out
    /// of the windows the channel writers reserve from.
    pub async fn settle_windows(&mut self) {
        for params in self.channels.values_mut() {
            if params.unreserved > 0 {
                let n = std::mem::take(&mut params.unreserved);
                params.sink.window().take(n).await;
            }
        }
    }

    /// Drops the channel once close was both sent and received.
    pub async fn remove_if_closed(&mut self, id: ChannelId) {
        let closed = self
            .channels
            .get(&id)
            .is_some_and(|c| c.is_closed() && !c.has_pending());
        if closed {
            if let Some(params) = self.channels.remove(&id) {
                params.sink.window().close().await;
                debug!("channel {} removed, {} left", id, self.channels.len());
            }
        }
    }

    pub async fn window_adjust(&mut self, r: &mut &[u8]) -> Result<Option<(ChannelId, u32)>, Error> {
        let id = ChannelId::decode(r)?;
        let amount = u32::decode(r)?;
        let Some(params) = self.channels.get_mut(&id) else {
            warn!("window adjust for unknown channel {}", id);
            return Ok(None);
        };
        let new_size = params.window_adjusted(amount);
        params.sink.window().grow(amount).await;
        params.flush_pending(&mut self.write)?;
        trace!("channel {}: window {}", id, new_size);
        params.sink.deliver(ChannelMsg::WindowAdjusted { new_size });
        self.remove_if_closed(id).await;
        Ok(Some((id, new_size)))
    }

    /// `CHANNEL_DATA` or `CHANNEL_EXTENDED_DATA`. Returns the data to
    /// pass on to the handler, if any.
    pub fn data(
        &mut self,
        r: &mut &[u8],
        extended: bool,
    ) -> Result<Option<(ChannelId, Option<u32>, Bytes)>, Error> {
        let id = ChannelId::decode(r)?;
        let ext = if extended {
            Some(u32::decode(r)?)
        } else {
            None
        };
        let data = Bytes::from(Vec::<u8>::decode(r)?);
        let Some(params) = self.channels.get_mut(&id) else {
            warn!("data for unknown channel {}", id);
            return Ok(None);
        };
        if data.len() > params.local_maximum_packet_size as usize {
            warn!(
                "channel {}: {} bytes exceed the maximum packet size",
                id,
                data.len()
            );
        }
        params.consume_local_window(&mut self.write, data.len())?;
        if params.received_eof || params.received_close {
            warn!("channel {}: data after EOF ignored", id);
            return Ok(None);
        }
        if params.exited {
            debug!("channel {}: data after exit ignored", id);
            return Ok(None);
        }
        params.sink.deliver(match ext {
            None => ChannelMsg::Data { data: data.clone() },
            Some(ext) => ChannelMsg::ExtendedData {
                data: data.clone(),
                ext,
            },
        });
        Ok(Some((id, ext, data)))
    }

    pub fn eof(&mut self, r: &mut &[u8]) -> Result<Option<ChannelId>, Error> {
        let id = ChannelId::decode(r)?;
        let Some(params) = self.channels.get_mut(&id) else {
            warn!("EOF for unknown channel {}", id);
            return Ok(None);
        };
        if params.received_eof {
            debug!("channel {}: duplicate EOF", id);
            return Ok(None);
        }
        params.received_eof = true;
        params.sink.deliver(ChannelMsg::Eof);
        Ok(Some(id))
    }

    /// `CHANNEL_CLOSE`: answers it if needed and forgets the channel.
    pub async fn close(&mut self, r: &mut &[u8]) -> Result<Option<ChannelId>, Error> {
        let id = ChannelId::decode(r)?;
        let Some(params) = self.channels.get_mut(&id) else {
            warn!("close for unknown channel {}", id);
            return Ok(None);
        };
        params.received_close = true;
        params.close_now(&mut self.write)?;
        params.sink.deliver(ChannelMsg::Close);
        self.remove_if_closed(id).await;
        Ok(Some(id))
    }

    pub async fn open_confirmation(&mut self, r: &mut &[u8]) -> Result<Option<ChannelId>, Error> {
        let msg = ChannelOpenConfirmation::decode(r)?;
        let id = msg.recipient_channel;
        let Some(params) = self.channels.get_mut(&id) else {
            warn!("confirmation for unknown channel {}", id);
            return Ok(None);
        };
        if params.confirmed {
            warn!("channel {} confirmed twice", id);
            return Ok(None);
        }
        params.confirm(
            msg.sender_channel,
            msg.initial_window_size,
            msg.maximum_packet_size,
        );
        params
            .sink
            .window()
            .set(msg.initial_window_size, msg.maximum_packet_size)
            .await;
        params.sink.deliver(ChannelMsg::Open {
            id,
            max_packet_size: msg.maximum_packet_size,
            window_size: msg.initial_window_size,
        });
        params.flush_pending(&mut self.write)?;
        Ok(Some(id))
    }

    /// A refused open: the channel never existed.
    pub fn open_failure(&mut self, r: &mut &[u8]) -> Result<Option<ChannelOpenRefusal>, Error> {
        let refusal = ChannelOpenRefusal::decode(r)?;
        match self.channels.get(&refusal.recipient_channel) {
            Some(params) if !params.confirmed => {}
            _ => {
                warn!("open failure for unknown channel {}", refusal.recipient_channel);
                return Ok(None);
            }
        }
        if let Some(params) = self.channels.remove(&refusal.recipient_channel) {
            params.sink.deliver(ChannelMsg::OpenFailure {
                reason: refusal.reason,
                description: refusal.description.clone(),
            });
        }
        Ok(Some(refusal))
    }

    /// `CHANNEL_SUCCESS` or `CHANNEL_FAILURE`.
    pub fn reply(&mut self, r: &mut &[u8], success: bool) -> Result<Option<ChannelId>, Error> {
        let id = ChannelId::decode(r)?;
        let Some(params) = self.channels.get_mut(&id) else {
            warn!("reply for unknown channel {}", id);
            return Ok(None);
        };
        if !params.awaiting.resolve(success) {
            warn!("channel {}: unexpected reply", id);
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Parses a `CHANNEL_REQUEST` and reserves its reply slot.
    pub fn channel_request(&mut self, r: &mut &[u8]) -> Result<Option<IncomingRequest>, Error> {
        let id = ChannelId::decode(r)?;
        let name = String::decode(r)?;
        let want_reply = bool::decode(r)?;
        let Some(params) = self.channels.get_mut(&id) else {
            warn!("{} request for unknown channel {}", name, id);
            return Ok(None);
        };
        let token = want_reply.then(|| params.replies.push());
        let request = match ChannelRequest::decode(&name, r) {
            Ok(request) => request,
            Err(e) => {
                warn!("channel {}: malformed {} request: {:?}", id, name, e);
                self.answer(id, token, false)?;
                return Ok(None);
            }
        };
        trace!("channel {}: {} request, want_reply = {}", id, name, want_reply);
        Ok(Some(IncomingRequest { id, request, token }))
    }

    /// Where an incoming request goes, given the state of its channel.
    pub fn route(&self, id: ChannelId, request: &ChannelRequest) -> Route {
        match self.channels.get(&id).map(|c| c.router.as_ref()) {
            Some(Some(router)) => router.admit(request, self.peer),
            Some(None) => Route::Refuse("not a session channel"),
            None => Route::Ignore,
        }
    }

    /// Records an accepted request in the channel's session state.
    pub fn accepted(&mut self, id: ChannelId, request: &ChannelRequest) {
        if let Some(params) = self.channels.get_mut(&id) {
            if matches!(
                request,
                ChannelRequest::ExitStatus(_) | ChannelRequest::ExitSignal { .. }
            ) {
                params.exited = true;
            }
            if let Some(router) = params.router.as_mut() {
                router.accepted(request)
            }
        }
    }

    /// Resolves the reply slot of a request and sends every reply that
    /// became ready, in order.
    pub fn answer(&mut self, id: ChannelId, token: Option<ReplyToken>, accepted: bool) -> Result<(), Error> {
        let Some(token) = token else {
            return Ok(());
        };
        let Some(params) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        params.replies.resolve(token, accepted);
        let recipient = params.recipient_channel;
        for accepted in params.replies.ready() {
            self.write.packet(|w| {
                if accepted {
                    msg::CHANNEL_SUCCESS.encode(w)?;
                } else {
                    msg::CHANNEL_FAILURE.encode(w)?;
                }
                recipient.encode(w)
            })?;
        }
        Ok(())
    }

    /// Answers a `GLOBAL_REQUEST`. None are supported.
    pub fn global_request(&mut self, r: &mut &[u8]) -> Result<(), Error> {
        let name = String::decode(r)?;
        let want_reply = bool::decode(r)?;
        debug!("global request {:?} refused", name);
        if want_reply {
            self.write.packet(|w| msg::REQUEST_FAILURE.encode(w))?;
        }
        Ok(())
    }

    /// Forgets every channel. Suspended writers are woken with an error
    /// and every pending reply or open fails with
    /// [`Error::ConnectionClosed`].
    pub async fn teardown(&mut self) {
        let channels: Vec<ChannelParams> = self.channels.drain().collect();
        for params in channels {
            params.sink.window().close().await;
        }
    }
}

/// Decodes a `DISCONNECT` message.
pub(crate) fn received_disconnect(r: &mut &[u8]) -> DisconnectReason {
    let reason = u32::decode(r).ok().and_then(|r| Disconnect::try_from(r).ok());
    let description = String::decode(r).unwrap_or_default();
    debug!("peer disconnected: {:?} {:?}", reason, description);
    DisconnectReason::ReceivedDisconnect {
        reason,
        description,
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::sync::oneshot;

    use super::*;

    fn confirmed_session() -> (CommonSession<()>, ChannelId, tokio::sync::mpsc::UnboundedReceiver<ChannelMsg>) {
        let mut session = CommonSession::new((), vec![], Peer::Client);
        let (sender, receiver) = unbounded_channel();
        let open = OpenChannelMessage {
            typ: ChannelType::Session,
            recipient_channel: 40,
            recipient_window_size: 100,
            recipient_maximum_packet_size: 50,
        };
        let id = session.channels.next_id();
        futures::executor::block_on(session.accept_channel(
            id,
            open,
            ChannelRef::new(sender),
            1000,
            100,
        ))
        .unwrap();
        session.write.take();
        (session, id, receiver)
    }

    fn request_payload(id: ChannelId, request: &ChannelRequest, want_reply: bool) -> Vec<u8> {
        let payload = request.message(id.0, want_reply).unwrap();
        payload.get(1..).unwrap().to_vec()
    }

    fn message_types(session: &mut CommonSession<()>) -> Vec<u8> {
        session
            .write
            .take()
            .iter()
            .filter_map(|p| p.first().copied())
            .collect()
    }

    #[test]
    fn replies_follow_request_order() {
        let (mut session, id, _receiver) = confirmed_session();
        let env = ChannelRequest::Env {
            name: "A".into(),
            value: "1".into(),
        };
        let first = session
            .channel_request(&mut &request_payload(id, &env, true)[..])
            .unwrap()
            .unwrap();
        let second = session
            .channel_request(&mut &request_payload(id, &ChannelRequest::Shell, true)[..])
            .unwrap()
            .unwrap();
        session.answer(id, second.token, true).unwrap();
        assert!(message_types(&mut session).is_empty());
        session.answer(id, first.token, false).unwrap();
        assert_eq!(
            message_types(&mut session),
            vec![msg::CHANNEL_FAILURE, msg::CHANNEL_SUCCESS]
        );
        // a second decision for the same request is ignored
        session.answer(id, first.token, true).unwrap();
        assert!(message_types(&mut session).is_empty());
    }

    #[test]
    fn malformed_requests_are_refused() {
        let (mut session, id, _receiver) = confirmed_session();
        let mut payload = Vec::new();
        id.encode(&mut payload).unwrap();
        "exec".encode(&mut payload).unwrap();
        true.encode(&mut payload).unwrap();
        assert!(session
            .channel_request(&mut &payload[..])
            .unwrap()
            .is_none());
        assert_eq!(message_types(&mut session), vec![msg::CHANNEL_FAILURE]);

        let mut payload = Vec::new();
        id.encode(&mut payload).unwrap();
        "exec".encode(&mut payload).unwrap();
        true.encode(&mut payload).unwrap();
        [b'l', b's', 0xc3].as_slice().encode(&mut payload).unwrap();
        assert!(session
            .channel_request(&mut &payload[..])
            .unwrap()
            .is_none());
        assert_eq!(message_types(&mut session), vec![msg::CHANNEL_FAILURE]);
    }

    #[tokio::test]
    async fn close_is_answered_and_channel_forgotten() {
        let (mut session, id, mut receiver) = confirmed_session();
        let (reply, answer) = oneshot::channel();
        session
            .channel_msg(
                id,
                ChannelMsg::Request {
                    request: ChannelRequest::Shell,
                    reply: Some(reply),
                },
            )
            .unwrap();
        assert_eq!(message_types(&mut session), vec![msg::CHANNEL_REQUEST]);

        let mut payload = Vec::new();
        id.encode(&mut payload).unwrap();
        assert_eq!(session.close(&mut &payload[..]).await.unwrap(), Some(id));
        assert_eq!(message_types(&mut session), vec![msg::CHANNEL_CLOSE]);
        assert!(session.channels.get(&id).is_none());
        assert!(matches!(receiver.recv().await, Some(ChannelMsg::Close)));
        // The reply can no longer come.
        assert!(answer.await.is_err());
        assert!(session.close(&mut &payload[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn data_is_delivered_and_window_replenished() {
        let (mut session, id, mut receiver) = confirmed_session();
        let mut payload = Vec::new();
        id.encode(&mut payload).unwrap();
        vec![1u8; 600].encode(&mut payload).unwrap();
        let (got, ext, data) = session.data(&mut &payload[..], false).unwrap().unwrap();
        assert_eq!((got, ext, data.len()), (id, None, 600));
        assert!(matches!(receiver.recv().await, Some(ChannelMsg::Data { .. })));
        assert_eq!(message_types(&mut session), vec![msg::CHANNEL_WINDOW_ADJUST]);

        session.accepted(id, &ChannelRequest::ExitStatus(0));
        assert!(session.data(&mut &payload[..], false).unwrap().is_none());
    }

    #[test]
    fn refused_open_leaves_no_channel() {
        let mut session = CommonSession::new((), vec![], Peer::Client);
        let open = OpenChannelMessage {
            typ: ChannelType::Other {
                typ: "direct-tcpip".into(),
            },
            recipient_channel: 7,
            recipient_window_size: 100,
            recipient_maximum_packet_size: 50,
        };
        let id = session.channels.next_id();
        session
            .reject_channel(&open, ChannelOpenFailure::AdministrativelyProhibited, "no")
            .unwrap();
        assert_eq!(message_types(&mut session), vec![msg::CHANNEL_OPEN_FAILURE]);
        assert!(session.channels.get(&id).is_none());
        assert_eq!(session.channels.len(), 0);
    }

    #[tokio::test]
    async fn handler_data_holds_back_channel_writers() {
        let (mut session, id, _receiver) = confirmed_session();
        let window = session.channels.get(&id).unwrap().sink.window().clone();
        session
            .unreserved_data(id, None, Bytes::from(vec![0; 150]))
            .unwrap();
        session.settle_windows().await;
        assert_eq!(window.writable().await, 0);
        // Two full packets went out, 50 bytes wait for the window.
        assert_eq!(
            message_types(&mut session),
            vec![msg::CHANNEL_DATA, msg::CHANNEL_DATA]
        );

        let w = window.clone();
        let writer = tokio::spawn(async move { w.reserve(10).await });
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        let mut payload = Vec::new();
        id.encode(&mut payload).unwrap();
        60u32.encode(&mut payload).unwrap();
        session.window_adjust(&mut &payload[..]).await.unwrap();
        assert_eq!(message_types(&mut session), vec![msg::CHANNEL_DATA]);
        assert_eq!(writer.await.unwrap().unwrap(), 10);
        assert_eq!(session.channels.get(&id).unwrap().remote_window, 10);
    }

    #[tokio::test]
    async fn teardown_wakes_writers() {
        let (mut session, id, mut receiver) = confirmed_session();
        let window = session.channels.get(&id).unwrap().sink.window().clone();
        session.teardown().await;
        assert!(matches!(window.reserve(1).await, Err(Error::ConnectionClosed)));
        assert!(receiver.recv().await.is_none());
    }
}
