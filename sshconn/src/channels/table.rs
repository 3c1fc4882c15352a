use std::collections::{HashMap, VecDeque};
use std::num::Wrapping;

use bytes::Bytes;
use log::{debug, trace, warn};
use ssh_encoding::Encode;

use super::ChannelRef;
use crate::parsing::ChannelType;
use crate::request::{AwaitingReplies, ChannelRequest, ReplyQueue, SessionRouter};
use crate::session::PacketWriter;
use crate::{msg, ChannelId, Error};

/// Outgoing items held back until the peer's window allows the data
/// in front of them to leave.
#[derive(Debug)]
enum Pending {
    Data {
        ext: Option<u32>,
        data: Bytes,
        from: usize,
    },
    Request {
        request: ChannelRequest,
        want_reply: bool,
    },
    Eof,
    Close,
}

/// The parameters of a channel.
///
/// `local_*` values describe what we advertised (how much the peer may
/// still send us), `remote_*` values what the peer advertised (how much
/// we may still send).
#[derive(Debug)]
pub(crate) struct ChannelParams {
    pub id: ChannelId,
    pub kind: ChannelType,
    /// The peer's number for this channel.
    pub recipient_channel: u32,
    pub local_window: u32,
    pub local_window_target: u32,
    pub local_maximum_packet_size: u32,
    pub remote_window: u32,
    pub remote_maximum_packet_size: u32,
    /// Has the other side confirmed the channel?
    pub confirmed: bool,
    pub sent_eof: bool,
    pub received_eof: bool,
    pub sent_close: bool,
    pub received_close: bool,
    /// An exit status or exit signal was received.
    pub exited: bool,
    /// Our requests waiting for `CHANNEL_SUCCESS`/`CHANNEL_FAILURE`.
    pub awaiting: AwaitingReplies,
    /// Replies we owe to the peer's requests.
    pub replies: ReplyQueue,
    /// Session channels only.
    pub router: Option<SessionRouter>,
    pub sink: ChannelRef,
    /// Bytes accepted through [`ChannelParams::unreserved_data`] and not
    /// yet charged to the shared window.
    pub unreserved: usize,
    pending: VecDeque<Pending>,
}

impl ChannelParams {
    pub fn new(
        id: ChannelId,
        kind: ChannelType,
        sink: ChannelRef,
        window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        let router = matches!(kind, ChannelType::Session).then(SessionRouter::default);
        ChannelParams {
            id,
            kind,
            recipient_channel: 0,
            local_window: window_size,
            local_window_target: window_size,
            local_maximum_packet_size: maximum_packet_size,
            remote_window: 0,
            remote_maximum_packet_size: 0,
            confirmed: false,
            sent_eof: false,
            received_eof: false,
            sent_close: false,
            received_close: false,
            exited: false,
            awaiting: AwaitingReplies::default(),
            replies: ReplyQueue::default(),
            router,
            sink,
            unreserved: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn confirm(&mut self, recipient_channel: u32, window: u32, maximum_packet_size: u32) {
        self.recipient_channel = recipient_channel;
        self.remote_window = window;
        self.remote_maximum_packet_size = maximum_packet_size;
        self.confirmed = true;
    }

    /// Both sides sent `CHANNEL_CLOSE`, the entry can go.
    pub fn is_closed(&self) -> bool {
        self.sent_close && self.received_close
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Sends as much of `data` as the window allows and queues the rest.
    pub fn data(&mut self, write: &mut PacketWriter, ext: Option<u32>, data: Bytes) -> Result<(), Error> {
        if self.sent_eof || self.sent_close {
            warn!("channel {}: data after EOF dropped", self.id);
            return Ok(());
        }
        if !self.confirmed || !self.pending.is_empty() {
            self.pending.push_back(Pending::Data { ext, data, from: 0 });
            return Ok(());
        }
        let from = self.write_data(write, ext, &data, 0)?;
        if from < data.len() {
            trace!("channel {}: queueing {} bytes", self.id, data.len() - from);
            self.pending.push_back(Pending::Data { ext, data, from });
        }
        Ok(())
    }

    /// Like [`ChannelParams::data`], for writers that did not reserve
    /// room in the shared window.
    pub fn unreserved_data(
        &mut self,
        write: &mut PacketWriter,
        ext: Option<u32>,
        data: Bytes,
    ) -> Result<(), Error> {
        if !self.sent_eof && !self.sent_close {
            self.unreserved += data.len();
        }
        self.data(write, ext, data)
    }

    /// Sends `data[from..]` in packets bounded by the remote window and
    /// maximum packet size. Returns the offset of the first unsent byte.
    fn write_data(
        &mut self,
        write: &mut PacketWriter,
        ext: Option<u32>,
        data: &[u8],
        mut from: usize,
    ) -> Result<usize, Error> {
        while from < data.len() {
            let n = (data.len() - from)
                .min(self.remote_window as usize)
                .min(self.remote_maximum_packet_size as usize);
            if n == 0 {
                break;
            }
            let chunk = data.get(from..from + n).ok_or(Error::Inconsistent)?;
            let recipient = self.recipient_channel;
            write.packet(|w| {
                match ext {
                    None => {
                        msg::CHANNEL_DATA.encode(w)?;
                        recipient.encode(w)?;
                    }
                    Some(ext) => {
                        msg::CHANNEL_EXTENDED_DATA.encode(w)?;
                        recipient.encode(w)?;
                        ext.encode(w)?;
                    }
                }
                chunk.encode(w)
            })?;
            self.remote_window -= n as u32;
            from += n;
        }
        Ok(from)
    }

    /// Sends a request, after any queued data.
    pub fn request(
        &mut self,
        write: &mut PacketWriter,
        request: ChannelRequest,
        want_reply: bool,
    ) -> Result<(), Error> {
        if self.sent_close {
            debug!("channel {}: {} after close dropped", self.id, request.name());
            return Ok(());
        }
        if self.confirmed && self.pending.is_empty() {
            write.push(request.message(self.recipient_channel, want_reply)?)
        } else {
            self.pending.push_back(Pending::Request {
                request,
                want_reply,
            })
        }
        Ok(())
    }

    pub fn eof(&mut self, write: &mut PacketWriter) -> Result<(), Error> {
        if self.sent_eof || self.sent_close {
            return Ok(());
        }
        self.sent_eof = true;
        if self.confirmed && self.pending.is_empty() {
            self.write_eof(write)
        } else {
            self.pending.push_back(Pending::Eof);
            Ok(())
        }
    }

    pub fn close(&mut self, write: &mut PacketWriter) -> Result<(), Error> {
        if self.sent_close {
            return Ok(());
        }
        self.sent_close = true;
        if self.confirmed && self.pending.is_empty() {
            self.write_close(write)
        } else {
            self.pending.push_back(Pending::Close);
            Ok(())
        }
    }

    /// Answers the peer's `CHANNEL_CLOSE`: whatever is still queued can
    /// no longer be delivered.
    pub fn close_now(&mut self, write: &mut PacketWriter) -> Result<(), Error> {
        let dropped = self.pending.len();
        if dropped > 0 {
            debug!("channel {}: {} queued items dropped on close", self.id, dropped);
        }
        self.pending.clear();
        if !self.sent_close {
            self.sent_close = true;
            self.write_close(write)?;
        }
        Ok(())
    }

    fn write_eof(&self, write: &mut PacketWriter) -> Result<(), Error> {
        let recipient = self.recipient_channel;
        write.packet(|w| {
            msg::CHANNEL_EOF.encode(w)?;
            recipient.encode(w)
        })
    }

    fn write_close(&self, write: &mut PacketWriter) -> Result<(), Error> {
        let recipient = self.recipient_channel;
        write.packet(|w| {
            msg::CHANNEL_CLOSE.encode(w)?;
            recipient.encode(w)
        })
    }

    /// Sends the queue in order, as far as the window allows. Returns
    /// the number of data bytes written.
    pub fn flush_pending(&mut self, write: &mut PacketWriter) -> Result<usize, Error> {
        let mut written = 0;
        if !self.confirmed {
            return Ok(0);
        }
        while let Some(item) = self.pending.pop_front() {
            match item {
                Pending::Data { ext, data, from } => {
                    let sent = self.write_data(write, ext, &data, from)?;
                    written += sent - from;
                    if sent < data.len() {
                        self.pending.push_front(Pending::Data {
                            ext,
                            data,
                            from: sent,
                        });
                        break;
                    }
                }
                Pending::Request {
                    request,
                    want_reply,
                } => write.push(request.message(self.recipient_channel, want_reply)?),
                Pending::Eof => self.write_eof(write)?,
                Pending::Close => self.write_close(write)?,
            }
        }
        Ok(written)
    }

    pub fn window_adjusted(&mut self, amount: u32) -> u32 {
        self.remote_window = self.remote_window.saturating_add(amount);
        self.remote_window
    }

    /// Accounts for `len` received bytes, and grants the peer a new
    /// window once less than half of it is left.
    pub fn consume_local_window(&mut self, write: &mut PacketWriter, len: usize) -> Result<(), Error> {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        if len > self.local_window {
            warn!(
                "channel {}: peer sent {} bytes with a window of {}",
                self.id, len, self.local_window
            );
            self.local_window = 0;
        } else {
            self.local_window -= len;
        }
        if self.local_window < self.local_window_target / 2 && !self.received_eof {
            let grant = self.local_window_target - self.local_window;
            trace!("channel {}: window adjust by {}", self.id, grant);
            let recipient = self.recipient_channel;
            write.packet(|w| {
                msg::CHANNEL_WINDOW_ADJUST.encode(w)?;
                recipient.encode(w)?;
                grant.encode(w)
            })?;
            self.local_window = self.local_window_target;
        }
        Ok(())
    }
}

/// Channels of a connection, by local id.
#[derive(Debug)]
pub(crate) struct ChannelTable {
    channels: HashMap<ChannelId, ChannelParams>,
    next_id: Wrapping<u32>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        ChannelTable {
            channels: HashMap::new(),
            next_id: Wrapping(0),
        }
    }
}

impl ChannelTable {
    /// The next free local id. Ids increase and wrap, skipping the ones
    /// still in use.
    pub fn next_id(&mut self) -> ChannelId {
        loop {
            let id = ChannelId(self.next_id.0);
            self.next_id += Wrapping(1);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, params: ChannelParams) {
        self.channels.insert(params.id, params);
    }

    pub fn get(&self, id: &ChannelId) -> Option<&ChannelParams> {
        self.channels.get(id)
    }

    pub fn get_mut(&mut self, id: &ChannelId) -> Option<&mut ChannelParams> {
        self.channels.get_mut(id)
    }

    pub fn remove(&mut self, id: &ChannelId) -> Option<ChannelParams> {
        self.channels.remove(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut ChannelParams> + '_ {
        self.channels.values_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ChannelParams> + '_ {
        self.channels.drain().map(|(_, c)| c)
    }
}
