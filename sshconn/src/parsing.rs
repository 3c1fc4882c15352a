use ssh_encoding::{Decode, Encode};

use crate::{msg, ChannelId, ChannelOpenFailure, Error};

/// A `CHANNEL_OPEN` received from the peer.
#[derive(Debug)]
pub(crate) struct OpenChannelMessage {
    pub typ: ChannelType,
    pub recipient_channel: u32,
    pub recipient_window_size: u32,
    pub recipient_maximum_packet_size: u32,
}

impl OpenChannelMessage {
    pub fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        // https://tools.ietf.org/html/rfc4254#section-5.1
        let typ = String::decode(r)?;
        let sender = u32::decode(r)?;
        let window = u32::decode(r)?;
        let maxpacket = u32::decode(r)?;

        let typ = match typ.as_str() {
            "session" => ChannelType::Session,
            "x11" => {
                let originator_address = String::decode(r)?;
                let originator_port = u32::decode(r)?;
                ChannelType::X11 {
                    originator_address,
                    originator_port,
                }
            }
            "auth-agent@openssh.com" => ChannelType::AgentForward,
            _ => ChannelType::Other { typ },
        };

        Ok(Self {
            typ,
            recipient_channel: sender,
            recipient_window_size: window,
            recipient_maximum_packet_size: maxpacket,
        })
    }

    /// Encodes a confirmation that this channel was opened.
    pub fn confirm(
        &self,
        sender_channel: ChannelId,
        window_size: u32,
        packet_size: u32,
    ) -> Result<Vec<u8>, Error> {
        let mut w = Vec::new();
        msg::CHANNEL_OPEN_CONFIRMATION.encode(&mut w)?;
        self.recipient_channel.encode(&mut w)?; // remote channel number.
        sender_channel.encode(&mut w)?; // our channel number.
        window_size.encode(&mut w)?;
        packet_size.encode(&mut w)?;
        Ok(w)
    }

    /// Encodes a refusal.
    pub fn fail(&self, reason: ChannelOpenFailure, message: &str) -> Result<Vec<u8>, Error> {
        let mut w = Vec::new();
        msg::CHANNEL_OPEN_FAILURE.encode(&mut w)?;
        self.recipient_channel.encode(&mut w)?;
        (reason as u32).encode(&mut w)?;
        message.encode(&mut w)?;
        "en".encode(&mut w)?;
        Ok(w)
    }
}

/// The type of a channel, with the type-specific data of its
/// `CHANNEL_OPEN` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    Session,
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    AgentForward,
    /// Any other type, port forwardings included. Such channels can
    /// carry data, but none of their requests are interpreted.
    Other {
        typ: String,
    },
}

impl ChannelType {
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::X11 { .. } => "x11",
            ChannelType::AgentForward => "auth-agent@openssh.com",
            ChannelType::Other { typ } => typ,
        }
    }

    /// Encodes a `CHANNEL_OPEN` for a channel of this type.
    pub(crate) fn open_message(
        &self,
        sender_channel: ChannelId,
        window_size: u32,
        maximum_packet_size: u32,
    ) -> Result<Vec<u8>, Error> {
        let mut w = Vec::new();
        msg::CHANNEL_OPEN.encode(&mut w)?;
        self.name().encode(&mut w)?;
        sender_channel.encode(&mut w)?;
        window_size.encode(&mut w)?;
        maximum_packet_size.encode(&mut w)?;
        if let ChannelType::X11 {
            originator_address,
            originator_port,
        } = self
        {
            originator_address.encode(&mut w)?;
            originator_port.encode(&mut w)?;
        }
        Ok(w)
    }
}

/// `CHANNEL_OPEN_CONFIRMATION`, after the message number.
#[derive(Debug)]
pub(crate) struct ChannelOpenConfirmation {
    pub recipient_channel: ChannelId,
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

impl Decode for ChannelOpenConfirmation {
    type Error = ssh_encoding::Error;

    fn decode(r: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        Ok(Self {
            recipient_channel: ChannelId::decode(r)?,
            sender_channel: u32::decode(r)?,
            initial_window_size: u32::decode(r)?,
            maximum_packet_size: u32::decode(r)?,
        })
    }
}

/// `CHANNEL_OPEN_FAILURE`, after the message number.
#[derive(Debug)]
pub(crate) struct ChannelOpenRefusal {
    pub recipient_channel: ChannelId,
    pub reason: ChannelOpenFailure,
    pub description: String,
}

impl Decode for ChannelOpenRefusal {
    type Error = ssh_encoding::Error;

    fn decode(r: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        let recipient_channel = ChannelId::decode(r)?;
        let reason = ChannelOpenFailure::from_u32(u32::decode(r)?)
            .unwrap_or(ChannelOpenFailure::Unknown);
        let description = String::decode(r)?;
        // The language tag is optional in practice.
        Ok(Self {
            recipient_channel,
            reason,
            description,
        })
    }
}
