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

use log::{debug, trace, warn};
use ssh_encoding::Decode;
use tokio::sync::mpsc::unbounded_channel;

use super::{Handler, Session};
use crate::channels::ChannelRef;
use crate::parsing::OpenChannelMessage;
use crate::request::Route;
use crate::session::{received_disconnect, IncomingRequest};
use crate::{msg, Channel, ChannelMsg, ChannelOpenFailure, ChannelRequest, DisconnectReason};

/// Handles one message from the server. Returns a reason when the
/// server ended the connection.
pub(super) async fn reply<H: Handler>(
    session: &mut Session,
    handler: &mut H,
    buf: &[u8],
) -> Result<Option<DisconnectReason>, H::Error> {
    let Some((&typ, mut r)) = buf.split_first() else {
        warn!("empty message");
        return Ok(None);
    };
    trace!("received {}", msg::name(typ));
    let r = &mut r;
    match typ {
        msg::DISCONNECT => return Ok(Some(received_disconnect(r))),
        msg::IGNORE | msg::DEBUG | msg::UNIMPLEMENTED => {}
        msg::SERVICE_ACCEPT => session.service_accepted(r)?,
        msg::USERAUTH_BANNER => {
            let banner = String::decode(r).map_err(crate::Error::from)?;
            handler.auth_banner(&banner, session).await?
        }
        msg::USERAUTH_SUCCESS
        | msg::USERAUTH_FAILURE
        | msg::USERAUTH_INFO_REQUEST_OR_USERAUTH_PK_OK => session.auth_reply(typ, r)?,

        msg::CHANNEL_OPEN_CONFIRMATION => {
            if let Some(id) = session.common.open_confirmation(r).await? {
                let (max_packet_size, window_size) = session
                    .common
                    .channels
                    .get(&id)
                    .map(|c| (c.remote_maximum_packet_size, c.remote_window))
                    .unwrap_or_default();
                handler
                    .channel_open_confirmation(id, max_packet_size, window_size, session)
                    .await?
            }
        }
        msg::CHANNEL_OPEN_FAILURE => {
            if let Some(refusal) = session.common.open_failure(r)? {
                handler
                    .channel_open_failure(
                        refusal.recipient_channel,
                        &refusal.reason,
                        &refusal.description,
                        session,
                    )
                    .await?
            }
        }
        msg::CHANNEL_DATA => {
            if let Some((id, _, data)) = session.common.data(r, false)? {
                handler.data(id, &data, session).await?
            }
        }
        msg::CHANNEL_EXTENDED_DATA => {
            if let Some((id, Some(ext), data)) = session.common.data(r, true)? {
                handler.extended_data(id, ext, &data, session).await?
            }
        }
        msg::CHANNEL_EOF => {
            if let Some(id) = session.common.eof(r)? {
                handler.channel_eof(id, session).await?
            }
        }
        msg::CHANNEL_CLOSE => {
            if let Some(id) = session.common.close(r).await? {
                handler.channel_close(id, session).await?
            }
        }
        msg::CHANNEL_WINDOW_ADJUST => {
            if let Some((id, new_size)) = session.common.window_adjust(r).await? {
                handler.window_adjusted(id, new_size, session).await?
            }
        }
        msg::CHANNEL_SUCCESS => {
            session.common.reply(r, true)?;
        }
        msg::CHANNEL_FAILURE => {
            session.common.reply(r, false)?;
        }
        msg::CHANNEL_REQUEST => {
            if let Some(request) = session.common.channel_request(r)? {
                channel_request(session, handler, request).await?
            }
        }
        msg::CHANNEL_OPEN => channel_open(session, handler, r).await?,
        msg::GLOBAL_REQUEST => session.common.global_request(r)?,
        msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => {
            warn!("reply to a global request we never sent")
        }
        _ => warn!("unexpected message {} ({})", typ, msg::name(typ)),
    }
    Ok(None)
}

async fn channel_request<H: Handler>(
    session: &mut Session,
    handler: &mut H,
    incoming: IncomingRequest,
) -> Result<(), H::Error> {
    let IncomingRequest { id, request, token } = incoming;
    match session.common.route(id, &request) {
        Route::Ignore => {
            debug!("channel {}: {} ignored", id, request.name());
            session.common.answer(id, token, false)?;
        }
        Route::Refuse(why) => {
            debug!("channel {}: {} refused: {}", id, request.name(), why);
            session.common.answer(id, token, false)?;
        }
        Route::Dispatch => {
            session.common.accepted(id, &request);
            let deliver = |session: &Session, msg: ChannelMsg| {
                if let Some(channel) = session.common.channels.get(&id) {
                    channel.sink.deliver(msg)
                }
            };
            match request {
                ChannelRequest::ExitStatus(exit_status) => {
                    deliver(session, ChannelMsg::ExitStatus { exit_status });
                    handler.exit_status(id, exit_status, session).await?
                }
                ChannelRequest::ExitSignal {
                    signal,
                    core_dumped,
                    error_message,
                    lang_tag,
                } => {
                    deliver(
                        session,
                        ChannelMsg::ExitSignal {
                            signal_name: signal.clone(),
                            core_dumped,
                            error_message: error_message.clone(),
                            lang_tag: lang_tag.clone(),
                        },
                    );
                    handler
                        .exit_signal(id, signal, core_dumped, &error_message, &lang_tag, session)
                        .await?
                }
                ChannelRequest::XonXoff { client_can_do } => {
                    deliver(
                        session,
                        ChannelMsg::Request {
                            request: ChannelRequest::XonXoff { client_can_do },
                            reply: None,
                        },
                    );
                    handler.xon_xoff(id, client_can_do, session).await?
                }
                request => debug!("channel {}: nothing to do for {}", id, request.name()),
            }
            session.common.answer(id, token, true)?;
        }
    }
    Ok(())
}

/// A channel opened by the server, such as an X11 or agent forwarding.
async fn channel_open<H: Handler>(
    session: &mut Session,
    handler: &mut H,
    r: &mut &[u8],
) -> Result<(), H::Error> {
    let open = OpenChannelMessage::parse(r)?;
    debug!("server opens a {} channel", open.typ.name());
    let Some(sender) = session.channel_sender.upgrade() else {
        session.common.reject_channel(
            &open,
            ChannelOpenFailure::AdministrativelyProhibited,
            "client is shutting down",
        )?;
        return Ok(());
    };

    let (tx, rx) = unbounded_channel();
    let channel_ref = ChannelRef::new(tx);
    let id = session.common.channels.next_id();
    let channel = Channel::new(id, sender, rx, channel_ref.window().clone());
    let kind = open.typ.clone();
    if handler.server_channel_open(channel, &kind, session).await? {
        let window_size = session.common.config.window_size;
        let maximum_packet_size = session.common.config.maximum_packet_size;
        session
            .common
            .accept_channel(id, open, channel_ref, window_size, maximum_packet_size)
            .await?;
    } else {
        session.common.reject_channel(
            &open,
            ChannelOpenFailure::AdministrativelyProhibited,
            "channel refused",
        )?;
    }
    Ok(())
}
