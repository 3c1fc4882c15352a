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
use tokio::sync::mpsc::unbounded_channel;

use super::{auth, Handler, Session};
use crate::channels::ChannelRef;
use crate::parsing::{ChannelType, OpenChannelMessage};
use crate::request::Route;
use crate::session::{received_disconnect, IncomingRequest};
use crate::{msg, Channel, ChannelId, ChannelMsg, ChannelOpenFailure, ChannelRequest, Decision, DisconnectReason};

/// Handles one message from the client. Returns a reason when the
/// client ended the connection.
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
        msg::SERVICE_REQUEST => session.service_request(r)?,
        msg::USERAUTH_REQUEST => auth::userauth_request(session, handler, r).await?,
        msg::USERAUTH_INFO_RESPONSE => auth::info_response(session, handler, r).await?,
        typ if !session.is_authenticated() => {
            warn!("{} before authentication, ignored", msg::name(typ))
        }

        msg::CHANNEL_OPEN => channel_open(session, handler, r).await?,
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
        msg::GLOBAL_REQUEST => session.common.global_request(r)?,
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
            // Whatever the handler sends while deciding goes out after
            // the answer.
            let queued = session.common.write.take();
            let decision = decide(session, handler, id, &request).await;
            let produced = session.common.write.take();
            session.common.write.extend(queued);
            let decision = decision?;
            debug!("channel {}: {} {:?}", id, request.name(), decision);
            if decision.accepted() {
                session.common.accepted(id, &request);
                if let Some(channel) = session.common.channels.get(&id) {
                    channel.sink.deliver(ChannelMsg::Request {
                        request,
                        reply: None,
                    })
                }
            }
            session.common.answer(id, token, decision.accepted())?;
            session.common.write.extend(produced);
        }
    }
    Ok(())
}

/// Asks the handler about a request the channel can take.
async fn decide<H: Handler>(
    session: &mut Session,
    handler: &mut H,
    id: ChannelId,
    request: &ChannelRequest,
) -> Result<Decision, H::Error> {
    let process = session
        .common
        .channels
        .get(&id)
        .and_then(|c| c.router.as_ref())
        .and_then(|router| router.process_request(request));
    let decision = match (request, process) {
        (ChannelRequest::Pty(pty), _) => handler.pty_request(id, pty, session).await?,
        (ChannelRequest::Env { name, value }, _) => {
            handler.env_request(id, name, value, session).await?
        }
        (ChannelRequest::X11(x11), _) => handler.x11_request(id, x11, session).await?,
        (ChannelRequest::AgentForward, _) => handler.agent_request(id, session).await?,
        (ChannelRequest::Exec { .. }, Some(process)) => {
            handler.exec_request(id, &process, session).await?
        }
        (ChannelRequest::Shell, Some(process)) => {
            handler.shell_request(id, &process, session).await?
        }
        (ChannelRequest::Subsystem { .. }, Some(process)) => {
            handler.subsystem_request(id, &process, session).await?
        }
        (
            ChannelRequest::WindowChange {
                cols,
                rows,
                width,
                height,
            },
            _,
        ) => {
            handler
                .window_change_request(id, *cols, *rows, *width, *height, session)
                .await?;
            Decision::Accept
        }
        (ChannelRequest::Signal(signal), _) => {
            handler.signal(id, signal.clone(), session).await?;
            Decision::Accept
        }
        (request, _) => {
            debug!("channel {}: nothing handles {}", id, request.name());
            Decision::Reject
        }
    };
    Ok(decision)
}

async fn channel_open<H: Handler>(
    session: &mut Session,
    handler: &mut H,
    r: &mut &[u8],
) -> Result<(), H::Error> {
    let open = OpenChannelMessage::parse(r)?;
    debug!("client opens a {} channel", open.typ.name());

    let (tx, rx) = unbounded_channel();
    let channel_ref = ChannelRef::new(tx);
    let id = session.common.channels.next_id();
    let channel = Channel::new(
        id,
        session.sender.sender.clone(),
        rx,
        channel_ref.window().clone(),
    );
    let kind = open.typ.clone();
    let accepted = match kind {
        ChannelType::Session => handler.channel_open_session(channel, session).await?,
        ref kind => handler.channel_open(channel, kind, session).await?,
    };
    if accepted {
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
