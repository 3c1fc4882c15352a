use std::sync::Arc;

use bytes::Bytes;
use delegate::delegate;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tokio::sync::oneshot;

use crate::request::{ChannelRequest, X11Request};
use crate::stream::{ExitStatus, Output, SessionStream};
use crate::{ChannelId, ChannelOpenFailure, Error, PtyInfo, Sig};

mod channel_ref;
pub(crate) use channel_ref::{ChannelRef, Window};

mod io;
pub use io::ChannelTx;

pub(crate) mod table;

#[derive(Debug)]
#[non_exhaustive]
/// Possible messages that [Channel::wait] can receive.
pub enum ChannelMsg {
    Open {
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
    },
    OpenFailure {
        reason: ChannelOpenFailure,
        description: String,
    },
    Data {
        data: Bytes,
    },
    ExtendedData {
        data: Bytes,
        ext: u32,
    },
    Eof,
    Close,
    /// A channel request. Going out, `reply` receives the peer's
    /// answer if one was asked for. Coming in, it reports a request the
    /// handler accepted.
    Request {
        request: ChannelRequest,
        reply: Option<oneshot::Sender<bool>>,
    },
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    WindowAdjusted {
        new_size: u32,
    },
}

/// The receiving end of a channel.
#[derive(Debug)]
pub struct ChannelReadHalf {
    pub(crate) receiver: UnboundedReceiver<ChannelMsg>,
}

impl ChannelReadHalf {
    /// Wait for data to come. `None` once the channel is closed and
    /// every message has been read.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        self.receiver.recv().await
    }
}

/// The sending end of a channel. Clones share the same window.
pub struct ChannelWriteHalf<S: From<(ChannelId, ChannelMsg)>> {
    pub(crate) id: ChannelId,
    pub(crate) sender: Sender<S>,
    pub(crate) window: Arc<Window>,
}

impl<S: From<(ChannelId, ChannelMsg)>> Clone for ChannelWriteHalf<S> {
    fn clone(&self) -> Self {
        ChannelWriteHalf {
            id: self.id,
            sender: self.sender.clone(),
            window: self.window.clone(),
        }
    }
}

impl<S: From<(ChannelId, ChannelMsg)>> std::fmt::Debug for ChannelWriteHalf<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriteHalf")
            .field("id", &self.id)
            .finish()
    }
}

impl<S: From<(ChannelId, ChannelMsg)> + Send + 'static> ChannelWriteHalf<S> {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Returns the min between the maximum packet size and the
    /// remaining window size in the channel.
    pub async fn writable_packet_size(&self) -> usize {
        self.window.writable().await
    }

    /// Request a pseudo-terminal with the given characteristics.
    pub async fn request_pty(&self, want_reply: bool, pty: &PtyInfo) -> Result<(), Error> {
        self.request(want_reply, ChannelRequest::Pty(pty.clone()))
            .await
    }

    /// Request a remote shell.
    pub async fn request_shell(&self, want_reply: bool) -> Result<(), Error> {
        self.request(want_reply, ChannelRequest::Shell).await
    }

    /// Execute a remote program (will be passed to a shell).
    pub async fn exec<A: Into<String>>(&self, want_reply: bool, command: A) -> Result<(), Error> {
        self.request(
            want_reply,
            ChannelRequest::Exec {
                command: command.into(),
            },
        )
        .await
    }

    /// Signal a remote process.
    pub async fn signal(&self, signal: Sig) -> Result<(), Error> {
        self.request(false, ChannelRequest::Signal(signal)).await
    }

    /// Request the start of a subsystem with the given name.
    pub async fn request_subsystem<A: Into<String>>(
        &self,
        want_reply: bool,
        name: A,
    ) -> Result<(), Error> {
        self.request(want_reply, ChannelRequest::Subsystem { name: name.into() })
            .await
    }

    /// Request X11 forwarding. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6.3.1)
    /// for security issues related to cookies.
    pub async fn request_x11(&self, want_reply: bool, x11: X11Request) -> Result<(), Error> {
        self.request(want_reply, ChannelRequest::X11(x11)).await
    }

    /// Set a remote environment variable.
    pub async fn set_env<A: Into<String>, B: Into<String>>(
        &self,
        want_reply: bool,
        name: A,
        value: B,
    ) -> Result<(), Error> {
        self.request(
            want_reply,
            ChannelRequest::Env {
                name: name.into(),
                value: value.into(),
            },
        )
        .await
    }

    /// Inform the server that our window size has changed.
    pub async fn window_change(
        &self,
        cols: u32,
        rows: u32,
        width: u32,
        height: u32,
    ) -> Result<(), Error> {
        self.request(
            false,
            ChannelRequest::WindowChange {
                cols,
                rows,
                width,
                height,
            },
        )
        .await
    }

    /// Inform the server that we will accept agent forwarding channels
    pub async fn agent_forward(&self, want_reply: bool) -> Result<(), Error> {
        self.request(want_reply, ChannelRequest::AgentForward).await
    }

    /// Tell the client whether it may do flow control (server only).
    pub async fn xon_xoff(&self, client_can_do: bool) -> Result<(), Error> {
        self.request(false, ChannelRequest::XonXoff { client_can_do })
            .await
    }

    /// Report the exit status of the process (server only). Sent after
    /// all the data queued so far on this channel.
    pub async fn exit_status(&self, exit_status: u32) -> Result<(), Error> {
        self.send_msg(ChannelMsg::ExitStatus { exit_status }).await
    }

    /// Report the signal that killed the process (server only).
    pub async fn exit_signal<A: Into<String>>(
        &self,
        signal_name: Sig,
        core_dumped: bool,
        error_message: A,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message: error_message.into(),
            lang_tag: String::new(),
        })
        .await
    }

    /// Send data to a channel, waiting for the peer's window whenever
    /// it is exhausted.
    pub async fn data<R: AsyncRead + Unpin>(&self, data: R) -> Result<(), Error> {
        self.send_data(None, data).await
    }

    /// Send data on an extended stream, usually `1` for stderr.
    pub async fn extended_data<R: AsyncRead + Unpin>(&self, ext: u32, data: R) -> Result<(), Error> {
        self.send_data(Some(ext), data).await
    }

    async fn send_data<R: AsyncRead + Unpin>(
        &self,
        ext: Option<u32>,
        mut data: R,
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        loop {
            let writable = self.window.reserve(crate::session::DATA_CHUNK).await?;
            buf.resize(writable, 0);
            let n = data.read(&mut buf).await?;
            self.window.release(writable - n).await;
            if n == 0 {
                break;
            }
            let data = Bytes::copy_from_slice(buf.get(..n).unwrap_or_default());
            self.send_data_packet(ext, data).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_data_packet(&self, ext: Option<u32>, data: Bytes) -> Result<(), Error> {
        self.send_msg(if let Some(ext) = ext {
            ChannelMsg::ExtendedData { ext, data }
        } else {
            ChannelMsg::Data { data }
        })
        .await
    }

    pub async fn eof(&self) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Eof).await
    }

    /// Request that the channel be closed.
    pub async fn close(&self) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Close).await
    }

    /// An [`tokio::io::AsyncWrite`] over this channel's data stream.
    pub fn make_writer(&self) -> ChannelTx<S> {
        ChannelTx::new(self.clone(), None)
    }

    /// An [`tokio::io::AsyncWrite`] over an extended data stream.
    pub fn make_writer_ext(&self, ext: Option<u32>) -> ChannelTx<S> {
        ChannelTx::new(self.clone(), ext)
    }

    async fn request(&self, want_reply: bool, request: ChannelRequest) -> Result<(), Error> {
        if !want_reply {
            return self
                .send_msg(ChannelMsg::Request {
                    request,
                    reply: None,
                })
                .await;
        }
        let name = request.name().to_string();
        let (reply, answer) = oneshot::channel();
        self.send_msg(ChannelMsg::Request {
            request,
            reply: Some(reply),
        })
        .await?;
        match answer.await {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!("channel {}: {} denied", self.id, name);
                Err(Error::RequestDenied)
            }
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    async fn send_msg(&self, msg: ChannelMsg) -> Result<(), Error> {
        self.sender
            .send((self.id, msg).into())
            .await
            .map_err(|_| Error::SendError)
    }
}

/// A handle to a channel.
///
/// Allows you to read and write from a channel without borrowing the
/// session. Requests sent with `want_reply` resolve once the peer
/// answered, and fail with [`Error::RequestDenied`] on refusal.
pub struct Channel<S: From<(ChannelId, ChannelMsg)>> {
    pub(crate) read_half: ChannelReadHalf,
    pub(crate) write_half: ChannelWriteHalf<S>,
}

impl<T: From<(ChannelId, ChannelMsg)>> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.write_half.id)
            .finish()
    }
}

impl<S: From<(ChannelId, ChannelMsg)> + Send + 'static> Channel<S> {
    pub(crate) fn new(
        id: ChannelId,
        sender: Sender<S>,
        receiver: UnboundedReceiver<ChannelMsg>,
        window: Arc<Window>,
    ) -> Self {
        Channel {
            read_half: ChannelReadHalf { receiver },
            write_half: ChannelWriteHalf { id, sender, window },
        }
    }

    delegate! {
        to self.write_half {
            pub fn id(&self) -> ChannelId;
            pub async fn writable_packet_size(&self) -> usize;
            pub async fn request_pty(&self, want_reply: bool, pty: &PtyInfo) -> Result<(), Error>;
            pub async fn request_shell(&self, want_reply: bool) -> Result<(), Error>;
            pub async fn exec<A: Into<String>>(&self, want_reply: bool, command: A) -> Result<(), Error>;
            pub async fn signal(&self, signal: Sig) -> Result<(), Error>;
            pub async fn request_subsystem<A: Into<String>>(&self, want_reply: bool, name: A) -> Result<(), Error>;
            pub async fn request_x11(&self, want_reply: bool, x11: X11Request) -> Result<(), Error>;
            pub async fn set_env<A: Into<String>, B: Into<String>>(&self, want_reply: bool, name: A, value: B) -> Result<(), Error>;
            pub async fn window_change(&self, cols: u32, rows: u32, width: u32, height: u32) -> Result<(), Error>;
            pub async fn agent_forward(&self, want_reply: bool) -> Result<(), Error>;
            pub async fn xon_xoff(&self, client_can_do: bool) -> Result<(), Error>;
            pub async fn exit_status(&self, exit_status: u32) -> Result<(), Error>;
            pub async fn exit_signal<A: Into<String>>(&self, signal_name: Sig, core_dumped: bool, error_message: A) -> Result<(), Error>;
            pub async fn data<R: AsyncRead + Unpin>(&self, data: R) -> Result<(), Error>;
            pub async fn extended_data<R: AsyncRead + Unpin>(&self, ext: u32, data: R) -> Result<(), Error>;
            pub async fn eof(&self) -> Result<(), Error>;
            pub async fn close(&self) -> Result<(), Error>;
            pub fn make_writer(&self) -> ChannelTx<S>;
            pub fn make_writer_ext(&self, ext: Option<u32>) -> ChannelTx<S>;
        }
    }

    /// Wait for data to come.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        self.read_half.wait().await
    }

    /// Split the channel into its read and write halves.
    pub fn split(self) -> (ChannelReadHalf, ChannelWriteHalf<S>) {
        (self.read_half, self.write_half)
    }

    /// Turn the channel into separate stdout/stderr readers, a stdin
    /// writer and the exit status of the remote process.
    pub fn into_stream(self) -> SessionStream<S> {
        SessionStream::new(self)
    }

    /// Read everything the channel produces until it closes. Fails
    /// with [`Error::ConnectionClosed`] if the connection ends first.
    pub async fn output(mut self) -> Result<Output, Error> {
        let mut output = Output::default();
        loop {
            let Some(msg) = self.wait().await else {
                return Err(Error::ConnectionClosed);
            };
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    output.exit_status = Some(ExitStatus::Code(exit_status))
                }
                ChannelMsg::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    ..
                } => {
                    output.exit_status = Some(ExitStatus::Signal {
                        signal: signal_name,
                        core_dumped,
                        error_message,
                    })
                }
                ChannelMsg::Close => return Ok(output),
                _ => {}
            }
        }
    }
}
