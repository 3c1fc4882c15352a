use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use log::trace;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::oneshot;

use crate::channels::{Channel, ChannelMsg, ChannelTx, ChannelWriteHalf};
use crate::{ChannelId, Error, Sig};

/// How a remote program ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Code(u32),
    Signal {
        signal: Sig,
        core_dumped: bool,
        error_message: String,
    },
}

impl ExitStatus {
    /// The exit code, if the program was not killed by a signal.
    pub fn code(&self) -> Option<u32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            ExitStatus::Signal { .. } => None,
        }
    }
}

/// Everything a channel produced, see [`Channel::output`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` if the channel closed without reporting one.
    pub exit_status: Option<ExitStatus>,
}

/// Reads one stream of a channel. Ends when the channel is closed.
#[derive(Debug)]
pub struct StreamReader {
    receiver: UnboundedReceiver<Bytes>,
    buffer: Bytes,
}

impl AsyncRead for StreamReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.buffer.is_empty() {
            match ready!(self.receiver.poll_recv(cx)) {
                Some(data) => self.buffer = data,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.buffer.len().min(buf.remaining());
        buf.put_slice(self.buffer.get(..n).unwrap_or_default());
        self.buffer.advance(n);
        Poll::Ready(Ok(()))
    }
}

/// A session channel seen as a process: a writer for its standard
/// input, readers for its standard output and error, and its exit
/// status.
pub struct SessionStream<S: From<(ChannelId, ChannelMsg)>> {
    pub stdin: ChannelTx<S>,
    pub stdout: StreamReader,
    pub stderr: StreamReader,
    exit: oneshot::Receiver<ExitStatus>,
    write_half: ChannelWriteHalf<S>,
}

impl<S: From<(ChannelId, ChannelMsg)> + Send + 'static> SessionStream<S> {
    pub(crate) fn new(channel: Channel<S>) -> Self {
        let (mut read_half, write_half) = channel.split();
        let (stdout_tx, stdout) = unbounded_channel();
        let (stderr_tx, stderr) = unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let id = write_half.id();
        tokio::spawn(async move {
            let mut exit_tx = Some(exit_tx);
            while let Some(msg) = read_half.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        let _ = stdout_tx.send(data);
                    }
                    ChannelMsg::ExtendedData { data, ext: 1 } => {
                        let _ = stderr_tx.send(data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        if let Some(tx) = exit_tx.take() {
                            let _ = tx.send(ExitStatus::Code(exit_status));
                        }
                    }
                    ChannelMsg::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        ..
                    } => {
                        if let Some(tx) = exit_tx.take() {
                            let _ = tx.send(ExitStatus::Signal {
                                signal: signal_name,
                                core_dumped,
                                error_message,
                            });
                        }
                    }
                    ChannelMsg::Close => break,
                    msg => trace!("channel {}: {:?} not forwarded to the stream", id, msg),
                }
            }
        });
        SessionStream {
            stdin: write_half.make_writer(),
            stdout: StreamReader {
                receiver: stdout,
                buffer: Bytes::new(),
            },
            stderr: StreamReader {
                receiver: stderr,
                buffer: Bytes::new(),
            },
            exit,
            write_half,
        }
    }

    /// The channel, for requests such as `window_change` or `signal`.
    pub fn channel(&self) -> &ChannelWriteHalf<S> {
        &self.write_half
    }

    /// Waits for the exit status. Fails with
    /// [`Error::ConnectionClosed`] if the channel closed without one.
    pub async fn wait_exit(self) -> Result<ExitStatus, Error> {
        self.exit.await.map_err(|_| Error::ConnectionClosed)
    }
}
