use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::AsyncWrite;

use super::{ChannelMsg, ChannelWriteHalf};
use crate::{ChannelId, Error};

fn to_io_error(e: Error) -> io::Error {
    match e {
        Error::IO(e) => e,
        e => io::Error::new(io::ErrorKind::BrokenPipe, e),
    }
}

/// Writes to a channel as an [`AsyncWrite`]. Each `poll_write` sends
/// at most one packet, sized to the window available at that time.
pub struct ChannelTx<S: From<(ChannelId, ChannelMsg)>> {
    half: ChannelWriteHalf<S>,
    ext: Option<u32>,
    write_fut: Option<BoxFuture<'static, Result<usize, Error>>>,
    shutdown_fut: Option<BoxFuture<'static, Result<(), Error>>>,
}

impl<S> ChannelTx<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + 'static,
{
    pub(crate) fn new(half: ChannelWriteHalf<S>, ext: Option<u32>) -> Self {
        ChannelTx {
            half,
            ext,
            write_fut: None,
            shutdown_fut: None,
        }
    }
}

async fn write_packet<S>(half: ChannelWriteHalf<S>, ext: Option<u32>, data: Vec<u8>) -> Result<usize, Error>
where
    S: From<(ChannelId, ChannelMsg)> + Send + 'static,
{
    let n = half.window.reserve(data.len()).await?;
    let chunk = Bytes::copy_from_slice(data.get(..n).unwrap_or_default());
    half.send_data_packet(ext, chunk).await?;
    Ok(n)
}

impl<S> AsyncWrite for ChannelTx<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + 'static,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = &mut *self;
        let fut = match this.write_fut {
            Some(ref mut fut) => fut,
            None => {
                let len = buf.len().min(crate::session::DATA_CHUNK);
                let data = buf.get(..len).unwrap_or_default().to_vec();
                this.write_fut
                    .insert(write_packet(this.half.clone(), this.ext, data).boxed())
            }
        };
        let r = ready!(fut.poll_unpin(cx));
        this.write_fut = None;
        Poll::Ready(r.map_err(to_io_error))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let this = &mut *self;
        let fut = match this.shutdown_fut {
            Some(ref mut fut) => fut,
            None => {
                let half = this.half.clone();
                this.shutdown_fut
                    .insert(async move { half.eof().await }.boxed())
            }
        };
        let r = ready!(fut.poll_unpin(cx));
        this.shutdown_fut = None;
        Poll::Ready(r.map_err(to_io_error))
    }
}
