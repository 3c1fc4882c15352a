use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, Notify};

use crate::{ChannelMsg, Error};

#[derive(Debug, Default)]
struct WindowState {
    size: u32,
    max_packet_size: u32,
    /// Bytes sent without a reservation that the window had no room
    /// for. Paid off before the window grows again.
    debt: u64,
    closed: bool,
}

impl WindowState {
    fn add(&mut self, amount: u32) {
        let repaid = u64::from(amount).min(self.debt);
        self.debt -= repaid;
        self.size = self.size.saturating_add(amount - repaid as u32);
    }
}

/// The peer's receive window for one channel, shared between the
/// event loop and every writer of that channel.
///
/// Writers reserve room before handing data to the loop, and suspend
/// while the window is empty. The loop grows it on
/// `CHANNEL_WINDOW_ADJUST` and closes it when the channel or the
/// connection goes away, which wakes all suspended writers. Data that
/// reached the loop without a reservation is charged with [`Window::take`].
#[derive(Debug, Default)]
pub(crate) struct Window {
    state: Mutex<WindowState>,
    notify: Notify,
}

impl Window {
    pub async fn set(&self, size: u32, max_packet_size: u32) {
        let mut state = self.state.lock().await;
        state.size = 0;
        state.add(size);
        state.max_packet_size = max_packet_size;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn grow(&self, amount: u32) -> u32 {
        let mut state = self.state.lock().await;
        state.add(amount);
        let size = state.size;
        drop(state);
        self.notify.notify_waiters();
        size
    }

    /// Takes `n` bytes out of the window without waiting. What does not
    /// fit is owed, and held back from later growth.
    pub async fn take(&self, n: usize) {
        let mut state = self.state.lock().await;
        let n = n as u64;
        let taken = n.min(u64::from(state.size));
        state.size -= taken as u32;
        state.debt = state.debt.saturating_add(n - taken);
    }

    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// The number of bytes that can go out in a single packet right now.
    pub async fn writable(&self) -> usize {
        let state = self.state.lock().await;
        state.size.min(state.max_packet_size) as usize
    }

    /// Waits until at least one byte may be sent, and takes up to
    /// `wanted` bytes (bounded by the maximum packet size) out of the
    /// window.
    pub async fn reserve(&self, wanted: usize) -> Result<usize, Error> {
        loop {
            // Registered before looking at the state, so that a
            // `notify_waiters` in between is not missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(Error::ConnectionClosed);
                }
                let n = (state.size.min(state.max_packet_size) as usize).min(wanted);
                if n > 0 || wanted == 0 {
                    state.size -= n as u32;
                    return Ok(n);
                }
            }
            notified.await;
        }
    }

    /// Gives back part of a reservation that was not sent.
    pub async fn release(&self, unused: usize) {
        if unused > 0 {
            self.grow(unused as u32).await;
        }
    }
}

/// What the event loop keeps of a [`super::Channel`]: the sender of
/// its incoming messages and its outgoing window.
#[derive(Debug)]
pub struct ChannelRef {
    sender: UnboundedSender<ChannelMsg>,
    window: Arc<Window>,
}

impl ChannelRef {
    pub(crate) fn new(sender: UnboundedSender<ChannelMsg>) -> Self {
        Self {
            sender,
            window: Default::default(),
        }
    }

    pub(crate) fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Delivers a message to the application. A dropped [`super::Channel`]
    /// is not an error, the connection keeps serving its other channels.
    pub(crate) fn deliver(&self, msg: ChannelMsg) {
        if self.sender.send(msg).is_err() {
            log::trace!("channel receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writers_wait_for_window_adjustments() {
        let window = Arc::new(Window::default());
        window.set(10, 4).await;
        assert_eq!(window.reserve(100).await.unwrap(), 4);
        assert_eq!(window.reserve(100).await.unwrap(), 4);
        assert_eq!(window.reserve(100).await.unwrap(), 2);

        let w = window.clone();
        let blocked = tokio::spawn(async move { w.reserve(3).await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        window.grow(5).await;
        assert_eq!(blocked.await.unwrap().unwrap(), 3);
        assert_eq!(window.writable().await, 2);
    }

    #[tokio::test]
    async fn unreserved_writes_are_owed() {
        let window = Arc::new(Window::default());
        window.take(30).await;
        window.set(20, 8).await;
        assert_eq!(window.writable().await, 0);

        let w = window.clone();
        let blocked = tokio::spawn(async move { w.reserve(8).await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        // 10 bytes still owed, then 5 left for the writer.
        window.grow(15).await;
        assert_eq!(blocked.await.unwrap().unwrap(), 5);

        window.take(3).await;
        window.release(2).await;
        assert_eq!(window.writable().await, 0);
        window.grow(2).await;
        assert_eq!(window.writable().await, 1);
    }

    #[tokio::test]
    async fn closing_wakes_writers() {
        let window = Arc::new(Window::default());
        let w = window.clone();
        let blocked = tokio::spawn(async move { w.reserve(1).await });
        tokio::task::yield_now().await;
        window.close().await;
        assert!(matches!(blocked.await.unwrap(), Err(Error::ConnectionClosed)));
    }
}
