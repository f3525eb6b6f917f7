use futures::task::AtomicWaker;
use std::{
    future::poll_fn,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

/// Single producer, single consumer channel that only ever holds the latest
/// value. Sending replaces an unread value, so a slow consumer observes the
/// freshest data instead of a queued backlog.
pub fn latest_value_channel<T>() -> (LatestSender<T>, LatestReceiver<T>) {
    let shared = Arc::new(Shared {
        value: Mutex::new(None),
        waker: AtomicWaker::new(),
        sender_alive: AtomicBool::new(true),
        receiver_alive: AtomicBool::new(true),
    });
    (
        LatestSender {
            shared: Arc::clone(&shared),
        },
        LatestReceiver { shared },
    )
}

struct Shared<T> {
    value: Mutex<Option<T>>,
    waker: AtomicWaker,
    sender_alive: AtomicBool,
    receiver_alive: AtomicBool,
}

pub struct LatestSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> LatestSender<T> {
    /// Stores the value, dropping any value the receiver has not picked up
    /// yet. Hands the value back when the receiver is gone.
    pub fn send(&self, value: T) -> Result<(), T> {
        if !self.shared.receiver_alive.load(Ordering::SeqCst) {
            return Err(value);
        }
        *self.shared.value.lock().unwrap() = Some(value);
        self.shared.waker.wake();
        Ok(())
    }
}

impl<T> Drop for LatestSender<T> {
    fn drop(&mut self) {
        self.shared.sender_alive.store(false, Ordering::SeqCst);
        self.shared.waker.wake();
    }
}

pub struct LatestReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> LatestReceiver<T> {
    /// `None` once the sender is gone and no value is pending.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if let Some(value) = self.shared.value.lock().unwrap().take() {
            return Poll::Ready(Some(value));
        }
        if !self.shared.sender_alive.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        self.shared.waker.register(cx.waker());
        // re-check, the sender may have raced the waker registration
        if let Some(value) = self.shared.value.lock().unwrap().take() {
            return Poll::Ready(Some(value));
        }
        if !self.shared.sender_alive.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        Poll::Pending
    }

    pub async fn recv(&mut self) -> Option<T> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }
}

impl<T> Drop for LatestReceiver<T> {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::SeqCst);
    }
}
