//! An unbounded multi-producer, multi-consumer queue between tasks on the
//! same scheduler. `send` never suspends (unbounded); `recv` suspends until a
//! message arrives, the channel closes, or the receiving task is cancelled.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::runtime::tls;
use crate::{CancellableResult, Error};

/// Creates a channel, returning the sending and receiving ends.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    let state = Rc::new(RefCell::new(ChannelState {
        waiters: VecDeque::new(),
        queue: VecDeque::new(),
        is_closed: false,
    }));

    let tx = Sender(Rc::new(SenderState { state: state.clone() }));
    let rx = Receiver(Rc::new(ReceiverState { state }));

    (tx, rx)
}

/// The sending half. Cloning it creates another independent producer; the
/// channel only closes once every `Sender` (and every `Receiver`) is dropped.
#[derive(Debug, Clone)]
pub struct Sender<T>(Rc<SenderState<T>>);

impl<T> Sender<T> {
    /// Enqueues `data`, waking one waiting receiver if any. Returns `None`
    /// without enqueuing if the channel is already closed.
    pub fn send(&self, data: T) -> Option<()> {
        let mut state = self.0.state.borrow_mut();

        if state.is_closed {
            return None;
        }

        state.queue.push_back(data);
        let waker = state.waiters.pop_front();
        drop(state);

        if let Some(waker) = waker {
            waker.wake();
        }

        Some(())
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.0.state.borrow().queue.len()
    }

    /// Whether the queue currently holds no messages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the channel: queued messages remain readable, but no further
    /// sends succeed and a `recv` on an empty queue resolves to `None`.
    pub fn close(&self) {
        close_and_wake_all(&self.0.state);
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.0.state.borrow().is_closed
    }
}

#[derive(Debug)]
struct SenderState<T> {
    state: Rc<RefCell<ChannelState<T>>>,
}

impl<T> Drop for SenderState<T> {
    fn drop(&mut self) {
        close_and_wake_all(&self.state);
    }
}

/// The receiving half. Cloning it creates another independent consumer
/// competing for the same messages.
#[derive(Debug, Clone)]
pub struct Receiver<T>(Rc<ReceiverState<T>>);

impl<T> Receiver<T> {
    /// Waits for the next message. Resolves to `Ok(None)` once the channel is
    /// closed and drained, or `Err(Error::Cancelled)` if this task is
    /// cancelled while waiting.
    pub async fn recv(&self) -> CancellableResult<Option<T>> {
        Recv {
            receiver: self,
            registered: false,
        }
        .await
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.0.state.borrow().queue.len()
    }

    /// Whether the queue currently holds no messages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the channel from the receiving side, same effect as
    /// [`Sender::close`].
    pub fn close(&self) {
        close_and_wake_all(&self.0.state);
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.0.state.borrow().is_closed
    }
}

#[derive(Debug)]
struct ReceiverState<T> {
    state: Rc<RefCell<ChannelState<T>>>,
}

impl<T> Drop for ReceiverState<T> {
    fn drop(&mut self) {
        close_and_wake_all(&self.state);
    }
}

#[derive(Debug)]
struct ChannelState<T> {
    waiters: VecDeque<Waker>,
    queue: VecDeque<T>,
    is_closed: bool,
}

fn close_and_wake_all<T>(state: &Rc<RefCell<ChannelState<T>>>) {
    let mut state = state.borrow_mut();
    state.is_closed = true;
    let waiters = std::mem::take(&mut state.waiters);
    drop(state);

    for waiter in waiters {
        waiter.wake();
    }
}

struct Recv<'a, T> {
    receiver: &'a Receiver<T>,
    registered: bool,
}

impl<'a, T> Future for Recv<'a, T> {
    type Output = CancellableResult<Option<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if tls::current_cancel_token(|token| token.get_error()).is_some() {
            tls::current_cancel_token(|token| token.clear_cancel_fn());
            return Poll::Ready(Err(Error::Cancelled));
        }

        let mut state = this.receiver.0.state.borrow_mut();

        if let Some(message) = state.queue.pop_front() {
            drop(state);
            tls::current_cancel_token(|token| token.clear_cancel_fn());
            return Poll::Ready(Ok(Some(message)));
        }

        if state.is_closed {
            drop(state);
            tls::current_cancel_token(|token| token.clear_cancel_fn());
            return Poll::Ready(Ok(None));
        }

        state.waiters.push_back(cx.waker().clone());
        drop(state);

        if !this.registered {
            let waker = cx.waker().clone();
            tls::current_cancel_token(|token| token.set_cancel_fn(move || waker.wake()));
            this.registered = true;
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn send_then_receive() {
        runtime::block_on(async {
            let (tx, rx) = unbounded();

            tx.send(1).unwrap();
            tx.send(2).unwrap();
            tx.send(3).unwrap();

            assert_eq!(rx.recv().await.unwrap(), Some(1));
            assert_eq!(rx.recv().await.unwrap(), Some(2));
            assert_eq!(rx.recv().await.unwrap(), Some(3));
        });
    }

    #[test]
    fn receive_then_send() {
        runtime::block_on(async {
            let (tx, rx) = unbounded();

            runtime::spawn(async move {
                tx.send(1).unwrap();
            });

            assert_eq!(rx.recv().await.unwrap(), Some(1));
        });
    }

    #[test]
    fn recv_returns_none_once_closed_and_drained() {
        runtime::block_on(async {
            let (tx, rx) = unbounded::<i32>();

            tx.send(1).unwrap();
            tx.close();

            assert_eq!(rx.recv().await.unwrap(), Some(1));
            assert_eq!(rx.recv().await.unwrap(), None);
        });
    }

    #[test]
    fn send_fails_after_close() {
        let (tx, _rx) = unbounded();
        tx.close();
        assert_eq!(tx.send(1), None);
    }

    #[test]
    fn dropping_every_sender_closes_the_channel() {
        runtime::block_on(async {
            let (tx, rx) = unbounded::<i32>();
            drop(tx);

            assert_eq!(rx.recv().await.unwrap(), None);
        });
    }

    #[test]
    fn cancelling_a_waiting_receiver_resumes_it_early() {
        runtime::block_on(async {
            let (_tx, rx) = unbounded::<i32>();
            let handle = runtime::spawn(async move { rx.recv().await });

            runtime::yield_now().await;
            handle.cancel();

            assert_eq!(handle.await, Err(Error::Cancelled));
        });
    }
}
