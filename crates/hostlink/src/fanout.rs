//! Lazy per-key results of an operation dispatched across an aggregate

use crate::Result;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// One pending call per key
pub(crate) type Calls<T> = BoxStream<'static, BoxFuture<'static, Result<(String, T)>>>;

enum State<T> {
    Pending { calls: Calls<T>, concurrency: usize },
    Running(BoxStream<'static, Result<(String, T)>>),
    Done,
}

/// Stream of `(key, result)` pairs, one per key, in key-registration order.
///
/// Nothing is dispatched until the stream is polled, and each key's session
/// is picked (rotating its pool) only when that key's call starts. By
/// default calls run one after another; [`FanOut::buffered`] lets up to `n`
/// run at once while still yielding results in key order. Collecting with
/// `TryStreamExt::try_collect` stops at the first error.
pub struct FanOut<T> {
    state: State<T>,
}

impl<T: Send + 'static> FanOut<T> {
    pub(crate) fn new(calls: Calls<T>) -> Self {
        Self {
            state: State::Pending { calls, concurrency: 1 },
        }
    }

    /// Run up to `n` calls concurrently. Has no effect once polling started.
    pub fn buffered(mut self, n: usize) -> Self {
        if let State::Pending { concurrency, .. } = &mut self.state {
            *concurrency = n.max(1);
        }
        self
    }
}

impl<T: Send + 'static> Stream for FanOut<T> {
    type Item = Result<(String, T)>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                State::Pending { .. } => {
                    if let State::Pending { calls, concurrency } = std::mem::replace(&mut this.state, State::Done) {
                        this.state = State::Running(calls.buffered(concurrency).boxed());
                    }
                }
                State::Running(stream) => {
                    let item = futures::ready!(stream.poll_next_unpin(cx));
                    if item.is_none() {
                        this.state = State::Done;
                    }
                    return Poll::Ready(item);
                }
                State::Done => return Poll::Ready(None),
            }
        }
    }
}
