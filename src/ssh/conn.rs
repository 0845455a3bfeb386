//! Socket wrapper enforcing the per-connection deadlines.
//!
//! Two deadlines apply to every read and write:
//!
//! - a sliding idle deadline, pushed to `now + idle_timeout` after each
//!   successful read or write;
//! - an absolute lifetime deadline fixed at accept time when a max timeout
//!   is configured.
//!
//! The effective deadline is the earlier of the two. Once it passes, the
//! next (or pending) I/O resolves with `TimedOut`, which tears the SSH
//! session down. Higher layers never look at the clock.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::CancellationToken;

pub struct TimedStream<S> {
    inner: S,
    idle_timeout: Duration,
    max_deadline: Option<Instant>,
    deadline: Pin<Box<Sleep>>,
    cancel: CancellationToken,
}

impl<S> TimedStream<S> {
    /// Wrap `inner`. A zero `max_timeout` disables the lifetime deadline.
    pub fn new(
        inner: S,
        idle_timeout: Duration,
        max_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        let max_deadline = (max_timeout > Duration::ZERO).then(|| now + max_timeout);
        let first = effective(now + idle_timeout, max_deadline);
        TimedStream {
            inner,
            idle_timeout,
            max_deadline,
            deadline: Box::pin(sleep_until(first)),
            cancel,
        }
    }

    /// Slide the idle deadline after a successful read or write.
    fn bump(&mut self) {
        let next = effective(Instant::now() + self.idle_timeout, self.max_deadline);
        self.deadline.as_mut().reset(next);
    }

    /// True once the effective deadline has passed. Polling the timer also
    /// registers the waker, so a pending I/O is woken when time runs out.
    fn expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.deadline.as_mut().poll(cx).is_ready()
    }
}

fn effective(idle: Instant, max: Option<Instant>) -> Instant {
    match max {
        Some(max) if max < idle => max,
        _ => idle,
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection deadline exceeded")
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.expired(cx) {
            return Poll::Ready(Err(timed_out()));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.bump();
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.expired(cx) {
            return Poll::Ready(Err(timed_out()));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.bump();
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S> Drop for TimedStream<S> {
    /// Cancellation fires before the inner socket is released, so anything
    /// awaiting the connection context observes the close promptly.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
