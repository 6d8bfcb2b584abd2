//! Stream throttling utilities

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep};

/// Extension trait to add throttling to any Stream
pub trait ThrottleExt: Stream {
    /// Emit at most one item per `duration`.
    ///
    /// The first item passes straight through. Items arriving inside the quiet window
    /// replace each other, and the latest one is emitted when the window closes.
    fn throttle(self, duration: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, duration)
    }
}

impl<T: Stream> ThrottleExt for T {}

pin_project! {
    /// A stream combinator that throttles emission rate
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        window: Sleep,
        period: Duration,
        pending: Option<S::Item>,
        in_window: bool,
        exhausted: bool,
    }
}

impl<S: Stream> Throttle<S> {
    pub fn new(stream: S, period: Duration) -> Self {
        Self {
            stream,
            window: sleep(Duration::ZERO),
            period,
            pending: None,
            in_window: false,
            exhausted: false,
        }
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Keep only the latest ready item.
        while !*this.exhausted {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => *this.pending = Some(item),
                Poll::Ready(None) => *this.exhausted = true,
                Poll::Pending => break,
            }
        }

        if *this.in_window {
            if this.window.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            *this.in_window = false;
        }

        match this.pending.take() {
            Some(item) => {
                this.window.as_mut().reset(Instant::now() + *this.period);
                *this.in_window = true;
                Poll::Ready(Some(item))
            }
            None if *this.exhausted => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn first_item_passes_and_burst_collapses_to_latest() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut throttled = std::pin::pin!(UnboundedReceiverStream::new(rx).throttle(Duration::from_millis(100)));

        tx.send(1).unwrap();
        assert_eq!(throttled.next().await, Some(1));

        tx.send(2).unwrap();
        tx.send(3).unwrap();
        tx.send(4).unwrap();
        let start = Instant::now();
        assert_eq!(throttled.next().await, Some(4));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_stays_pending_and_ends_after_last_item() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut throttled = std::pin::pin!(UnboundedReceiverStream::new(rx).throttle(Duration::from_millis(50)));

        let idle = tokio::time::timeout(Duration::from_millis(500), throttled.next()).await;
        assert!(idle.is_err());

        tx.send(7).unwrap();
        tx.send(8).unwrap();
        drop(tx);
        assert_eq!(throttled.next().await, Some(8));
        assert_eq!(throttled.next().await, None);
    }
}
