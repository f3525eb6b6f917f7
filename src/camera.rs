//! Camera stream reader.
//!
//! The session's link router pushes raw frames into a latest-value channel
//! (capacity one, drop-oldest). The consumer side pulls lazily through
//! [`CameraStream`], so the frame observed is always the freshest one the
//! controller produced rather than a stale queued backlog.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::{Stream, StreamExt};

use crate::{
    error::{Error, Result},
    protocol::RawFrame,
    util::LatestReceiver,
};

/// Decoded camera frame. Pixels are channel first `(3, height, width)`,
/// 32 bit float, scaled to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Vec<f32>,
    width: usize,
    height: usize,
    timestamp: Instant,
}

impl Frame {
    pub(crate) fn decode(raw: &RawFrame, timestamp: Instant) -> Self {
        let width = raw.width as usize;
        let height = raw.height as usize;
        let plane = width * height;
        let mut pixels = vec![0.0; 3 * plane];
        for index in 0..plane {
            for channel in 0..3 {
                pixels[channel * plane + index] = raw.pixels[index * 3 + channel] as f32 / 255.0;
            }
        }
        Self {
            pixels,
            width,
            height,
            timestamp,
        }
    }

    /// `(channels, height, width)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (3, self.height, self.width)
    }

    pub fn pixel(&self, channel: usize, y: usize, x: usize) -> f32 {
        self.pixels[channel * self.height * self.width + y * self.width + x]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.pixels
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

pub(crate) struct SequencedRawFrame {
    pub raw: RawFrame,
    pub timestamp: Instant,
}

/// Lazy pull driven sequence of frames. Infinite while the session lives,
/// terminates for good once the link dies or a decode error surfaces.
pub struct CameraStream {
    receiver: LatestReceiver<Result<SequencedRawFrame>>,
    pull_timeout: Duration,
    last_timestamp: Option<Instant>,
    terminated: bool,
}

impl CameraStream {
    pub(crate) fn new(
        receiver: LatestReceiver<Result<SequencedRawFrame>>,
        pull_timeout: Duration,
    ) -> Self {
        Self {
            receiver,
            pull_timeout,
            last_timestamp: None,
            terminated: false,
        }
    }

    /// Pull the next frame, bounded by the configured camera pull timeout.
    /// `Ok(None)` means the stream ended cleanly with the session.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        match tokio::time::timeout(self.pull_timeout, self.next()).await {
            Ok(Some(Ok(frame))) => Ok(Some(frame)),
            Ok(Some(Err(error))) => Err(error),
            Ok(None) => Ok(None),
            Err(_) => Err(Error::timeout("camera pull", self.pull_timeout)),
        }
    }
}

impl Stream for CameraStream {
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(Ok(sequenced))) => {
                // receipt timestamps come from Instant but clamp anyway so
                // consumers can rely on a non-decreasing sequence
                let timestamp = match self.last_timestamp {
                    Some(last) if last > sequenced.timestamp => last,
                    _ => sequenced.timestamp,
                };
                self.last_timestamp = Some(timestamp);
                Poll::Ready(Some(Ok(Frame::decode(&sequenced.raw, timestamp))))
            }
            Poll::Ready(Some(Err(error))) => {
                self.terminated = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
