use std::pin::Pin;

use futures::{Stream, StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

#[derive(Debug, Clone)]
pub enum FrameCmd<T> {
    Data(T),
    Eof,
}

pub type FrameStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Fans frames out of a synchronous engine callback to async subscribers.
///
/// Slow subscribers skip frames instead of holding the engine back.
pub struct FrameSink<T> {
    sender: broadcast::Sender<FrameCmd<T>>,
}

impl<T> Clone for FrameSink<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> FrameSink<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes `frame`; returns how many subscribers will see it.
    pub fn send(&self, frame: T) -> usize {
        self.sender.send(FrameCmd::Data(frame)).unwrap_or(0)
    }

    /// Ends every subscriber's stream.
    pub fn close(&self) {
        let _ = self.sender.send(FrameCmd::Eof);
    }

    /// A callback for `set_on_decode` / `set_on_encode`.
    pub fn callback(&self) -> impl FnMut(T) + Send + 'static {
        let sink = self.clone();
        move |frame| {
            sink.send(frame);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FrameCmd<T>> {
        self.sender.subscribe()
    }

    /// Frames published from now on, until [`FrameSink::close`].
    pub fn stream(&self) -> FrameStream<T> {
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r| async move {
                match r {
                    Ok(cmd) => Some(cmd),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        log::warn!("frame subscriber lagged, {} frames skipped", skipped);
                        None
                    }
                }
            })
            .take_while(|cmd| future::ready(matches!(cmd, FrameCmd::Data(_))))
            .filter_map(|cmd| async move {
                match cmd {
                    FrameCmd::Data(frame) => Some(frame),
                    FrameCmd::Eof => None,
                }
            });
        Box::pin(stream)
    }
}
