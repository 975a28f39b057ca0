use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use btleplug::api::BDAddr;
use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::Failure;
use crate::notification::Sample;

/// Short human-readable progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Scanning,
    ScanStopped,
    Found(BDAddr),
    Connecting,
    DiscoveringServices,
    Subscribing,
    Subscribed,
    Disconnected,
    Closed,
    Failed(Failure),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Scanning => f.write_str("Scanning..."),
            Status::ScanStopped => f.write_str("Scan stopped"),
            Status::Found(address) => write!(f, "Found {}", address),
            Status::Connecting => f.write_str("Connecting..."),
            Status::DiscoveringServices => f.write_str("Discovering services..."),
            Status::Subscribing => f.write_str("Subscribing..."),
            Status::Subscribed => f.write_str("Subscribed"),
            Status::Disconnected => f.write_str("Disconnected"),
            Status::Closed => f.write_str("Closed"),
            Status::Failed(failure) => write!(f, "Failed: {}", failure),
        }
    }
}

/// What the monitor publishes to its sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Status(Status),
    Sample(Sample),
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Status(status) => status.fmt(f),
            Update::Sample(sample) => write!(f, "Received: {}", sample.value),
        }
    }
}

/// Receives status reports and samples. Owned by the caller.
///
/// `publish` is called from the monitor's event loop, in order, one update at a
/// time. It must not block.
pub trait ResultSink: Send + Sync {
    fn publish(&self, update: Update);
}

impl<F> ResultSink for F
where
    F: Fn(Update) + Send + Sync,
{
    fn publish(&self, update: Update) {
        self(update)
    }
}

impl ResultSink for mpsc::UnboundedSender<Update> {
    fn publish(&self, update: Update) {
        // The receiver may be gone already.
        self.send(update).ok();
    }
}

/// A sink that any number of readers can observe as streams.
#[derive(Clone)]
pub struct UpdateBroadcast {
    sender: Sender<Update>,
    stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
}

impl Default for UpdateBroadcast {
    fn default() -> Self {
        UpdateBroadcast::new(16)
    }
}

impl UpdateBroadcast {
    /// `capacity` updates are buffered per reader; slow readers skip ahead.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            sender,
            stream_stoppers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a new stream that receives every update published from now on.
    pub fn stream(&self) -> Valved<Pin<Box<dyn Stream<Item = Update> + Send>>> {
        let receiver = self.sender.subscribe();

        let stream: Pin<Box<dyn Stream<Item = Update> + Send>> =
            Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }));

        let (trigger, stream) = Valved::new(stream);
        self.with_stoppers(|stoppers| stoppers.push(trigger));

        stream
    }

    /// Create a new stream that only receives samples.
    pub fn sample_stream(&self) -> Valved<Pin<Box<dyn Stream<Item = Sample> + Send>>> {
        let receiver = self.sender.subscribe();

        let stream: Pin<Box<dyn Stream<Item = Sample> + Send>> =
            Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move {
                match x {
                    Ok(Update::Sample(sample)) => Some(sample),
                    _ => None,
                }
            }));

        let (trigger, stream) = Valved::new(stream);
        self.with_stoppers(|stoppers| stoppers.push(trigger));

        stream
    }

    /// End every stream handed out so far.
    pub fn close_streams(&self) {
        self.with_stoppers(|stoppers| stoppers.clear());
    }

    fn with_stoppers(&self, f: impl FnOnce(&mut Vec<Trigger>)) {
        match self.stream_stoppers.write() {
            Ok(mut stoppers) => f(&mut stoppers),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl ResultSink for UpdateBroadcast {
    fn publish(&self, update: Update) {
        // No readers is fine, updates are not retained.
        self.sender.send(update).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::SystemTime;
    use uuid::Uuid;

    fn sample(value: u8) -> Sample {
        Sample {
            characteristic: Uuid::nil(),
            value,
            received_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn status_strings() {
        assert_eq!(Status::Scanning.to_string(), "Scanning...");
        assert_eq!(Status::Subscribed.to_string(), "Subscribed");
        assert_eq!(Status::Disconnected.to_string(), "Disconnected");
        assert_eq!(
            Status::Failed(Failure::CharacteristicNotFound).to_string(),
            "Failed: characteristic not found"
        );
        assert_eq!(Update::Sample(sample(42)).to_string(), "Received: 42");
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |update: Update| seen.lock().unwrap().push(update)
        };

        sink.publish(Update::Status(Status::Scanning));
        sink.publish(Update::Sample(sample(1)));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Update::Status(Status::Scanning),
                Update::Sample(sample(1))
            ]
        );
    }

    #[test]
    fn unbounded_senders_are_sinks() {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        sender.publish(Update::Status(Status::Connecting));
        sender.publish(Update::Sample(sample(7)));
        drop(sender);

        assert_eq!(
            receiver.try_recv(),
            Ok(Update::Status(Status::Connecting))
        );
        assert_eq!(receiver.try_recv(), Ok(Update::Sample(sample(7))));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn publishing_after_the_receiver_is_gone_is_silent() {
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);

        sender.publish(Update::Status(Status::Closed));
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn broadcast_streams_see_updates_in_order() {
        let broadcast = UpdateBroadcast::default();
        let mut updates = broadcast.stream();
        let mut samples = broadcast.sample_stream();

        broadcast.publish(Update::Status(Status::Subscribed));
        broadcast.publish(Update::Sample(sample(3)));
        broadcast.publish(Update::Sample(sample(4)));

        assert_eq!(
            updates.next().await,
            Some(Update::Status(Status::Subscribed))
        );
        assert_eq!(updates.next().await, Some(Update::Sample(sample(3))));
        assert_eq!(samples.next().await.map(|s| s.value), Some(3));
        assert_eq!(samples.next().await.map(|s| s.value), Some(4));
    }

    #[tokio::test]
    async fn closing_ends_streams() {
        let broadcast = UpdateBroadcast::default();
        let mut updates = broadcast.stream();

        broadcast.close_streams();

        assert_eq!(updates.next().await, None);
    }
}
