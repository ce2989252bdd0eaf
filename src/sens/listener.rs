use super::Reading;
use async_channel::{Sender, TrySendError};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Receives every successfully decoded [`Reading`].
///
/// The communicator calls `callback` synchronously on its worker thread, so a
/// slow listener stalls the poll cadence and delays `pause`/`finish`.
pub trait Listener: Send + Sync {
    fn callback(&self, reading: Reading) -> anyhow::Result<()>;
}

impl<F> Listener for F
where
    F: Fn(Reading) -> anyhow::Result<()> + Send + Sync,
{
    fn callback(&self, reading: Reading) -> anyhow::Result<()> {
        self(reading)
    }
}

/// Keeps every reading in arrival order.
#[derive(Debug, Default)]
pub struct BufferingListener {
    readings: Mutex<Vec<Reading>>,
}

impl BufferingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the readings received so far; later arrivals are not reflected.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Reading>> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Listener for BufferingListener {
    fn callback(&self, reading: Reading) -> anyhow::Result<()> {
        self.lock().push(reading);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampedReading {
    pub timestamp: DateTime<Utc>,
    pub reading: Reading,
}

/// Forwards readings to an async consumer, such as a console printer.
///
/// Never blocks the worker: a full or closed channel fails the callback.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: Sender<StampedReading>,
}

impl ChannelListener {
    pub fn new(sender: Sender<StampedReading>) -> Self {
        Self { sender }
    }
}

impl Listener for ChannelListener {
    fn callback(&self, reading: Reading) -> anyhow::Result<()> {
        let message = StampedReading {
            timestamp: Utc::now(),
            reading,
        };
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow::anyhow!("reading channel is full")),
            Err(TrySendError::Closed(_)) => Err(anyhow::anyhow!("reading channel is closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sens::decode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn reading(raw: f64) -> Reading {
        decode(raw, Duration::ZERO)
    }

    #[test]
    fn buffers_in_arrival_order() {
        let listener = BufferingListener::new();
        let (r1, r2, r3) = (reading(1.0), reading(2.0), reading(3.0));
        for r in [r1, r2, r3] {
            listener.callback(r).unwrap();
        }
        assert_eq!(listener.snapshot(), vec![r1, r2, r3]);
        assert_eq!(listener.len(), 3);
    }

    #[test]
    fn clear_then_append() {
        let listener = BufferingListener::new();
        listener.callback(reading(1.0)).unwrap();
        listener.callback(reading(2.0)).unwrap();
        listener.clear();
        assert!(listener.is_empty());

        let r4 = reading(4.0);
        listener.callback(r4).unwrap();
        assert_eq!(listener.snapshot(), vec![r4]);
    }

    #[test]
    fn snapshot_does_not_track_later_appends() {
        let listener = BufferingListener::new();
        listener.callback(reading(1.0)).unwrap();
        let snapshot = listener.snapshot();
        listener.callback(reading(2.0)).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(listener.len(), 2);
    }

    #[test]
    fn closures_are_listeners() {
        let count = AtomicUsize::new(0);
        let listener = |_: Reading| -> anyhow::Result<()> {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        listener.callback(reading(1.0)).unwrap();
        listener.callback(reading(2.0)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn channel_listener_forwards_stamped_readings() {
        let (sender, receiver) = async_channel::bounded(4);
        let listener = ChannelListener::new(sender);
        let r = reading(58.0);
        listener.callback(r).unwrap();

        let stamped = receiver.try_recv().unwrap();
        assert_eq!(stamped.reading, r);
        assert!(stamped.timestamp <= Utc::now());
    }

    #[test]
    fn channel_listener_fails_instead_of_blocking() {
        let (sender, receiver) = async_channel::bounded(1);
        let listener = ChannelListener::new(sender);
        listener.callback(reading(1.0)).unwrap();
        assert!(listener.callback(reading(2.0)).is_err());

        drop(receiver);
        assert!(listener.callback(reading(3.0)).is_err());
    }
}
