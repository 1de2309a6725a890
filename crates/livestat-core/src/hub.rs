//! Fan-out of samples to registered consumers.
//!
//! Consumers are held weakly: the hub never keeps a surface alive. Dead
//! entries are pruned on the next publish.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use thiserror::Error;

use crate::sample::Sample;

/// Receives every published sample, synchronously, on the publishing thread.
pub trait SampleConsumer: Send + Sync {
    fn on_sample(&self, sample: &Sample);
}

impl<F> SampleConsumer for F
where
    F: Fn(&Sample) + Send + Sync,
{
    fn on_sample(&self, sample: &Sample) {
        self(sample)
    }
}

/// Token returned by [`BroadcastHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("sample timestamp {got} precedes last published {last}")]
    OutOfOrder { last: u64, got: u64 },
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub delivered: usize,
    pub panicked: usize,
    pub pruned: usize,
}

struct Entry {
    id: u64,
    consumer: Weak<dyn SampleConsumer>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

#[derive(Default)]
struct Published {
    latest: Option<Arc<Sample>>,
    count: u64,
}

#[derive(Default)]
pub struct BroadcastHub {
    registry: Mutex<Registry>,
    /// Timestamp of the last accepted sample. Held across a whole publish so
    /// deliveries never interleave.
    gate: Mutex<Option<u64>>,
    published: Mutex<Published>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` behind the ones already registered. The hub keeps
    /// only a weak reference; drop the `Arc` or call
    /// [`unsubscribe`](Self::unsubscribe) to stop delivery.
    pub fn subscribe<C>(&self, consumer: &Arc<C>) -> SubscriptionHandle
    where
        C: SampleConsumer + 'static,
    {
        let weak: Weak<dyn SampleConsumer> = Arc::downgrade(consumer) as Weak<C>;
        self.subscribe_weak(weak)
    }

    pub fn subscribe_dyn(&self, consumer: &Arc<dyn SampleConsumer>) -> SubscriptionHandle {
        self.subscribe_weak(Arc::downgrade(consumer))
    }

    fn subscribe_weak(&self, consumer: Weak<dyn SampleConsumer>) -> SubscriptionHandle {
        let mut reg = self.registry.lock().unwrap();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.entries.push(Entry { id, consumer });
        log::debug!("consumer {id} subscribed");
        SubscriptionHandle(id)
    }

    /// Returns whether the handle was still registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut reg = self.registry.lock().unwrap();
        let before = reg.entries.len();
        reg.entries.retain(|e| e.id != handle.0);
        before != reg.entries.len()
    }

    /// Consumers still alive.
    pub fn consumer_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.consumer.strong_count() > 0)
            .count()
    }

    /// Deliver one sample to every live consumer in registration order.
    ///
    /// A sample older than the last published one is rejected so consumers
    /// always observe non-decreasing timestamps. A panicking consumer is
    /// logged and skipped; the rest still receive the sample. Consumers may
    /// read [`latest`](Self::latest) but must not publish.
    pub fn publish(&self, sample: Sample) -> Result<Delivery, PublishError> {
        let mut gate = self.gate.lock().unwrap();
        if let Some(last) = *gate
            && sample.timestamp_ms < last
        {
            return Err(PublishError::OutOfOrder {
                last,
                got: sample.timestamp_ms,
            });
        }
        *gate = Some(sample.timestamp_ms);

        let mut delivery = Delivery::default();
        let targets: Vec<(u64, Arc<dyn SampleConsumer>)> = {
            let mut reg = self.registry.lock().unwrap();
            let before = reg.entries.len();
            reg.entries.retain(|e| e.consumer.strong_count() > 0);
            delivery.pruned = before - reg.entries.len();
            reg.entries
                .iter()
                .filter_map(|e| e.consumer.upgrade().map(|c| (e.id, c)))
                .collect()
        };

        let sample = Arc::new(sample);
        {
            let mut published = self.published.lock().unwrap();
            published.latest = Some(sample.clone());
            published.count += 1;
        }
        for (id, consumer) in targets {
            match catch_unwind(AssertUnwindSafe(|| consumer.on_sample(&sample))) {
                Ok(()) => delivery.delivered += 1,
                Err(_) => {
                    log::error!("consumer {id} panicked on sample {}", sample.sequence);
                    delivery.panicked += 1;
                }
            }
        }
        Ok(delivery)
    }

    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.published.lock().unwrap().latest.clone()
    }

    /// Samples published so far.
    pub fn published_count(&self) -> u64 {
        self.published.lock().unwrap().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Sample>>,
    }

    impl SampleConsumer for Recorder {
        fn on_sample(&self, sample: &Sample) {
            self.seen.lock().unwrap().push(sample.clone());
        }
    }

    fn sample(ts: u64, seq: u64) -> Sample {
        Sample {
            timestamp_ms: ts,
            sequence: seq,
            cpu_percent: Some(12.0),
            ram_percent: Some(40.0),
            ..Sample::default()
        }
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    #[test]
    fn three_consumers_one_tick_identical_samples() {
        let hub = BroadcastHub::new();
        let consumers: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
        for c in &consumers {
            hub.subscribe(c);
        }
        let d = hub.publish(sample(1_000, 1)).unwrap();
        assert_eq!(d.delivered, 3);

        let first = consumers[0].seen.lock().unwrap().clone();
        assert_eq!(first.len(), 1);
        for c in &consumers[1..] {
            assert_eq!(*c.seen.lock().unwrap(), first);
        }
    }

    #[test]
    fn registration_order_is_delivery_order() {
        let hub = BroadcastHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut keep = Vec::new();
        for i in 0..4 {
            let o = order.clone();
            let c = Arc::new(move |_: &Sample| o.lock().unwrap().push(i));
            hub.subscribe(&c);
            keep.push(c);
        }
        hub.publish(sample(1, 1)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn dropped_consumer_is_pruned() {
        let hub = BroadcastHub::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        hub.subscribe(&a);
        hub.subscribe(&b);
        drop(b);
        let d = hub.publish(sample(1, 1)).unwrap();
        assert_eq!(d.delivered, 1);
        assert_eq!(d.pruned, 1);
        assert_eq!(hub.consumer_count(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = BroadcastHub::new();
        let a = Arc::new(Recorder::default());
        let h = hub.subscribe(&a);
        assert!(hub.unsubscribe(h));
        assert!(!hub.unsubscribe(h));
        hub.publish(sample(1, 1)).unwrap();
        assert!(a.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_consumer_does_not_starve_others() {
        let hub = BroadcastHub::new();
        struct Broken;
        impl SampleConsumer for Broken {
            fn on_sample(&self, _: &Sample) {
                panic!("render failed");
            }
        }
        let bad = Arc::new(Broken);
        let good = Arc::new(Recorder::default());
        hub.subscribe(&bad);
        hub.subscribe(&good);
        let d = hub.publish(sample(1, 1)).unwrap();
        assert_eq!(d.panicked, 1);
        assert_eq!(d.delivered, 1);
        assert_eq!(good.seen.lock().unwrap().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[test]
    fn older_sample_rejected() {
        let hub = BroadcastHub::new();
        let a = Arc::new(Recorder::default());
        hub.subscribe(&a);
        hub.publish(sample(2_000, 1)).unwrap();
        hub.publish(sample(2_000, 2)).unwrap();
        assert_eq!(
            hub.publish(sample(1_999, 3)),
            Err(PublishError::OutOfOrder { last: 2_000, got: 1_999 })
        );
        assert_eq!(a.seen.lock().unwrap().len(), 2);
        assert_eq!(hub.latest().unwrap().sequence, 2);
        assert_eq!(hub.published_count(), 2);
    }

    #[test]
    fn concurrent_publishers_never_deliver_out_of_order() {
        let hub = Arc::new(BroadcastHub::new());
        let a = Arc::new(Recorder::default());
        hub.subscribe(&a);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let _ = hub.publish(sample(i * 10 + t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let seen = a.seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
    }
}
