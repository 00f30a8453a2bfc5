//! Sequence pub/sub: wake waiters once a named sequence reaches a
//! threshold.
//!
//! One hub task serializes every operation, so ordering is total per
//! hub: between two publishes on the same key, all subscribers whose
//! thresholds are crossed by the first receive before those crossed
//! only by the second. Per key the hub tracks the highest value ever
//! published and never rewinds it.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use cask_types::PartitionId;

/// Key under which a partition publishes its CAS sequence.
pub fn partition_seq_key(vbid: PartitionId) -> String {
    format!("vb_{vbid}")
}

enum SeqCmd {
    Sub {
        key: String,
        threshold: i64,
        resp: oneshot::Sender<mpsc::Receiver<i64>>,
    },
    Pub {
        key: String,
        value: i64,
    },
    Delete {
        key: String,
    },
    Stop,
}

#[derive(Default)]
struct KeyState {
    hi: Option<i64>,
    waiters: Vec<(i64, mpsc::Sender<i64>)>,
}

/// A handle to a sequence pub/sub hub.
#[derive(Clone)]
pub struct SequencePubSub {
    tx: mpsc::UnboundedSender<SeqCmd>,
}

impl SequencePubSub {
    /// Spawns a hub.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        SequencePubSub { tx }
    }

    /// Subscribes to `key` reaching `threshold`. The returned channel
    /// delivers the key's high-water mark once the threshold is met
    /// (immediately if it already is), then closes. `delete` and `stop`
    /// close it without a value.
    pub async fn sub(&self, key: impl Into<String>, threshold: i64) -> mpsc::Receiver<i64> {
        let (resp, rx) = oneshot::channel();
        if self
            .tx
            .send(SeqCmd::Sub { key: key.into(), threshold, resp })
            .is_err()
        {
            // Hub already stopped: hand back a closed channel.
            let (_tx, rx) = mpsc::channel(1);
            return rx;
        }
        match rx.await {
            Ok(ch) => ch,
            Err(_) => mpsc::channel(1).1,
        }
    }

    /// Publishes a value; the key's high-water mark becomes
    /// `max(current, value)`.
    pub fn publish(&self, key: impl Into<String>, value: i64) {
        let _ = self.tx.send(SeqCmd::Pub { key: key.into(), value });
    }

    /// Forgets a key: every outstanding subscriber channel closes and
    /// later subscriptions start fresh with no auto-fire.
    pub fn delete(&self, key: impl Into<String>) {
        let _ = self.tx.send(SeqCmd::Delete { key: key.into() });
    }

    /// Shuts the hub down, closing every subscriber channel.
    pub fn stop(&self) {
        let _ = self.tx.send(SeqCmd::Stop);
    }
}

impl Default for SequencePubSub {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<SeqCmd>) {
    let mut keys: HashMap<String, KeyState> = HashMap::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SeqCmd::Sub { key, threshold, resp } => {
                let (tx, sub_rx) = mpsc::channel(1);
                let state = keys.entry(key).or_default();
                match state.hi {
                    Some(hi) if hi >= threshold => {
                        // Already met: fire and forget the sender so the
                        // channel closes behind the value.
                        let _ = tx.try_send(hi);
                    }
                    _ => state.waiters.push((threshold, tx)),
                }
                let _ = resp.send(sub_rx);
            }
            SeqCmd::Pub { key, value } => {
                let state = keys.entry(key).or_default();
                let hi = state.hi.map_or(value, |h| h.max(value));
                state.hi = Some(hi);
                state.waiters.retain(|(threshold, tx)| {
                    if hi >= *threshold {
                        let _ = tx.try_send(hi);
                        false
                    } else {
                        true
                    }
                });
            }
            SeqCmd::Delete { key } => {
                // Dropping the key state drops every waiter's sender,
                // which closes the subscriber channels.
                keys.remove(&key);
            }
            SeqCmd::Stop => break,
        }
    }
    debug!("sequence hub stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    const DEADLINE: Duration = Duration::from_millis(3);

    async fn expect_value(ch: &mut mpsc::Receiver<i64>) -> i64 {
        tokio::time::timeout(DEADLINE, ch.recv())
            .await
            .expect("expected a message")
            .expect("expected a value, got close")
    }

    async fn expect_nothing(ch: &mut mpsc::Receiver<i64>) {
        let res = tokio::time::timeout(DEADLINE, ch.recv()).await;
        assert!(res.is_err(), "expected no message, got {res:?}");
    }

    #[tokio::test]
    async fn publish_without_subscribers() {
        let s = SequencePubSub::new();
        s.publish("a", 845);
        s.stop();
    }

    #[tokio::test]
    async fn stop_closes_subscribers() {
        let s = SequencePubSub::new();
        let mut ch = s.sub("a", 4).await;
        s.stop();
        let got = tokio::time::timeout(Duration::from_millis(50), ch.recv())
            .await
            .expect("close within deadline");
        assert!(got.is_none(), "expected close on stop, got {got:?}");
    }

    #[tokio::test]
    async fn thresholds_fire_independently() {
        let s = SequencePubSub::new();
        let mut ch1a = s.sub("a", 4).await;
        let mut ch1b = s.sub("a", 2).await;
        let mut ch1c = s.sub("a", 10).await;
        let mut ch2a = s.sub("b", 3).await;

        s.publish("a", 3);
        assert_eq!(expect_value(&mut ch1b).await, 3);
        expect_nothing(&mut ch1a).await;
        expect_nothing(&mut ch1c).await;
        expect_nothing(&mut ch2a).await;

        s.publish("a", 15);
        assert_eq!(expect_value(&mut ch1a).await, 15);
        assert_eq!(expect_value(&mut ch1c).await, 15);
        expect_nothing(&mut ch2a).await;
        s.stop();
    }

    #[tokio::test]
    async fn late_registration_fires_immediately() {
        let s = SequencePubSub::new();
        let mut ch1 = s.sub("a", 2).await;
        s.publish("a", 3);
        assert_eq!(expect_value(&mut ch1).await, 3);

        let mut ch2 = s.sub("a", 3).await;
        assert_eq!(expect_value(&mut ch2).await, 3);
        s.stop();
    }

    #[tokio::test]
    async fn high_water_mark_never_rewinds() {
        let s = SequencePubSub::new();
        let mut ch1 = s.sub("a", 2).await;
        s.publish("a", 3);
        assert_eq!(expect_value(&mut ch1).await, 3);

        s.publish("a", 2);
        let mut ch2 = s.sub("a", 3).await;
        assert_eq!(expect_value(&mut ch2).await, 3);
        s.stop();
    }

    #[tokio::test]
    async fn delete_closes_and_forgets() {
        let s = SequencePubSub::new();
        let mut ch1 = s.sub("a", 2).await;
        s.publish("a", 3);
        assert_eq!(expect_value(&mut ch1).await, 3);

        let mut ch2 = s.sub("a", 5).await;
        s.delete("a");
        let got = tokio::time::timeout(DEADLINE, ch2.recv())
            .await
            .expect("close within deadline");
        assert!(got.is_none(), "expected closed channel, got {got:?}");

        // The key starts fresh: no auto-fire from the old mark.
        let mut ch3 = s.sub("a", 3).await;
        expect_nothing(&mut ch3).await;
        s.stop();
    }
}
