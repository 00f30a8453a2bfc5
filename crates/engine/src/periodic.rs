//! A shared timer that coalesces recurring work onto one task.
//!
//! Registrations carry an availability channel and a work function. On
//! each tick every registration runs sequentially; a registration is
//! dropped when its availability channel closes or its work function
//! declines rescheduling. Two driver instances exist in a running
//! system (view refresh and bucket quiescence) so one failure mode
//! cannot starve the other.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// A work function: runs once per tick, returns whether to reschedule.
pub type Work = Box<dyn FnMut() -> BoxFuture<'static, bool> + Send>;

struct Registration {
    avail: watch::Receiver<()>,
    work: Work,
}

/// Handle to a periodic driver task.
pub struct Periodically {
    tx: mpsc::UnboundedSender<Registration>,
}

impl Periodically {
    /// Spawns a driver ticking at `period`.
    pub fn new(period: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(period, rx));
        Arc::new(Periodically { tx })
    }

    /// Registers work. It runs on every tick until `avail` closes or the
    /// work function returns `false`.
    pub fn register(&self, avail: watch::Receiver<()>, work: Work) {
        let _ = self.tx.send(Registration { avail, work });
    }
}

async fn run(period: Duration, mut rx: mpsc::UnboundedReceiver<Registration>) {
    let mut regs: Vec<Registration> = Vec::new();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut open = true;

    loop {
        if open {
            tokio::select! {
                reg = rx.recv() => match reg {
                    Some(r) => regs.push(r),
                    None => open = false,
                },
                _ = ticker.tick() => tick(&mut regs).await,
            }
        } else {
            // Handle dropped: drain the remaining registrations, then stop.
            if regs.is_empty() {
                break;
            }
            ticker.tick().await;
            tick(&mut regs).await;
        }
    }
    debug!("periodic driver stopped");
}

async fn tick(regs: &mut Vec<Registration>) {
    let mut keep = Vec::with_capacity(regs.len());
    for mut reg in regs.drain(..) {
        // A closed availability channel unregisters the work.
        if reg.avail.has_changed().is_err() {
            continue;
        }
        if (reg.work)().await {
            keep.push(reg);
        }
    }
    *regs = keep;
}
