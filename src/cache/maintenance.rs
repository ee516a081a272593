use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::coordinator::{CleanupResult, SweepEngine, SweepTrigger};

pub(super) enum Job {
    Sweep {
        trigger: SweepTrigger,
        reply: oneshot::Sender<CleanupResult>,
    },
    Purge {
        reply: oneshot::Sender<CleanupResult>,
    },
}

/// The only task that sweeps or purges. Jobs run one at a time in arrival
/// order; the loop ends once every sender is gone and the queue is drained.
pub(super) fn spawn_sweep_worker(
    engine: Arc<SweepEngine>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Sweep { trigger, reply } => {
                    let result = engine.sweep_all(trigger).await;
                    if reply.send(result).is_err() {
                        trace!(%trigger, "sweep requester went away");
                    }
                }
                Job::Purge { reply } => {
                    let result = engine.purge_all().await;
                    let _ = reply.send(result);
                }
            }
        }
        debug!("cache sweep worker stopped");
    })
}

/// Periodically queues a scheduled sweep when one is due. Returns `None` for
/// a zero interval.
pub(super) fn spawn_scheduler_task(
    engine: Arc<SweepEngine>,
    jobs: mpsc::UnboundedSender<Job>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !engine.should_sweep() {
                continue;
            }
            let (reply, _ignored) = oneshot::channel();
            let job = Job::Sweep {
                trigger: SweepTrigger::Scheduled,
                reply,
            };
            if jobs.send(job).is_err() {
                break;
            }
        }
    }))
}
