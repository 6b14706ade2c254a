//! Latest-wins device writer
//!
//! The engine and the lighting controller never write to a port directly.
//! They publish the job they want on the device and a writer task carries
//! it out. Only the newest job is kept: anything published while a job is
//! on the wire (or while the device is settling) is folded into the
//! previous pending job with `DeviceJob::merge` instead of queueing behind
//! it. For most devices that simply means the newer job replaces it.

use super::transport::SerialTransport;
use log::{debug, warn};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Work for one device
pub trait DeviceJob: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Frames to write, in order
    fn frames(&self) -> Vec<Vec<u8>>;

    /// Fold a newer job into this one while it is still pending
    fn merge(self, newer: Self) -> Self {
        newer
    }
}

/// Pending job, numbered so the publisher can tell whether the writer has
/// already picked it up
#[derive(Debug, Clone)]
struct Slot<J> {
    seq: u64,
    job: J,
}

/// Writer timing
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterOptions {
    /// Quiet time after a job before the next one may start
    pub settle: Duration,
    /// Delay between consecutive frames of one job
    pub frame_gap: Duration,
    /// Skip a job equal to the last one that went out successfully
    pub skip_repeats: bool,
}

/// Handle to a running writer task
pub struct LatestWriter<J: DeviceJob> {
    tx: watch::Sender<Option<Slot<J>>>,
    /// Sequence number of the last job the writer took
    taken: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl<J: DeviceJob> LatestWriter<J> {
    /// Spawn the writer task on the current runtime
    pub fn spawn(transport: Arc<SerialTransport>, options: WriterOptions) -> Self {
        let (tx, rx) = watch::channel(None);
        let taken = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_writer(transport, rx, Arc::clone(&taken), options));
        Self { tx, taken, task }
    }

    /// Publish a job. A job the writer has not taken yet is merged with it.
    pub fn publish(&self, job: J) {
        self.tx.send_modify(|slot| {
            // Runs under the channel's write lock; the writer records what it
            // took while holding the read lock.
            let taken = self.taken.load(Ordering::SeqCst);
            let next = match slot.take() {
                Some(pending) if pending.seq > taken => {
                    debug!("Merging {:?} into pending {:?}", job, pending.job);
                    Slot {
                        seq: pending.seq + 1,
                        job: pending.job.merge(job),
                    }
                }
                Some(previous) => Slot {
                    seq: previous.seq + 1,
                    job,
                },
                None => Slot {
                    seq: taken + 1,
                    job,
                },
            };
            *slot = Some(next);
        });
    }

    /// Stop accepting jobs and wait for the one in progress to finish
    pub async fn shutdown(self, grace: Duration) {
        drop(self.tx);
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!("Device writer did not finish within {:?}", grace);
        }
    }
}

async fn run_writer<J: DeviceJob>(
    transport: Arc<SerialTransport>,
    mut rx: watch::Receiver<Option<Slot<J>>>,
    taken: Arc<AtomicU64>,
    options: WriterOptions,
) {
    let mut last_sent: Option<J> = None;

    while rx.changed().await.is_ok() {
        let job = {
            let slot = rx.borrow_and_update();
            slot.as_ref().map(|slot| {
                taken.store(slot.seq, Ordering::SeqCst);
                slot.job.clone()
            })
        };
        let Some(job) = job else {
            continue;
        };

        if options.skip_repeats && last_sent.as_ref() == Some(&job) {
            debug!("{}: {:?} already in effect", transport.name(), job);
            continue;
        }

        if write_job(&transport, &job, options.frame_gap).await {
            last_sent = Some(job);
            if !options.settle.is_zero() {
                tokio::time::sleep(options.settle).await;
            }
        }
    }

    debug!("{} writer stopped", transport.name());
}

/// Write every frame of a job; false if any frame was dropped
async fn write_job<J: DeviceJob>(
    transport: &Arc<SerialTransport>,
    job: &J,
    frame_gap: Duration,
) -> bool {
    let mut all_sent = true;

    for (i, frame) in job.frames().into_iter().enumerate() {
        if i > 0 && !frame_gap.is_zero() {
            tokio::time::sleep(frame_gap).await;
        }

        let transport = Arc::clone(transport);
        let result = tokio::task::spawn_blocking(move || transport.send(&frame)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(_)) => all_sent = false, // already logged by the transport
            Err(e) => {
                warn!("Serial write task failed: {}", e);
                all_sent = false;
            }
        }
    }

    all_sent
}
