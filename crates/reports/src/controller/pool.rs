//! Fixed-size worker pool with a bounded backlog.
//!
//! Jobs go through a `sync_channel` sized to the backlog; `submit` uses
//! `try_send`, so a full backlog is reported to the caller instead of
//! blocking it. Closing the channel lets workers drain what is queued and exit.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error};

use stockview_core::lock_or_recover;

use crate::error::ControllerError;

const SOURCE: &str = "reports::controller::pool";

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub(crate) struct WorkerPool {
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    backlog: usize,
}

impl WorkerPool {
    pub fn new(name: &str, workers: usize, backlog: usize) -> Self {
        let workers = workers.max(1);
        let backlog = backlog.max(1);
        let (tx, rx) = mpsc::sync_channel::<Job>(backlog);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(rx))
                    .expect("failed to spawn report worker thread")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            backlog,
        }
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub fn submit(&self, job: Job) -> Result<(), ControllerError> {
        let sender = lock_or_recover(&self.sender, SOURCE, "submit");
        let Some(tx) = sender.as_ref() else {
            return Err(ControllerError::ShuttingDown);
        };
        tx.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => ControllerError::BacklogFull {
                capacity: self.backlog,
            },
            TrySendError::Disconnected(_) => ControllerError::ShuttingDown,
        })
    }

    /// Stop accepting jobs and wait until every queued job has run.
    pub fn shutdown(&self) {
        drop(lock_or_recover(&self.sender, SOURCE, "shutdown").take());

        let handles: Vec<_> = lock_or_recover(&self.workers, SOURCE, "shutdown")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = lock_or_recover(&rx, SOURCE, "recv").recv();
        match job {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("report job panicked outside the task boundary");
                }
            }
            Err(_) => break,
        }
    }
    debug!("report worker exiting");
}
