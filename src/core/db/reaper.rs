//! Background sweeper that closes idle connections above the pool minimum.

use crate::core::db::pool::PoolShared;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to a running reaper thread.
///
/// The thread holds only a weak reference to the pool, so a forgotten reaper
/// never keeps a pool alive.
pub(crate) struct Reaper {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    pub(crate) fn spawn(pool: Weak<PoolShared>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("dbkit-reaper".to_string())
            .spawn(move || {
                debug!(?interval, "reaper started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(pool) = pool.upgrade() else { break };
                            let reaped = pool.reap();
                            if reaped > 0 {
                                debug!(reaped, "reaper closed idle connections");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("reaper stopped");
            })?;
        Ok(Reaper {
            stop_tx,
            thread: Some(thread),
        })
    }

    /// Signals the thread and waits for it to exit.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
