use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam::channel::{bounded, RecvTimeoutError};
use smtrace::config::Config;
use smtrace::supervisor::Supervisor;
use tracing::{debug, info, warn};

/// Wakeup interval of the otherwise idle main thread.
const IDLE_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for readers to finish after a termination signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

pub fn run(config: Config) -> Result<()> {
    let (signal_tx, signal_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        // a full channel means shutdown is already pending
        let _ = signal_tx.try_send(());
    })
    .context("installing signal handler")?;

    let mut supervisor = Supervisor::start(Arc::new(config));
    if supervisor.readers().count() == 0 {
        bail!("no meter could be started");
    }

    loop {
        match signal_rx.recv_timeout(IDLE_INTERVAL) {
            Ok(()) => {
                info!("termination requested");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                for (device, state) in supervisor.readers() {
                    debug!(device, ?state, "reader");
                }
                if !supervisor.is_alive() {
                    warn!("all readers have stopped");
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    supervisor.stop();
    if !supervisor.wait(SHUTDOWN_GRACE) {
        bail!("readers did not stop within {SHUTDOWN_GRACE:?}");
    }
    supervisor.join();
    info!("all readers stopped");
    Ok(())
}
