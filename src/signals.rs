use std::sync::Arc;

use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio_util::sync::CancellationToken;

use crate::queue::TaskQueue;
use crate::store::EntityStore;

/// Cancels `shutdown` on SIGINT or SIGTERM.
pub fn handle_shutdown(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            shutdown.cancel();
        }
    });
    Ok(())
}

/// Runs a recovery scan on every SIGHUP.
pub fn handle_reload(
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn TaskQueue>,
    rt_handle: tokio::runtime::Handle,
) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    std::thread::spawn(move || {
        for _ in signals.forever() {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Reloading]);
            log::info!("Received SIGHUP, re-queueing in-flight work");
            let store = Arc::clone(&store);
            let queue = Arc::clone(&queue);
            rt_handle.block_on(async move {
                if let Err(err) = crate::recovery::recover(store.as_ref(), queue.as_ref()).await {
                    log::error!("Recovery scan failed: {err}");
                }
            });
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
        }
    });
    Ok(())
}
