//! CLI command implementations.

pub mod agent;
pub mod serve;

use dpsync_engine::CancelSignal;
use tracing::info;

/// Blocks until Ctrl-C or until `cancel` fires elsewhere, then fires
/// `cancel`.
///
/// `cancel` fires even if the signal handler could not be installed, so
/// worker threads never outlive the command.
pub fn cancel_on_ctrl_c(cancel: &CancelSignal) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            cancel.cancel();
            return Err(e.into());
        }
    };

    let stopped = {
        let cancel = cancel.clone();
        runtime.spawn_blocking(move || cancel.wait())
    };
    let waited = runtime.block_on(async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("interrupt received, shutting down");
            }
            _ = stopped => info!("workers stopped, shutting down"),
        }
        Ok::<_, Box<dyn std::error::Error>>(())
    });

    // Releases the blocking waiter before the runtime joins it on drop.
    cancel.cancel();
    waited
}

/// Blocks until Ctrl-C.
pub fn wait_for_ctrl_c() -> Result<(), Box<dyn std::error::Error>> {
    current_thread_runtime()?.block_on(tokio::signal::ctrl_c())?;
    info!("interrupt received, shutting down");
    Ok(())
}

fn current_thread_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}
