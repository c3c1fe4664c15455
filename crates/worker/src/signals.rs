use tracing::{info, warn};

use jobsync_infra::workers::WorkerControl;

/// Request a cooperative shutdown on SIGINT or SIGTERM.
pub fn spawn_shutdown_listener(control: WorkerControl) {
    tokio::spawn(async move {
        tokio::select! {
            signal = shutdown_signal() => {
                info!(signal, current_job = ?control.current_job(), "shutdown requested, finishing current job");
                control.request_shutdown();
            }
            _ = control.cancelled() => {}
        }
    });
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = ctrl_c => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                ctrl_c.await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        "ctrl-c"
    }
}
