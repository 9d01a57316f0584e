//! Machine-interface mode: the line protocol over stdin/stdout.

use anyhow::Result;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use crate::controller::{CommandIntake, Controller};
use crate::protocol::{MachineInterface, TimestampMode, spawn_stdin_reader};

pub async fn handle_machine(controller: Controller, timestamp: TimestampMode) -> Result<()> {
    let rx = spawn_stdin_reader();
    let intake = CommandIntake::new(rx);
    let mut iface = MachineInterface::new(controller, tokio::io::stdout(), timestamp);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        // SIGHUP is ignored; keep draining so the default action never fires
        loop {
            sighup.recv().await;
            info!("SIGHUP ignored");
        }
    });

    tokio::select! {
        r = iface.run(intake) => r,
        _ = sigterm.recv() => {
            info!("SIGTERM, shutting down");
            iface.controller_mut().shutdown().await;
            Ok(())
        }
    }
}
