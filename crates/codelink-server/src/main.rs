//! codelink daemon entry point.
//!
//! Builds the pipeline, the SPI interface and the IPC server, then runs
//! until SIGINT or SIGTERM.

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use codelink_core::pipeline::Processor;
use codelink_core::{CancellationToken, ModelProvider, SpiEvent, SpiInterface};
use codelink_server::handler::install_commander;
use codelink_server::{Cli, ControlCodeHandler, InterceptorRegistry, IpcServer, IpcState, SimulatedFirmware};

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = codelink_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "codelinkd starting");

    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(settings) {
        error!(error = %e, "daemon exited with error");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(settings: codelink_core::Settings) -> codelink_core::Result<()> {
    let model = ModelProvider::new();
    let interceptors = InterceptorRegistry::new();
    let handler = ControlCodeHandler::new();
    let commander_slot = handler.commander_slot();

    let (processor, queues) = Processor::new(
        settings.clone(),
        model,
        Box::new(interceptors.clone()),
        Box::new(handler),
    );

    let transport = SimulatedFirmware::new();
    let (interface, commander, mut events) =
        SpiInterface::new(transport, processor.clone(), queues, settings.clone());
    install_commander(&commander_slot, commander.clone());

    let shutdown = CancellationToken::new();

    let spi_task = tokio::spawn(interface.run(shutdown.clone()));

    // Firmware-side requests that need daemon action land here.
    let event_commander = commander.clone();
    let event_shutdown = shutdown.clone();
    let event_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = event_shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                SpiEvent::MacroRequested {
                    invocation,
                    report_missing,
                } => {
                    // No file subsystem; report the macro as done (or missing)
                    // so the firmware does not wait forever.
                    warn!(
                        channel = %invocation.channel,
                        filename = invocation.filename,
                        "macro file execution is not available"
                    );
                    if let Err(e) =
                        event_commander.macro_completed(invocation.channel, report_missing)
                    {
                        warn!(error = %e, "macro completion could not be sent");
                        return;
                    }
                }
                SpiEvent::Connected => info!("firmware link established"),
                SpiEvent::FirmwareReset => warn!("firmware restarted"),
                SpiEvent::FileAborted(channel) => info!(%channel, "file aborted by firmware"),
                SpiEvent::PrintPaused {
                    file_position,
                    reason,
                } => info!(file_position, ?reason, "print paused"),
                SpiEvent::StackChanged { channel, depth } => {
                    info!(%channel, depth, "firmware stack depth changed")
                }
            }
        }
    });

    let state = IpcState {
        processor,
        commander,
        interceptors,
    };
    let server = IpcServer::bind(&settings.socket_path, state)?;
    let ipc_task = tokio::spawn(server.run(shutdown.clone()));

    wait_for_signal().await?;
    info!("shutting down");
    shutdown.cancel();

    for (name, task) in [("spi", spi_task), ("ipc", ipc_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = name, error = %e, "task ended with error"),
            Err(e) => warn!(task = name, error = %e, "task panicked"),
        }
    }
    let _ = event_task.await;
    Ok(())
}

async fn wait_for_signal() -> codelink_core::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
