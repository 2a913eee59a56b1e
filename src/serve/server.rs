//! TCP lifecycle: listen, accept, one worker per client.
//!
//! Each accepted client gets three tasks: the worker (producer), the
//! ring-buffer drainer, and the command reader feeding the shared
//! command slot from the client's inbound bytes. Worker completions are
//! awaited by a reaper task, with no process-global signal state. A worker
//! failing tears down its client; the server keeps listening.

use super::command::{read_commands, CommandState};
use super::orchestrator::Worker;
use super::writer::{spawn_drainer, TsWriter, WriterConfig};
use super::ServeConfig;
use crate::error::{Result, TsKitError};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Listens on the configured port and serves clients until the process
/// is stopped.
pub async fn serve(config: ServeConfig) -> Result<()> {
    let config = Arc::new(config);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    log::info!("listening on port {}", config.port);

    // Completed workers are awaited here so failures surface in the log
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JoinHandle<Result<()>>>();
    let reaper = tokio::spawn(async move {
        while let Some(handle) = done_rx.recv().await {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if matches!(e, TsKitError::ClientDisconnected) => {}
                Ok(Err(e)) => log::error!("worker failed: {}", e),
                Err(e) => log::error!("worker panicked: {}", e),
            }
        }
    });

    loop {
        let (socket, peer) = listener.accept().await?;
        log::info!("client connected from {}", peer);
        let handle = spawn_client(socket, config.clone());
        if done_tx.send(handle).is_err() {
            break;
        }
    }

    drop(done_tx);
    let _ = reaper.await;
    Ok(())
}

/// Wires one client's worker, drainer and command reader.
pub fn spawn_client(socket: TcpStream, config: Arc<ServeConfig>) -> JoinHandle<Result<()>> {
    let (read_half, write_half) = socket.into_split();

    let writer_config = WriterConfig {
        pes_padding: config.pes_padding,
        drop: config.drop,
        ..Default::default()
    };
    let (writer, ring) = TsWriter::channel(writer_config);
    let drainer = spawn_drainer(ring, write_half, config.pace);

    let cmd = CommandState::new();
    let command_reader = tokio::spawn(read_commands(read_half, cmd.clone()));

    let worker = Worker::new(config, writer, cmd);
    tokio::spawn(async move {
        let result = worker.run().await;
        command_reader.abort();
        // the writer was dropped with the worker; the drainer flushes
        // what is queued and exits
        let _ = drainer.await;
        result
    })
}
