use reactive_lock::{create_root_logger_for_stdout, shutdown_signal, LockStatusServer, LockStatusServerOptions};
use std::error::Error;
use std::net::SocketAddr;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:50051";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let listen_addr = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
    let socket_addr: SocketAddr = listen_addr.parse()?;

    let logger = create_root_logger_for_stdout("reactive-lock-server");
    let server = LockStatusServer::new(logger.clone(), LockStatusServerOptions::default())?;

    let (shutdown_handle, signal) = shutdown_signal();
    let ctrl_c_logger = logger.clone();
    tokio::task::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => slog::info!(ctrl_c_logger, "Received Ctrl-C, shutting down."),
            Err(e) => slog::error!(ctrl_c_logger, "Cannot listen for Ctrl-C, shutting down: {}", e),
        }
        drop(shutdown_handle);
    });

    server.run(socket_addr, signal).await?;
    Ok(())
}
