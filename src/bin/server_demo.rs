//! Runnable Modbus TCP server demo.
//!
//! Starts a single-slave server on 0.0.0.0:5020 with all four banks
//! spanning the first 1000 addresses. Point any Modbus TCP client at it.

use std::sync::Arc;

use modbus_slave::{start_tcp_server, DeviceIdentity, ServerConfig, ServerContext, SlaveContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modbus_slave=debug".into()),
        )
        .init();

    let context = Arc::new(ServerContext::single(SlaveContext::new(1000)));
    let config = ServerConfig {
        identity: DeviceIdentity {
            vendor_name: "modbus-slave".to_string(),
            product_code: "demo".to_string(),
            revision: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    let addr = "0.0.0.0:5020".parse()?;
    println!("Modbus TCP server listening on {addr}, ctrl-c to stop");
    let server = tokio::spawn(start_tcp_server(context, addr, config));

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    modbus_slave::server_async_stop().await?;
    server.await??;
    Ok(())
}
