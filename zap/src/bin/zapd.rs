//! `zapd` — the per-host server daemon.
//!
//! Binds the control-plane TCP listener and the shared UDP data socket on
//! `SERVICE_PORT`, then runs the single-threaded station-table actor until
//! `ctrl_c` fires.

use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::SubscriberInitExt;

use zap::server::{self, ServerConfig};
use zap::signals;

#[derive(Parser, Debug)]
#[clap(author, version, about = "zap server daemon", long_about = None)]
struct Args {
    /// Floor for the shared UDP socket's send/receive buffer, bytes.
    /// Grown past this as stations negotiate larger `buf_required` values.
    #[clap(long, default_value_t = ServerConfig::default().udp_buffer_floor)]
    udp_buffer_floor: u32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .finish()
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        udp_buffer_floor: args.udp_buffer_floor,
    };

    let (trigger, shutdown) = signals::pair();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        trigger.fire();
    });

    tracing::info!("zapd starting");
    server::run(config, shutdown).await?;
    tracing::info!("zapd stopped");
    Ok(())
}
