//! `zapctl` — the controller binary.
//!
//! Loads a test plan, drives the handshake and report collection via
//! [`zap::controller::run_test`], and prints the collected reports. A full
//! CLI/aggregation surface is out of scope; this binary is the thinnest
//! possible caller of the in-scope driver.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::SubscriberInitExt;

use zap::config::TestPlan;
use zap::controller;

#[derive(Parser, Debug)]
#[clap(author, version, about = "zap controller", long_about = None)]
struct Args {
    /// Path to a test plan YAML file.
    plan: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Plan(#[from] zap::config::Error),
    #[error(transparent)]
    Run(#[from] controller::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .finish()
        .init();

    let args = Args::parse();
    let plan = TestPlan::load(&args.plan)?;

    tracing::info!(stations = plan.stations.len(), "running test plan");
    let outcome = controller::run_test(&plan).await?;

    for (tid, report) in &outcome.reports {
        println!(
            "tid={tid:#x} batch={batch} received={received} dropped={dropped} out_of_order={ooo} repeated={rep} bps={bps}",
            batch = report.batch,
            received = report.received,
            dropped = report.dropped,
            ooo = report.out_of_order,
            rep = report.repeated,
            bps = report.bits_per_second,
        );
    }

    Ok(())
}
