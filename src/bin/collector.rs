//! Collects events from many workers and re-dispatches them over a load-balanced output.

use std::process::ExitCode;

use clap::Parser;
use farmnet::{
    cli::{self, CommonArgs},
    connection::InputKind,
    role::{Collector, LoadBalancedForward},
    SocketMode,
};

/// Confirmed input, load-balanced output.
#[derive(Debug, Parser)]
#[command(name = "collector", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = &cli.common;
    cli::run(args, |ctx, counters| async move {
        let input = args.input_link(SocketMode::Bind)?;
        let output = args.output_link(0, SocketMode::Bind)?;
        let kind = args.input_kind_or(InputKind::Confirmed);
        let output = LoadBalancedForward::open(&ctx, &output, counters.clone()).await?;
        Collector::new(&ctx, &args.description, kind, &input, output, counters)
            .await?
            .run()
            .await?;
        Ok(())
    })
    .into()
}
