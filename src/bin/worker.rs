//! Takes events from a distributor one at a time and forwards them to a collector.

use std::process::ExitCode;

use clap::Parser;
use farmnet::{
    cli::{self, CommonArgs},
    connection::InputKind,
    role::Worker,
    SocketMode,
};

/// Load-balanced input, confirmed output.
#[derive(Debug, Parser)]
#[command(name = "worker", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = &cli.common;
    cli::run(args, |ctx, counters| async move {
        let input = args.input_link(SocketMode::Connect)?;
        let output = args.output_link(0, SocketMode::Connect)?;
        let kind = args.input_kind_or(InputKind::LoadBalanced);
        Worker::new(&ctx, &args.description, kind, &input, &output, counters)
            .await?
            .run()
            .await?;
        Ok(())
    })
    .into()
}
