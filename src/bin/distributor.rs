//! Reads events from one upstream source and fans them out to the workers of a farm.

use std::process::ExitCode;

use clap::Parser;
use farmnet::{
    cli::{self, CommonArgs},
    connection::InputKind,
    role::Distributor,
    SocketMode,
};

/// Farm entry point: confirmed or raw input, load-balanced output.
#[derive(Debug, Parser)]
#[command(name = "distributor", version)]
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
        Distributor::new(&ctx, &args.description, kind, &input, &output, counters)
            .await?
            .run()
            .await?;
        Ok(())
    })
    .into()
}
