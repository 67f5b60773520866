//! Collects events from many peers and forwards them over a single confirmed hop.

use std::process::ExitCode;

use clap::Parser;
use farmnet::{
    cli::{self, CommonArgs},
    connection::InputKind,
    role::{ConfirmedForward, ProxyCollector},
    SocketMode,
};

/// Confirmed input, confirmed output.
#[derive(Debug, Parser)]
#[command(name = "proxy-collector", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = &cli.common;
    cli::run(args, |ctx, counters| async move {
        let input = args.input_link(SocketMode::Bind)?;
        let output = args.output_link(0, SocketMode::Connect)?;
        let kind = args.input_kind_or(InputKind::Confirmed);
        let output = ConfirmedForward::open(&ctx, &output, counters.clone()).await?;
        ProxyCollector::new(&ctx, &args.description, kind, &input, output, counters)
            .await?
            .run()
            .await?;
        Ok(())
    })
    .into()
}
