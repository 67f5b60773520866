//! Asks for events and throws them away. Used to exercise a distributor without real workers.

use std::process::ExitCode;

use clap::Parser;
use farmnet::{
    cli::{self, CommonArgs},
    connection::InputKind,
    role::ReadySender,
    SocketMode,
};

/// Load-balanced input, no output.
#[derive(Debug, Parser)]
#[command(name = "ready-sender", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = &cli.common;
    cli::run(args, |ctx, counters| async move {
        let input = args.input_link(SocketMode::Connect)?;
        let kind = args.input_kind_or(InputKind::LoadBalanced);
        ReadySender::new(&ctx, &args.description, kind, &input, counters)
            .await?
            .run()
            .await?;
        Ok(())
    })
    .into()
}
