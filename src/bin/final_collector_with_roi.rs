//! Terminates a farm: every event goes to a storage sink and a region-of-interest sink.

use std::process::ExitCode;

use clap::Parser;
use farmnet::{
    cli::{self, CommonArgs},
    connection::InputKind,
    role::{DualRawFanOut, FinalCollectorWithRoi},
    SocketMode,
};

/// Confirmed or load-balanced input, two raw outputs (`-o storage -o roi`).
#[derive(Debug, Parser)]
#[command(name = "final-collector-with-roi", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = &cli.common;
    cli::run(args, |ctx, counters| async move {
        let kind = args.input_kind_or(InputKind::Confirmed);
        let input_mode = match kind {
            InputKind::LoadBalanced => SocketMode::Connect,
            InputKind::Confirmed | InputKind::Raw => SocketMode::Bind,
        };
        let input = args.input_link(input_mode)?;
        let storage = args.output_link(0, SocketMode::Bind)?;
        let roi = args.output_link(1, SocketMode::Bind)?;
        let output = DualRawFanOut::open(&ctx, &storage, &roi, counters.clone()).await?;
        FinalCollectorWithRoi::new(&ctx, &args.description, kind, &input, output, counters)
            .await?
            .run()
            .await?;
        Ok(())
    })
    .into()
}
