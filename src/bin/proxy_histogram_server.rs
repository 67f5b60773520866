//! Merges histograms from its children and forwards the merge to a parent server.

use std::process::ExitCode;

use clap::Parser;
use farmnet::{
    cli::{self, CommonArgs},
    connection::InputKind,
    role::ProxyHistogramServer,
    SocketMode,
};

/// Confirmed input, confirmed output flushed on a timer.
#[derive(Debug, Parser)]
#[command(name = "proxy-histogram-server", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Source name reported to the parent. Defaults to the description.
    #[arg(long)]
    source_name: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = &cli.common;
    let source_name = cli
        .source_name
        .clone()
        .unwrap_or_else(|| args.description.clone());
    cli::run(args, |ctx, counters| async move {
        let input = args.input_link(SocketMode::Bind)?;
        let output = args.output_link(0, SocketMode::Connect)?;
        let kind = args.input_kind_or(InputKind::Confirmed);
        ProxyHistogramServer::new(
            &ctx,
            &args.description,
            source_name,
            kind,
            &input,
            &output,
            counters,
        )
        .await?
        .run()
        .await?;
        Ok(())
    })
    .into()
}
