//! The root of a histogram tree: merges and stores the result as JSON.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use farmnet::{
    cli::{self, CommonArgs},
    connection::InputKind,
    histogram::FileHistogramStore,
    role::RawHistogramServer,
    SocketMode,
};

/// Confirmed input, merged histograms written to a file.
#[derive(Debug, Parser)]
#[command(name = "raw-histogram-server", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// File the merged histograms are written to, replaced atomically on every flush.
    #[arg(long)]
    store: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = &cli.common;
    let store = FileHistogramStore::new(cli.store.clone());
    cli::run(args, |ctx, counters| async move {
        let input = args.input_link(SocketMode::Bind)?;
        let kind = args.input_kind_or(InputKind::Confirmed);
        RawHistogramServer::new(&ctx, &args.description, kind, &input, store, counters)
            .await?
            .run()
            .await?;
        Ok(())
    })
    .into()
}
