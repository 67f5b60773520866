//! Command-line plumbing shared by the role binaries.
//!
//! Every binary flattens [`CommonArgs`] into its own parser and hands its role to [`run`], which owns the
//! runtime, the logging setup, the stats file and the exit code:
//!
//! ```no_run
//! use std::process::ExitCode;
//!
//! use clap::Parser;
//! use farmnet::{cli::{self, CommonArgs}, connection::InputKind, role::ReadySender, SocketMode};
//!
//! fn main() -> ExitCode {
//!     let args = CommonArgs::parse();
//!     let args = &args;
//!     cli::run(args, |ctx, counters| async move {
//!         let input = args.input_link(SocketMode::Connect)?;
//!         let kind = args.input_kind_or(InputKind::LoadBalanced);
//!         ReadySender::new(&ctx, &args.description, kind, &input, counters)
//!             .await?
//!             .run()
//!             .await?;
//!         Ok(())
//!     })
//!     .into()
//! }
//! ```

use std::{
    future::Future,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::Context as _;
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use crate::{
    config::TransportConfig,
    connection::InputKind,
    endpoint::{Endpoint, Link, SocketMode},
    metrics::Counters,
    socket::Context,
};

/// Options every role binary accepts.
#[derive(Clone, Debug, Parser)]
pub struct CommonArgs {
    /// Free-text description of this process, attached to every log line.
    pub description: String,

    /// Input endpoint, `tcp://host:port` or `inproc://name`.
    #[arg(short, long)]
    pub input: Option<Endpoint>,

    /// Output endpoint. Repeat for roles with several outputs.
    #[arg(short, long)]
    pub output: Vec<Endpoint>,

    /// Flow-control discipline of the input.
    #[arg(long, value_enum)]
    pub input_kind: Option<InputKind>,

    /// Bind or connect the input, overriding the role's default.
    #[arg(long, value_enum)]
    pub input_mode: Option<SocketMode>,

    /// Bind or connect the outputs, overriding the role's default.
    #[arg(long, value_enum)]
    pub output_mode: Option<SocketMode>,

    /// zlib level for histogram payloads, 0 (stored) to 9.
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=9))]
    pub compression_level: Option<u32>,

    /// TOML file with transport settings.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write the final counters to this JSON file on exit.
    #[arg(long)]
    pub stats_file: Option<PathBuf>,

    /// More logging. Repeat for trace level. `RUST_LOG` takes precedence.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl CommonArgs {
    /// Loads the configuration file, if any, and applies flag overrides.
    pub fn transport_config(&self) -> anyhow::Result<TransportConfig> {
        let mut config = match &self.config {
            Some(path) => TransportConfig::load(path)?,
            None => TransportConfig::default(),
        };
        if let Some(level) = self.compression_level {
            config.compression_level = level;
        }
        Ok(config)
    }

    /// The input, in `default` mode unless `--input-mode` says otherwise.
    pub fn input_link(&self, default: SocketMode) -> anyhow::Result<Link> {
        let endpoint = self.input.clone().context("--input is required")?;
        Ok(Link {
            endpoint,
            mode: self.input_mode.unwrap_or(default),
        })
    }

    /// The `index`th output, in `default` mode unless `--output-mode` says otherwise.
    pub fn output_link(&self, index: usize, default: SocketMode) -> anyhow::Result<Link> {
        let endpoint = self
            .output
            .get(index)
            .cloned()
            .with_context(|| format!("--output #{} is required", index + 1))?;
        Ok(Link {
            endpoint,
            mode: self.output_mode.unwrap_or(default),
        })
    }

    /// The input kind, `default` unless `--input-kind` says otherwise.
    pub fn input_kind_or(&self, default: InputKind) -> InputKind {
        self.input_kind.unwrap_or(default)
    }

    fn env_filter(&self) -> EnvFilter {
        let level = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    }
}

/// How a role process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Drained after TERMINATE.
    Terminated,
    /// Stopped on a fatal error.
    Failed,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Terminated => ExitCode::SUCCESS,
            Outcome::Failed => ExitCode::FAILURE,
        }
    }
}

/// Runs one role on a single-threaded runtime.
///
/// Installs the log subscriber, builds the [`Context`] from the configuration, runs `role` to completion and
/// writes `--stats-file` whatever the outcome.
pub fn run<F, Fut>(args: &CommonArgs, role: F) -> Outcome
where
    F: FnOnce(Context, Arc<Counters>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    // A subscriber installed by an embedding process stays in place.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(args.env_filter())
        .try_init();

    let config = match args.transport_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "invalid configuration");
            return Outcome::Failed;
        }
    };
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start runtime");
            return Outcome::Failed;
        }
    };

    let counters = Arc::new(Counters::default());
    let result = runtime.block_on(role(Context::new(config), counters.clone()));

    if let Some(path) = &args.stats_file {
        if let Err(err) = write_stats(path, &counters) {
            tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "could not write stats file");
        }
    }

    match result {
        Ok(()) => {
            tracing::info!(role = %args.description, "terminated");
            Outcome::Terminated
        }
        Err(err) => {
            tracing::error!(role = %args.description, error = %format!("{err:#}"), "fatal");
            Outcome::Failed
        }
    }
}

/// Writes a counter snapshot as pretty JSON.
pub fn write_stats(path: &Path, counters: &Counters) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(&counters.snapshot())?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CommonArgs {
        CommonArgs::try_parse_from(std::iter::once("role").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let args = parse(&["farm-1 distributor", "-i", "tcp://*:5000", "-o", "inproc://workers"]);

        assert_eq!(args.description, "farm-1 distributor");
        assert_eq!(
            args.input_link(SocketMode::Bind).unwrap(),
            Link::bind(Endpoint::tcp("*", 5000))
        );
        assert_eq!(
            args.output_link(0, SocketMode::Bind).unwrap(),
            Link::bind(Endpoint::inproc("workers"))
        );
        assert_eq!(args.input_kind_or(InputKind::Confirmed), InputKind::Confirmed);
        assert_eq!(args.transport_config().unwrap(), TransportConfig::default());
    }

    #[test]
    fn overrides_win() {
        let args = parse(&[
            "worker",
            "--input",
            "tcp://dist:5001",
            "--input-mode",
            "bind",
            "--output-mode",
            "connect",
            "--output",
            "tcp://coll:6000",
            "--input-kind",
            "raw",
            "--compression-level",
            "0",
        ]);

        assert_eq!(args.input_link(SocketMode::Connect).unwrap().mode, SocketMode::Bind);
        assert_eq!(args.output_link(0, SocketMode::Bind).unwrap().mode, SocketMode::Connect);
        assert_eq!(args.input_kind_or(InputKind::LoadBalanced), InputKind::Raw);
        assert_eq!(args.transport_config().unwrap().compression_level, 0);
    }

    #[test]
    fn missing_endpoints_and_bad_values_are_reported() {
        let args = parse(&["final", "-o", "tcp://storage:1"]);
        assert!(args.input_link(SocketMode::Bind).is_err());
        let err = args.output_link(1, SocketMode::Bind).unwrap_err();
        assert!(err.to_string().contains("--output #2"));

        assert!(CommonArgs::try_parse_from(["role", "x", "--compression-level", "10"]).is_err());
        assert!(CommonArgs::try_parse_from(["role", "x", "-i", "udp://a:1"]).is_err());
    }

    #[test]
    fn stats_file_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let counters = Counters::default();
        Counters::incr(&counters.events_received);

        write_stats(&path, &counters).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["events_received"], 1);
        assert_eq!(value["sink_degraded"], 0);
    }

    #[test]
    fn exhausted_reconnects_fail_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("farm.toml");
        std::fs::write(
            &config,
            "[reconnect]\ninitial_delay_ms = 5\nmax_delay_ms = 20\nmax_retries = 2\n",
        )
        .unwrap();
        let stats = dir.path().join("stats.json");
        let args = parse(&[
            "stranded worker",
            "-i",
            "inproc://nobody-dispatches",
            "-o",
            "inproc://nobody-collects",
            "--config",
            config.to_str().unwrap(),
            "--stats-file",
            stats.to_str().unwrap(),
        ]);
        let args = &args;

        let outcome = run(args, |ctx, counters| async move {
            let input = args.input_link(SocketMode::Connect)?;
            let output = args.output_link(0, SocketMode::Connect)?;
            crate::role::Worker::new(
                &ctx,
                &args.description,
                InputKind::LoadBalanced,
                &input,
                &output,
                counters,
            )
            .await?
            .run()
            .await?;
            Ok(())
        });

        assert_eq!(outcome, Outcome::Failed);
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&stats).unwrap()).unwrap();
        assert!(value["reconnects_exhausted"].as_u64().unwrap() >= 1);
    }
}
