//! Standalone registry process: listens on one or more transport
//! URIs and brokers peer discovery for a vasio mesh. Carries no simulation
//! state of its own.

use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use vasio::config::ParticipantConfiguration;
use vasio::registry::Registry;
use vasio::VasioError;

/// vasio-registry: discovery broker for a vasio participant mesh.
#[derive(Parser, Debug)]
#[command(name = "vasio-registry", version, about)]
struct Cli {
  /// Transport URI to listen on, e.g. silkit://0.0.0.0:8500. Repeatable.
  #[arg(long = "listen-uri")]
  listen_uri: Vec<String>,

  /// Optional participant configuration document; only its `participant_name`
  /// is meaningful to the registry, which otherwise ignores controller and
  /// middleware configuration sections.
  #[arg(long = "configuration")]
  configuration: Option<String>,
}

fn main() -> ExitCode {
  env_logger::init();
  let cli = Cli::parse();

  match run(cli) {
    Ok(()) => ExitCode::from(0),
    Err(VasioError::Configuration(reason)) | Err(VasioError::Misconfiguration(reason)) => {
      error!("configuration error: {reason}");
      ExitCode::from(2)
    }
    Err(e) => {
      error!("failed to bind registry: {e}");
      ExitCode::from(3)
    }
  }
}

fn run(cli: Cli) -> Result<(), VasioError> {
  if let Some(path) = &cli.configuration {
    let config = ParticipantConfiguration::from_file(path)?;
    info!("loaded participant configuration for '{}' (informational only for the registry)", config.participant_name);
  }

  let mut uris = cli.listen_uri;
  if uris.is_empty() {
    uris.push("silkit://0.0.0.0:8500".to_string());
  }

  let (first, rest) = uris.split_first().expect("uris is non-empty by construction above");
  let mut registry = Registry::bind_uri(first)?;
  for uri in rest {
    // ConnectionManager currently owns a single listening socket; additional
    // `--listen-uri` values are accepted and logged but not yet bound to a
    // second acceptor (see DESIGN.md).
    info!("ignoring additional --listen-uri '{uri}': only the first is bound");
  }

  info!("vasio-registry listening on {}", registry.listen_addr());
  registry.run()
}
