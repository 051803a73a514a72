// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use bgp_speaker::config::SpeakerConfig;
use bgp_speaker::connection_tcp::{BgpConnectionTcp, BgpListenerTcp};
use bgp_speaker::service::Service;
use bgp_speaker::session::RouteEvent;
use clap::{Parser, Subcommand};
use slog::{info, warn, Drain, Logger};
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::Builder;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a BGP speaker.
    Run {
        /// JSON speaker configuration.
        #[arg(short, long)]
        config: PathBuf,

        /// Listen address, overriding the configuration.
        #[arg(short, long)]
        listen: Option<String>,

        /// Log received routes.
        #[arg(long, default_value_t = false)]
        log_routes: bool,
    },

    /// Print the JSON schema of the configuration file.
    Schema,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    match args.command {
        Commands::Run {
            config,
            listen,
            log_routes,
        } => run(config, listen, log_routes),
        Commands::Schema => {
            let schema = schemars::schema_for!(SpeakerConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

fn run(path: PathBuf, listen: Option<String>, log_routes: bool) -> Result<()> {
    let log = init_logger();

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut config: SpeakerConfig = serde_json::from_str(&text)
        .with_context(|| format!("parse config {}", path.display()))?;
    if listen.is_some() {
        config.listen = listen;
    }

    let mut service = Service::<BgpConnectionTcp>::new(config, log.clone());
    if log_routes {
        let (tx, rx) = channel::<RouteEvent>();
        service = service.with_route_events(tx);
        let l = log.clone();
        Builder::new().name("route-log".into()).spawn(move || {
            for event in rx.iter() {
                info!(l, "{:?}", event);
            }
        })?;
    }
    let service = Arc::new(service);

    service.listen::<BgpListenerTcp>().context("listen")?;
    service.start().context("start peers")?;
    service.run_sweeper().context("start reconnect sweeper")?;
    info!(log, "speaker running";
        "asn" => service.config.asn,
        "peers" => service.peers().len()
    );

    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("set termination handler")?;

    if stop_rx.recv().is_err() {
        warn!(log, "termination handler gone");
    }
    info!(log, "shutting down");
    service.shutdown();
    Ok(())
}

fn init_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}
