use std::process;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clusterforge::cli::{
    format_install_hint, format_node_states, format_node_table, format_topology, run_create,
    run_delete_all, run_topology, Cli, CommandError, Commands,
};
use clusterforge::config::load_settings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::Create(args) => run_create(&args, &settings, &cancel).await.map(|outcome| {
            match outcome.plan_path {
                Some(path) => print!("{}", format_install_hint(&path)),
                None => {
                    println!("Your instances are ready.\n");
                    print!("{}", format_node_table(&outcome.cluster));
                }
            }
        }),
        Commands::DeleteAll(args) => run_delete_all(&args, &settings).await.map(|outcome| {
            info!("Delete requested for tag '{}'", outcome.tag);
            println!("Deleted all nodes tagged '{}'", outcome.tag);
            match outcome.key_removed {
                Some(true) => println!("Removed SSH key '{}'", settings.key_name),
                Some(false) => println!("SSH key '{}' was not registered", settings.key_name),
                None => {}
            }
        }),
        Commands::Topology(args) => run_topology(&args).map(|topology| {
            print!("{}", format_topology(&topology));
        }),
    };

    if let Err(e) = result {
        error!("{}", e);
        if let CommandError::Provision(failure) = &e {
            eprint!("{}", format_node_states(&failure.node_states));
        }
        process::exit(1);
    }
}
