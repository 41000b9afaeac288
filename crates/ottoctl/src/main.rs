//! Otto CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;
use otto_common::config::ConfigSet;
use otto_common::os_adapter::LocalOsAdapter;
use otto_common::services::Services;
use otto_common::web_engine::DisconnectedWebEngine;
use ottoctl::cli::{Cli, Commands, PolicyCommands};
use ottoctl::commands;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ottoctl=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let cli = Cli::parse();
    let config_dir = resolve_dir(cli.config_dir.clone(), "OTTO_CONFIG_DIR", "./config");
    let data_dir = resolve_dir(cli.data_dir.clone(), "OTTO_DATA_DIR", "./data");

    let code = match &cli.command {
        Commands::Templates { dir } => commands::templates(dir),
        Commands::Validate { file } => commands::validate(file),
        Commands::Run {
            file,
            auto_approve,
            vars,
            role,
        } => {
            let config = ConfigSet::load(&config_dir, &data_dir)
                .with_context(|| format!("loading config from {}", config_dir.display()))?;
            let services = Arc::new(Services::new(
                config,
                Arc::new(LocalOsAdapter),
                Arc::new(DisconnectedWebEngine),
            )?);
            commands::run(&services, file, *auto_approve, vars, role.as_deref())
        }
        Commands::List { state, limit } => commands::list(&data_dir, state.as_deref(), *limit),
        Commands::Show { run_id } => commands::show(&data_dir, *run_id),
        Commands::Sign { file, key_id, key } => commands::sign(file, key_id, key),
        Commands::Policy {
            action: PolicyCommands::Test { file },
        } => {
            let config = ConfigSet::load(&config_dir, &data_dir)
                .with_context(|| format!("loading config from {}", config_dir.display()))?;
            commands::policy_test(&config, file)
        }
    };
    std::process::exit(code);
}

fn resolve_dir(flag: Option<PathBuf>, var: &str, default: &str) -> PathBuf {
    flag.or_else(|| std::env::var(var).map(PathBuf::from).ok())
        .unwrap_or_else(|| PathBuf::from(default))
}
