// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camhub")]
#[command(about = "Discover, configure and stream Linux cameras across backends")]
#[command(version = camhub::constants::app_info::version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected and configured cameras
    List {
        /// Print the camera list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a camera's controls
    Controls {
        /// Camera id (from 'camhub list')
        camera: String,
    },

    /// Set a control value
    Set {
        camera: String,
        control: String,
        value: String,
    },

    /// Reset one control, or all of them, to the default
    Reset {
        camera: String,
        control: Option<String>,
    },

    /// Take a photo
    Photo {
        camera: String,

        /// Output file path (default: photo directory from settings)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Stream a camera to a preview window
    Play {
        camera: String,

        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Add a network camera
    AddUrl { name: String, url: String },

    /// Read or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage saved control profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Check which external tools are installed
    Doctor,

    /// Show which processes hold a device node
    Holders { device: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one setting, or all of them
    Get { key: Option<String> },
    /// Change a setting (values are parsed as JSON when possible)
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum ProfileAction {
    List { camera: String },
    Save { camera: String, name: String },
    Load { camera: String, name: String },
    Delete { camera: String, name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camhub=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List { json } => cli::list_cameras(json).await?,
        Commands::Controls { camera } => cli::show_controls(&camera).await?,
        Commands::Set {
            camera,
            control,
            value,
        } => cli::set_control(&camera, &control, &value).await?,
        Commands::Reset { camera, control } => cli::reset_controls(&camera, control.as_deref()).await?,
        Commands::Photo { camera, output } => cli::take_photo(&camera, output).await?,
        Commands::Play { camera, duration } => cli::play(&camera, duration).await?,
        Commands::AddUrl { name, url } => cli::add_url(&name, &url)?,
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => cli::config_get(key.as_deref())?,
            ConfigAction::Set { key, value } => cli::config_set(&key, &value)?,
        },
        Commands::Profile { action } => match action {
            ProfileAction::List { camera } => cli::profile_list(&camera).await?,
            ProfileAction::Save { camera, name } => cli::profile_save(&camera, &name).await?,
            ProfileAction::Load { camera, name } => cli::profile_load(&camera, &name).await?,
            ProfileAction::Delete { camera, name } => cli::profile_delete(&camera, &name).await?,
        },
        Commands::Doctor => cli::doctor().await?,
        Commands::Holders { device } => cli::holders(&device).await?,
    }
    Ok(())
}
