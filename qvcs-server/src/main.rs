//! QVCS Server - revision archive server
//!
//! Serves project archive directories to QVCS clients over TCP:
//! - Archive create, check-in, fetch, lock and label requests
//! - Directory listener registration with pushed change notifications
//! - Heartbeat supervision of every connection

mod handler;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use handler::Server;
use qvcs_core::{ProjectProperties, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "qvcs")]
#[command(author = "QVCS Contributors")]
#[command(version = "0.1.0")]
#[command(about = "QVCS revision archive server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Directory holding qvcs-server.json
        #[arg(short, long, default_value = ".")]
        config_dir: PathBuf,

        /// Listen address, overrides the config file (e.g., 0.0.0.0:9889)
        #[arg(short, long)]
        addr: Option<String>,

        /// Archive root directory, overrides the config file
        #[arg(short = 'r', long)]
        archive_root: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Write a config file with one project
    Init {
        /// Directory to write qvcs-server.json into
        #[arg(short, long, default_value = ".")]
        config_dir: PathBuf,

        /// Project name
        project: String,
    },

    /// Show the effective configuration
    Info {
        #[arg(short, long, default_value = ".")]
        config_dir: PathBuf,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).with(env_filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config_dir, addr, archive_root, debug } => {
            init_tracing(debug);
            let mut config = ServerConfig::load(&config_dir)?;
            if let Some(addr) = addr {
                config.listen_addr = addr.parse().with_context(|| format!("Invalid listen address {}", addr))?;
            }
            if let Some(archive_root) = archive_root {
                config.archive_root = archive_root;
            }
            run(config).await?;
        }

        Commands::Init { config_dir, project } => {
            let mut config = ServerConfig::load(&config_dir)?;
            config.upsert_project(ProjectProperties::new(&project));
            config.save(&config_dir)?;
            std::fs::create_dir_all(config.archive_root.join(&project))
                .with_context(|| format!("Failed to create archive directory for {}", project))?;
            println!("Wrote {}", config_dir.join(qvcs_core::config::SERVER_CONFIG_FILE).display());
            println!("Project {} archives live under {}", project, config.archive_root.join(&project).display());
        }

        Commands::Info { config_dir } => {
            let config = ServerConfig::load(&config_dir)?;
            print_info(&config_dir, &config);
        }
    }

    Ok(())
}

async fn run(config: ServerConfig) -> Result<()> {
    info!("Starting QVCS server on {}", config.listen_addr);
    info!("Archive root: {}", config.archive_root.display());
    std::fs::create_dir_all(&config.archive_root)
        .with_context(|| format!("Failed to create archive root {:?}", config.archive_root))?;

    let server = Arc::new(Server::new(&config.listen_addr.to_string(), &config));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    info!("Server listening on {}", config.listen_addr);
    info!("Serving {} projects", config.projects.len());

    loop {
        let (stream, peer): (_, SocketAddr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.serve(stream, peer).await {
                error!("Error serving {}: {}", peer, e);
            }
        });
    }
}

fn print_info(config_dir: &Path, config: &ServerConfig) {
    println!("Config directory:   {}", config_dir.display());
    println!("Listen address:     {}", config.listen_addr);
    println!("Archive root:       {}", config.archive_root.display());
    println!(
        "Heartbeat:          every {}s, timeout after {} missed",
        config.heartbeat_interval_secs, config.heartbeat_timeout_multiple
    );
    println!("Notification delay: {}ms", config.notify_delay_ms);
    for project in &config.projects {
        println!(
            "Project {}: ignore case {}, compression {:?}, {} branches",
            project.project_name,
            project.ignore_case,
            project.compression,
            project.branches.len()
        );
    }
}
