// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - CLI Client
// Command-line interface for talking to Redis, optionally through an SSH tunnel

mod config;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use redis_tunnel_core::{
    Command, ConnectionConfig, ConnectionStatus, RedisClient, Reply, StatusEvent,
};

use config::Overrides;

#[derive(Parser)]
#[command(name = "redis-tunnel")]
#[command(about = "Redis client with SSH tunneling and automatic reconnection", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Configuration file (default: <config_dir>/redis-tunnel/config.toml)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Redis host
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Redis port
    #[arg(short = 'p', long, global = true)]
    port: Option<u16>,

    /// AUTH password
    #[arg(short = 'a', long, env = "REDIS_TUNNEL_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Database number to SELECT
    #[arg(short = 'n', long, global = true)]
    db: Option<u32>,

    /// Use TLS
    #[arg(long, global = true)]
    tls: bool,

    /// SSH jump host to tunnel through
    #[arg(long, global = true)]
    ssh_host: Option<String>,

    /// SSH username
    #[arg(long, global = true)]
    ssh_user: Option<String>,

    /// SSH private key
    #[arg(long, global = true)]
    ssh_key: Option<PathBuf>,
}

impl ConnectionArgs {
    fn resolve(&self) -> Result<ConnectionConfig> {
        config::resolve(
            self.config.as_deref(),
            Overrides {
                host: self.host.clone(),
                port: self.port,
                password: self.password.clone(),
                database: self.db,
                tls: self.tls,
                ssh_host: self.ssh_host.clone(),
                ssh_user: self.ssh_user.clone(),
                ssh_key: self.ssh_key.clone(),
            },
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the server answers PING
    Ping,

    /// Run one command and print the reply
    Exec {
        /// Command and arguments, e.g. `exec SET key value`
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Send several commands in one round trip
    Pipeline {
        /// Commands, each split on whitespace: "SET a 1" "GET a"
        #[arg(required = true, num_args = 1..)]
        commands: Vec<String>,
    },

    /// Stay connected and print status changes until Ctrl-C
    Watch,

    /// Print the default configuration file location
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redis_tunnel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ConfigPath => {
            let path = ConnectionConfig::default_path()
                .context("Could not determine config directory")?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Ping => {
            let client = connect(&cli.connection).await?;
            let result = ping(&client).await;
            client.disconnect().await;
            result
        }
        Commands::Exec { args } => {
            let command = Command::from_args(&args).context("Empty command")?;
            let client = connect(&cli.connection).await?;
            let result = client.execute(&command).await;
            client.disconnect().await;
            print_reply(&result.context("Command failed")?);
            Ok(())
        }
        Commands::Pipeline { commands } => {
            let commands = commands
                .iter()
                .map(|line| {
                    Command::parse(line).with_context(|| format!("Empty command in {:?}", line))
                })
                .collect::<Result<Vec<_>>>()?;
            let client = connect(&cli.connection).await?;
            let result = client.execute_pipeline(&commands).await;
            client.disconnect().await;
            for (idx, reply) in result.context("Pipeline failed")?.iter().enumerate() {
                println!("{}", format!("[{}] {}", idx + 1, commands[idx].name()).dimmed());
                print_reply(reply);
            }
            Ok(())
        }
        Commands::Watch => watch(&cli.connection).await,
    }
}

async fn connect(args: &ConnectionArgs) -> Result<RedisClient> {
    let config = args.resolve()?;
    let endpoint = config.endpoint();
    debug!("Resolved configuration for {}", endpoint);

    let client = RedisClient::new();
    client
        .connect(config)
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;
    Ok(client)
}

async fn ping(client: &RedisClient) -> Result<()> {
    let started = Instant::now();
    let reply = client.execute(&Command::new("PING")).await?.into_result()?;
    let elapsed = started.elapsed();
    if !matches!(&reply, Reply::SimpleString(s) if s == "PONG") {
        bail!("Unexpected reply to PING: {}", reply);
    }
    println!(
        "{} {}",
        "PONG".green().bold(),
        format!("({:.1} ms)", elapsed.as_secs_f64() * 1000.0).dimmed()
    );
    Ok(())
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Error(_) => println!("{}", reply.to_string().red()),
        _ => println!("{}", reply),
    }
}

async fn watch(args: &ConnectionArgs) -> Result<()> {
    let client = RedisClient::new();
    let mut events = client.subscribe();

    let config = args.resolve()?;
    let endpoint = config.endpoint();
    client
        .connect(config)
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    println!("{}", format!("Watching {} (Ctrl-C to stop)", endpoint).cyan());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if event.status.is_failed() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    println!("{}", format!("... {} events missed", missed).dimmed());
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}

fn print_event(event: &StatusEvent) {
    let time = event.timestamp.format("%H:%M:%S").to_string().dimmed();
    let line = match (&event.status, event.attempt) {
        (ConnectionStatus::Connected, _) => format!("{} connected", event.endpoint).green(),
        (ConnectionStatus::Disconnected, _) => {
            format!("{} disconnected", event.endpoint).yellow()
        }
        (ConnectionStatus::Reconnecting, Some(attempt)) => {
            format!("{} reconnecting (attempt {})", event.endpoint, attempt).cyan()
        }
        (ConnectionStatus::Reconnecting, None) => {
            format!("{} reconnecting", event.endpoint).cyan()
        }
        (ConnectionStatus::Failed(reason), _) => {
            format!("{} failed: {}", event.endpoint, reason).red().bold()
        }
    };
    println!("{} {}", time, line);
}
