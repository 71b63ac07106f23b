use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "portico", about = "Portico — control-plane gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration as JSON.
    Get,
    /// Print the config directory path.
    Path,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "portico starting");

    match cli.command {
        Commands::Gateway { bind, port } => {
            let config = portico_config::discover_and_load();
            let bind = bind.unwrap_or(config.gateway.bind.clone());
            let port = port.unwrap_or(config.gateway.port);
            portico_gateway::server::start_gateway(&bind, port).await
        },
        Commands::Config { action } => match action {
            ConfigAction::Get => {
                let config = portico_config::discover_and_load();
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            },
            ConfigAction::Path => {
                match portico_config::config_dir() {
                    Some(dir) => println!("{}", dir.display()),
                    None => eprintln!("no config directory resolved"),
                }
                Ok(())
            },
        },
    }
}
