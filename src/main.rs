use clap::Parser;
use llmgate::app;
use llmgate::config;
use llmgate::error::ProxyError;

#[derive(Parser)]
#[command(name = "llmgate", version, about = "Multi-provider OpenAI-compatible proxy")]
struct Cli {
    /// Path to the models configuration file
    #[arg(long, default_value = "provider_config.yaml")]
    config: std::path::PathBuf,
    /// Path to a KEY=VALUE env file; the process environment is used when
    /// absent
    #[arg(long)]
    env_file: Option<std::path::PathBuf>,
    /// Listen address override, e.g. 0.0.0.0:8080
    #[arg(long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,llmgate=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ProxyError> {
    let cli = Cli::parse();
    let env = match &cli.env_file {
        Some(path) => config::load_env_file(path)?,
        None => config::process_env(),
    };
    let retry = config::RetryConfig::from_env(&env);
    let runtime = app::RuntimeConfig::from_env(&env, cli.addr)?;
    let file_config = config::load_config(&cli.config)?;
    let state = app::load_state(&file_config, retry, runtime.auth_token.clone())?;
    let router = app::build_app(state);

    let addr: std::net::SocketAddr = runtime.addr.parse().map_err(
        |err: std::net::AddrParseError| {
            ProxyError::configuration(format!("invalid listen address {}: {err}", runtime.addr))
        },
    )?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        ProxyError::configuration(format!("failed to bind {addr}: {err}")).with_cause(err)
    })?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, router).await.map_err(|err| {
        ProxyError::network(format!("server error: {err}")).with_cause(err)
    })?;
    Ok(())
}
