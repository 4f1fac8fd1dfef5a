use clap::{Arg, Command};
use ferrite_registry::RegistryServer;
use tracing::{error, info};

fn validate_bind_addr(value: &str) -> Result<String, String> {
    value
        .parse::<std::net::SocketAddr>()
        .map(|addr| addr.to_string())
        .map_err(|_| "Invalid bind address".to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "registryd starting");

    let matches = Command::new("Ferrite Registry")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Service registry with heartbeat liveness and push updates")
        .arg(
            Arg::new("bind")
                .help("The address to serve the registry on. Eg. 0.0.0.0:7999")
                .short('b')
                .long("bind")
                .value_parser(validate_bind_addr)
                .default_value("0.0.0.0:7999"),
        )
        .get_matches();

    let bind = matches.get_one::<String>("bind").expect("bind has a default");
    let registry = match RegistryServer::bind(bind).await {
        Ok(registry) => registry,
        Err(err) => {
            error!(error = %err, "failed to bind registry");
            std::process::exit(1);
        }
    };
    info!(addr = %registry.addr(), "registry serving");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "signal handler failed");
    }
    info!("shutting down");
    registry.close();
}
