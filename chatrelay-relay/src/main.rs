use chatrelay_relay::{AppState, RelayOptions, serve};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatrelay-relay")]
struct RelayArgs {
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind_address: String,

    /// Do not deliver a message back to the connection that sent it.
    #[arg(long, default_value_t = false)]
    no_echo: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    let options = RelayOptions {
        echo_to_sender: !args.no_echo,
        ..RelayOptions::default()
    };
    info!(
        bind_address = %args.bind_address,
        echo_to_sender = options.echo_to_sender,
        "relay starting"
    );
    if let Err(err) = serve(listener, AppState::with_options(options)).await {
        warn!("relay server exited: {}", err);
    }
}
