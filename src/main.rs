use std::env;

use gatewayops::auth::generate_credential;
use gatewayops::{app, build_state_from_env};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("generate-key") {
        return generate_key(&args[1..]);
    }

    let state = build_state_from_env().await?;
    let broker = state.broker.clone();
    let app = app(state);

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    broker.close_all().await;
    Ok(())
}

/// `gatewayops generate-key <environment> [org_id] [user_id]`: print a new
/// credential once, together with the record to add to `GATEWAY_CONFIG`.
fn generate_key(args: &[String]) -> anyhow::Result<()> {
    let environment = args
        .first()
        .ok_or_else(|| anyhow::anyhow!("usage: gatewayops generate-key <environment> [org_id] [user_id]"))?;
    let org_id = args.get(1).map(String::as_str).unwrap_or("default");
    let user_id = args.get(2).map(String::as_str).unwrap_or("default");
    let generated = generate_credential(environment, org_id, user_id, argon2::Params::default())
        .map_err(|e| anyhow::anyhow!("cannot generate credential: {e}"))?;
    println!("{}", generated.raw);
    println!("{}", serde_json::to_string_pretty(&generated.stored)?);
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
