use mealmind_verifier::{app, state::AppState, verification};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "mealmind_verifier=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let app_state = AppState::init().await?;

    if let Some(handle) = verification::spawn_interval(app_state.clone()) {
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler task stopped");
            }
        });
    }

    app::serve(app::build_app(app_state)).await
}
