mod config;
mod routes;

use da_llm::make_chat_model;
use da_pipeline::DocumentAssistant;
use dotenv::dotenv;
use routes::{AppState, EnvStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let cfg = config::load_config()?;

    let key_env = cfg.api_key_env();
    let api_key = std::env::var(&key_env).ok();
    let env_status = EnvStatus::inspect(&cfg, api_key.as_deref());
    if !env_status.api_key_configured {
        warn!(env = %key_env, "API key is not set; model calls will fail until it is configured");
    } else if !env_status.api_key_format_valid {
        warn!(env = %key_env, "API key does not look like a valid key");
    }

    let chat_cfg = cfg.chat_provider_config(api_key.as_deref().unwrap_or_default())?;
    let model = make_chat_model(chat_cfg, cfg.request_timeout(), cfg.retry_policy())?;
    let assistant = Arc::new(DocumentAssistant::new(model, cfg.assistant_config()));

    // 定期清理过期会话
    {
        let assistant = assistant.clone();
        let every = Duration::from_secs(cfg.session.ttl_secs.clamp(1, 300));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let purged = assistant.store().purge_expired().await;
                if purged > 0 {
                    info!(purged, "expired document sessions removed");
                }
            }
        });
    }

    let state = AppState {
        assistant,
        env: Arc::new(env_status),
    };
    let app = routes::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    info!(%addr, provider = %cfg.chat_provider.kind, "da-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}
