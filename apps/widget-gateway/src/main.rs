use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use odm_core::{InMemoryChannelStore, InMemoryMessageStore, InMemoryTemplateStore};
use odm_dispatch::Dispatcher;
use odm_providers::AdapterRegistry;
use odm_widget_gateway::{
    GatewayConfig, GatewayState, GreetingResponder, WidgetRegistry,
    config::cors_layer, router,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::from_env()?;
    let dispatcher = Dispatcher::new(
        InMemoryMessageStore::shared(),
        InMemoryChannelStore::shared(),
        InMemoryTemplateStore::shared(),
        AdapterRegistry::with_defaults(reqwest::Client::new()),
    );

    let state = Arc::new(GatewayState {
        widgets: WidgetRegistry::new(config.widgets.clone()),
        dispatcher,
        auto_responder: config.greeting.clone().map(|greeting| {
            Arc::new(GreetingResponder { greeting }) as Arc<dyn odm_widget_gateway::AutoResponder>
        }),
    });

    let app = router(state).layer(cors_layer(&config.cors_origins));
    let listener = TcpListener::bind(config.addr).await?;
    info!("widget-gateway listening on {}", config.addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    Ok(())
}
