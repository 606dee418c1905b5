//! Minimal terminal chat against a running widget gateway, for manual
//! testing: `WIDGET_URL=http://localhost:8090 WIDGET_TOKEN=dev-widget-token
//! widget-chat`.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use odm_widget_client::{ClientNotice, FileStorage, HttpWidgetApi, WidgetHandle};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let base_url = std::env::var("WIDGET_URL").unwrap_or_else(|_| "http://localhost:8090".into());
    let token = std::env::var("WIDGET_TOKEN").unwrap_or_else(|_| "dev-widget-token".into());
    let storage_path = std::env::var("WIDGET_STORAGE")
        .unwrap_or_else(|_| "/tmp/odm-widget-storage.json".into());

    let api = Arc::new(HttpWidgetApi::new(
        reqwest::Client::new(),
        &base_url,
        &token,
    )?);
    let storage = Arc::new(FileStorage::open(storage_path));
    let mut handle = WidgetHandle::spawn(api, storage, &token);

    if let Some(mut notices) = handle.take_notices() {
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                match notice {
                    ClientNotice::MessageReceived(message) => {
                        println!(
                            "[{}] {}",
                            message.sender.id,
                            message.content.unwrap_or_default()
                        );
                    }
                    ClientNotice::SendFailed { content, reason } => {
                        eprintln!("send failed ({reason}): {content}");
                    }
                }
            }
        });
    }

    println!("connected to {base_url} (state: {:?})", handle.state());
    println!("type a message and press enter; ctrl-d to quit");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            handle.send(line).await?;
        }
    }

    handle.shutdown().await;
    Ok(())
}
