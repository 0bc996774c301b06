//! Minimal Basic Station: discovers its traffic endpoint, announces its version
//! and prints what the Gateway Server sends back.
//!
//! Usage: `cargo run --example station -- ws://127.0.0.1:1887 01-02-03-04-05-06-07-08 <api-key>`

use std::env;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let base = Url::parse(&args.next().unwrap_or_else(|| "ws://127.0.0.1:1887".into()))?;
    let eui = args.next().unwrap_or_else(|| "01-02-03-04-05-06-07-08".into());
    let key = args.next();

    let (mut discovery, _) = connect_async(base.join("/router-info")?).await?;
    discovery
        .send(Message::Text(json!({ "router": eui }).to_string()))
        .await?;
    let answer: Value = match discovery.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str(&text)?,
        other => anyhow::bail!("unexpected discovery answer: {:?}", other),
    };
    println!("discovery: {}", answer);
    let uri = answer["uri"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("no traffic endpoint: {}", answer))?;

    let mut request = uri.into_client_request()?;
    if let Some(key) = key {
        request.headers_mut().insert("Authorization", key.parse()?);
    }
    let (mut traffic, _) = connect_async(request).await?;
    traffic
        .send(Message::Text(
            json!({
                "msgtype": "version",
                "station": "demo",
                "firmware": "1.0",
                "package": "",
                "model": "demo",
                "protocol": 2,
                "features": ""
            })
            .to_string(),
        ))
        .await?;

    while let Some(msg) = traffic.next().await {
        match msg? {
            Message::Text(text) => println!("{}", text),
            Message::Close(frame) => {
                println!("closed: {:?}", frame);
                break;
            }
            _ => {}
        }
    }
    Ok(())
}
