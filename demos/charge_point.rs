//! Minimal OCPP 1.6J charge point: boots, heartbeats, and accepts whatever
//! the central system asks of it.
//!
//! ```bash
//! cargo run --example charge_point ws://127.0.0.1:9000/ocpp/CP-001
//! ```

use futures::{SinkExt, StreamExt};
use ocppg::protocol::{self, Message};
use serde_json::json;
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt::try_init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9000/ocpp/CP-001".to_string());
    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ocpp1.6"));

    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    println!("Connected to {}", url);
    let (mut sink, mut stream) = ws.split();

    let boot = Message::call(
        "boot-1",
        "BootNotification",
        json!({"chargePointVendor": "Demo", "chargePointModel": "Demo-1"}),
    );
    sink.send(WsMessage::Text(protocol::encode(&boot))).await?;

    let mut heartbeat = time::interval(Duration::from_secs(60));
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                seq += 1;
                let hb = Message::call(format!("hb-{}", seq), "Heartbeat", json!({}));
                sink.send(WsMessage::Text(protocol::encode(&hb))).await?;
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(frame))) => {
                        println!("Closed by central system: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                };
                match protocol::decode(&text)? {
                    Message::Call { message_id, action, payload } => {
                        println!("<- {} {}", action, payload);
                        let reply = Message::call_result(message_id, json!({"status": "Accepted"}));
                        sink.send(WsMessage::Text(protocol::encode(&reply))).await?;
                    }
                    Message::CallResult { message_id, payload } => {
                        println!("<- result for {}: {}", message_id, payload);
                        if let Some(interval) = payload.get("interval").and_then(|v| v.as_u64()) {
                            heartbeat = time::interval(Duration::from_secs(interval.max(1)));
                            heartbeat.tick().await;
                        }
                    }
                    Message::CallError { message_id, error_code, error_description, .. } => {
                        println!("<- error for {}: {} {}", message_id, error_code, error_description);
                    }
                }
            }
        }
    }
    Ok(())
}
