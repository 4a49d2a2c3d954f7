//! Integration tests for webhook delivery against a local HTTP listener.

use std::sync::Arc;
use std::time::Duration;

use conductor_events::{
    EventLog, PipelineEvent, SIGNATURE_HEADER, WebhookConfig, WebhookError, WebhookNotifier,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.expect("read request");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = header_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let content_length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Accept connections, answer each with `status`, and forward the raw
/// requests.
async fn spawn_endpoint(status: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let request = read_request(&mut socket).await;
            let response =
                format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
            let _ = tx.send(request);
        }
    });
    (format!("http://{addr}/hook"), rx)
}

fn sample_event() -> PipelineEvent {
    PipelineEvent::new("pipeline.failed", "feat-login", json!({ "step": "review" }))
}

#[tokio::test]
async fn successful_delivery_sends_signed_json() -> anyhow::Result<()> {
    let (url, mut requests) = spawn_endpoint("200 OK").await;
    let mut config = WebhookConfig::new(url);
    config.secret = Some("s3cret".to_string());
    let notifier = WebhookNotifier::new(config)?;
    let event = sample_event();

    notifier.deliver(&event).await?;

    let request = requests.recv().await.expect("request captured").to_lowercase();
    let body = serde_json::to_vec(&event)?;
    let expected_signature = notifier.signature(&body)?.expect("secret configured");
    assert!(request.starts_with("post /hook"));
    assert!(request.contains(&format!("{SIGNATURE_HEADER}: {expected_signature}")));
    assert!(request.contains("x-conductor-event: pipeline.failed"));
    assert!(request.contains("\"request_id\":\"feat-login\""));
    Ok(())
}

#[tokio::test]
async fn non_success_status_is_a_delivery_failure() -> anyhow::Result<()> {
    let (url, _requests) = spawn_endpoint("500 Internal Server Error").await;
    let notifier = WebhookNotifier::new(WebhookConfig::new(url))?;

    let err = notifier
        .deliver(&sample_event())
        .await
        .expect_err("500 must fail");

    assert!(matches!(err, WebhookError::Status { status: 500, .. }));
    Ok(())
}

#[tokio::test]
async fn attached_notifier_delivers_only_allowed_events() -> anyhow::Result<()> {
    let (url, mut requests) = spawn_endpoint("204 No Content").await;
    let mut config = WebhookConfig::new(url);
    config.events = vec!["pipeline.failed".to_string()];
    let notifier = Arc::new(WebhookNotifier::new(config)?);
    let log = EventLog::in_memory();
    notifier.attach(&log);

    log.publish(PipelineEvent::new("pipeline.started", "feat-login", json!({})))?;
    log.publish(sample_event())?;

    let request = tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await?
        .expect("request captured");
    assert!(request.to_lowercase().contains("x-conductor-event: pipeline.failed"));

    let extra = tokio::time::timeout(Duration::from_millis(200), requests.recv()).await;
    assert!(extra.is_err(), "filtered event must not be delivered");
    Ok(())
}
