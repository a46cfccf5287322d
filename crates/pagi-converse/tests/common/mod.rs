//! Shared helpers: `sh -c` capture tools and a loopback realtime server.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use pagi_converse::{AudioRecorder, RecorderTool};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A capture "tool" that runs `script` under `sh -c`. Placeholders are filled before spawning.
pub fn sh_tool(script: &str) -> RecorderTool {
    RecorderTool::Custom {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

pub fn sh_recorder(script: &str) -> AudioRecorder {
    AudioRecorder::with_tools(vec![sh_tool(script)])
}

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Accept realtime connections on a loopback port; each one is handed to `script`.
pub async fn spawn_realtime_server<F, Fut>(script: F) -> SocketAddr
where
    F: Fn(ServerSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                tokio::spawn(script(ws));
            }
        }
    });
    addr
}

pub fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}/v1/speech-to-text/realtime", addr)
}

/// Wait for the next client text frame, parsed as JSON. `None` once the client goes away.
pub async fn next_json(ws: &mut ServerSocket) -> Option<serde_json::Value> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

pub async fn send_json(ws: &mut ServerSocket, value: serde_json::Value) {
    let _ = ws.send(Message::Text(value.to_string())).await;
}

pub fn transcript(kind: &str, text: &str) -> serde_json::Value {
    serde_json::json!({ "message_type": kind, "text": text })
}

/// Read and discard client frames until the socket closes.
pub async fn drain(mut ws: ServerSocket) {
    while next_json(&mut ws).await.is_some() {}
}
