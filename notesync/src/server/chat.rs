//! Canned streaming chat.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::AppState;

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<Value>,
    #[serde(default)]
    kb_name: Option<String>,
    #[serde(default)]
    enable_rag: bool,
    #[serde(default)]
    enable_web_search: bool,
}

pub(super) async fn chat_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_chat(socket, state))
}

async fn handle_chat(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    let request = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ChatRequest>(text.as_str()) {
                    Ok(request) => break request,
                    Err(e) => {
                        let frame = json!({
                            "type": "error",
                            "content": format!("invalid chat request: {e}"),
                        });
                        let _ = sink.send(Message::Text(frame.to_string().into())).await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_)) | Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };
    debug!(turns = request.history.len(), "chat request");

    let answer = compose_answer(&request);
    let chunk_delay = state.step / 4;
    for word in answer.split_inclusive(' ') {
        let frame = json!({"type": "stream", "content": word});
        if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
            return;
        }
        tokio::time::sleep(chunk_delay).await;
    }

    let sources = reply_sources(&request);
    let frame = json!({"type": "result", "content": answer, "sources": sources});
    let _ = sink.send(Message::Text(frame.to_string().into())).await;
    let _ = sink.close().await;
}

fn compose_answer(request: &ChatRequest) -> String {
    let question = request.message.trim();
    match request.history.len() {
        0 => format!("You asked: {question}. This is a simulated answer."),
        n => format!(
            "Following up on {n} earlier messages, you asked: {question}. This is a simulated answer."
        ),
    }
}

fn reply_sources(request: &ChatRequest) -> Value {
    let mut rag = Vec::new();
    let mut web = Vec::new();
    if request.enable_rag {
        if let Some(kb) = request.kb_name.as_deref() {
            rag.push(json!({"kb_name": kb, "content": format!("Passage from {kb}")}));
        }
    }
    if request.enable_web_search {
        web.push(json!({"title": "Search result", "url": "https://example.org/search"}));
    }
    json!({"rag": rag, "web": web})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(history: usize, rag: bool, web: bool) -> ChatRequest {
        ChatRequest {
            message: " what is a tide? ".into(),
            history: vec![json!({"role": "user", "content": "hi"}); history],
            kb_name: Some("oceans".into()),
            enable_rag: rag,
            enable_web_search: web,
        }
    }

    #[test]
    fn answer_mentions_history() {
        let first = compose_answer(&request(0, false, false));
        assert!(first.starts_with("You asked: what is a tide?"));
        assert!(compose_answer(&request(2, false, false)).contains("2 earlier messages"));
    }

    #[test]
    fn sources_follow_flags() {
        let sources = reply_sources(&request(0, true, false));
        assert_eq!(sources["rag"].as_array().unwrap().len(), 1);
        assert!(sources["web"].as_array().unwrap().is_empty());
    }
}
