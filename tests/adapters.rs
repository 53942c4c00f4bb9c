//! Ollama native endpoints and Baidu translate against raw TCP mocks.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use promptrelay::cancel::InterruptFlag;
use promptrelay::config::{Config, ModelEntry, ProviderConfig, ServiceType};
use promptrelay::dispatch::RequestContext;
use promptrelay::dispatch::baidu::BaiduTranslator;
use promptrelay::dispatch::http::StreamingExecutor;
use promptrelay::dispatch::registry::{Registry, TranslateRequest};
use promptrelay::error::RelayError;
use promptrelay::payload::ChatMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn json_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn serve(listener: TcpListener, responses: Vec<Vec<u8>>) -> (Arc<Mutex<Vec<String>>>, JoinHandle<()>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let handle = tokio::spawn(async move {
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            record.lock().unwrap().push(request);
            socket.write_all(&response).await.unwrap();
            let _ = socket.shutdown().await;
        }
    });
    (seen, handle)
}

fn request_line(request: &str) -> &str {
    request.lines().next().unwrap_or_default()
}

fn body_of(request: &str) -> serde_json::Value {
    let body = request.split("\r\n\r\n").nth(1).unwrap_or_default();
    serde_json::from_str(body).unwrap()
}

fn ollama(port: u16) -> ProviderConfig {
    let mut p = ProviderConfig::new(
        "ollama",
        ServiceType::Ollama,
        &format!("http://127.0.0.1:{port}"),
        "",
    );
    p.disable_thinking = true;
    p
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ollama_text_uses_openai_shim() {
    let (listener, port) = mock_listener().await;
    let sse = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
        data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
    let (seen, server) = serve(listener, vec![sse.as_bytes().to_vec()]);

    let result = StreamingExecutor::new(InterruptFlag::new())
        .execute(
            &ollama(port),
            &ModelEntry::named("qwen3:8b"),
            &[ChatMessage::user("q")],
            &RequestContext::new("ollama-text"),
        )
        .await;
    assert_eq!(result.content(), Some("hi"));
    server.await.unwrap();

    let requests = seen.lock().unwrap();
    assert!(request_line(&requests[0]).starts_with("POST /v1/chat/completions"));
    assert!(!requests[0].to_lowercase().contains("authorization:"));
    assert_eq!(body_of(&requests[0])["think"], false);
}

#[tokio::test]
async fn ollama_images_fall_back_to_generate_then_unload() {
    let (listener, port) = mock_listener().await;
    let (seen, server) = serve(
        listener,
        vec![
            json_response("404 Not Found", r#"{"error":"404 page not found"}"#),
            json_response("200 OK", r#"{"model":"llava","response":"a cat on a mat","done":true}"#),
            json_response("200 OK", r#"{"model":"llava","response":"","done":true}"#),
        ],
    );

    let mut service = ollama(port);
    service.auto_unload = true;
    let messages = [ChatMessage::user_with_images(
        "describe",
        vec!["data:image/png;base64,iVBORw0KGgo=".to_string()],
    )];
    let result = StreamingExecutor::new(InterruptFlag::new())
        .execute(
            &service,
            &ModelEntry::named("llava"),
            &messages,
            &RequestContext::new("ollama-vlm"),
        )
        .await;

    assert_eq!(result.content(), Some("a cat on a mat"));
    server.await.unwrap();

    let requests = seen.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert!(request_line(&requests[0]).starts_with("POST /api/chat"));
    assert_eq!(body_of(&requests[0])["messages"][0]["images"][0], "iVBORw0KGgo=");
    assert!(request_line(&requests[1]).starts_with("POST /api/generate"));
    assert_eq!(body_of(&requests[1])["images"][0], "iVBORw0KGgo=");
    assert!(request_line(&requests[2]).starts_with("POST /api/generate"));
    assert_eq!(body_of(&requests[2])["keep_alive"], 0);
}

#[tokio::test]
async fn ollama_native_chat_success_needs_no_fallback() {
    let (listener, port) = mock_listener().await;
    let (seen, server) = serve(
        listener,
        vec![json_response(
            "200 OK",
            r#"{"message":{"role":"assistant","content":"a red car","thinking":"looking"},"done":true}"#,
        )],
    );

    let messages = [ChatMessage::user_with_images("what", vec!["QUJD".to_string()])];
    let result = StreamingExecutor::new(InterruptFlag::new())
        .execute(
            &ollama(port),
            &ModelEntry::named("qwen2.5vl"),
            &messages,
            &RequestContext::new("ollama-chat"),
        )
        .await;

    assert_eq!(result.content(), Some("<think>looking</think>\n\na red car"));
    server.await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn ollama_server_error_does_not_fall_back() {
    let (listener, port) = mock_listener().await;
    let (seen, server) = serve(
        listener,
        vec![json_response("500 Internal Server Error", r#"{"error":"model crashed"}"#)],
    );

    let messages = [ChatMessage::user_with_images("what", vec!["QUJD".to_string()])];
    let result = StreamingExecutor::new(InterruptFlag::new())
        .execute(
            &ollama(port),
            &ModelEntry::named("llava"),
            &messages,
            &RequestContext::new("ollama-500"),
        )
        .await;

    assert_eq!(result.error().and_then(RelayError::status), Some(500));
    assert!(result.error_message().unwrap().contains("model crashed"));
    server.await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Baidu
// ---------------------------------------------------------------------------

fn baidu_config(port: u16) -> Config {
    Config::from_toml_str(&format!(
        r#"
        [[services]]
        id = "baidu"
        type = "baidu"
        base_url = "http://127.0.0.1:{port}/api/trans/vip/translate"
        app_id = "20240101000000001"
        api_key = "baidu-secret"
        "#
    ))
    .unwrap()
}

#[tokio::test]
async fn baidu_retries_transient_error_with_backoff() {
    let (listener, port) = mock_listener().await;
    let (seen, server) = serve(
        listener,
        vec![
            json_response("200 OK", r#"{"error_code":"52001","error_msg":"TIMEOUT"}"#),
            json_response(
                "200 OK",
                r#"{"from":"zh","to":"en","trans_result":[{"src":"你好","dst":"Hello"}]}"#,
            ),
        ],
    );

    let registry = Registry::from_config(baidu_config(port));
    let req = TranslateRequest {
        service_id: "baidu".into(),
        model: None,
        text: "你好".into(),
        from: "auto".into(),
        to: "en".into(),
    };
    let started = Instant::now();
    let result = registry.translate(&req, RequestContext::new("baidu-c")).await;

    assert_eq!(result.content(), Some("Hello"));
    assert!(started.elapsed() >= Duration::from_secs(2), "backoff respected");
    server.await.unwrap();

    let requests = seen.lock().unwrap();
    assert_eq!(requests.len(), 2);
    for r in requests.iter() {
        assert!(request_line(r).starts_with("POST /api/trans/vip/translate"));
        assert!(r.contains("appid=20240101000000001"));
        assert!(r.contains("sign="));
        assert!(!r.contains("baidu-secret"));
    }
    assert_eq!(registry.in_flight(), 0);
}

#[tokio::test]
async fn baidu_auth_error_is_terminal() {
    let (listener, port) = mock_listener().await;
    let (seen, server) = serve(
        listener,
        vec![json_response("200 OK", r#"{"error_code":"52003","error_msg":"UNAUTHORIZED USER"}"#)],
    );

    let registry = Registry::from_config(baidu_config(port));
    let req = TranslateRequest {
        service_id: "baidu".into(),
        model: None,
        text: "你好".into(),
        from: "zh".into(),
        to: "en".into(),
    };
    let result = registry.translate(&req, RequestContext::new("baidu-auth")).await;

    match result.error() {
        Some(RelayError::Baidu { code, message }) => {
            assert_eq!(code, "52003");
            assert!(message.contains("unauthorized"));
        }
        other => panic!("expected baidu error, got {other:?}"),
    }
    server.await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn baidu_long_text_is_chunked_in_order() {
    let (listener, port) = mock_listener().await;
    let (seen, server) = serve(
        listener,
        vec![
            json_response("200 OK", r#"{"trans_result":[{"src":"a","dst":"first"}]}"#),
            json_response("200 OK", r#"{"trans_result":[{"src":"b","dst":"second"}]}"#),
        ],
    );

    let line = "x".repeat(1500);
    let text = format!("{line}\n{line}");
    let translated = translator(port).translate(&text, "en", "zh").await.unwrap();

    assert_eq!(translated, "first\nsecond");
    server.await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

fn translator(port: u16) -> BaiduTranslator {
    let mut p = ProviderConfig::new(
        "baidu",
        ServiceType::Baidu,
        &format!("http://127.0.0.1:{port}/translate"),
        "secret",
    );
    p.app_id = Some("app".into());
    BaiduTranslator::from_config(&p).unwrap()
}

#[tokio::test]
async fn baidu_gives_up_after_three_attempts() {
    let (listener, port) = mock_listener().await;
    let limited = json_response("200 OK", r#"{"error_code":"54003","error_msg":"Invalid Access Limit"}"#);
    let (seen, server) = serve(listener, vec![limited.clone(), limited.clone(), limited]);

    let started = Instant::now();
    let err = translator(port)
        .with_base_delay(Duration::from_millis(40))
        .translate("hello", "en", "zh")
        .await
        .unwrap_err();

    match err {
        RelayError::Baidu { code, .. } => assert_eq!(code, "54003"),
        other => panic!("expected baidu error, got {other:?}"),
    }
    // 40ms after the first attempt, 80ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(120));
    server.await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn baidu_keeps_paragraph_break_between_chunks() {
    let (listener, port) = mock_listener().await;
    let (seen, server) = serve(
        listener,
        vec![
            json_response("200 OK", r#"{"trans_result":[{"src":"x","dst":"first"}]}"#),
            json_response("200 OK", r#"{"trans_result":[{"src":"y","dst":"second"}]}"#),
        ],
    );

    let text = format!("{}\n\n{}", "x".repeat(2000), "y".repeat(2000));
    let translated = translator(port).translate(&text, "en", "zh").await.unwrap();

    assert_eq!(translated, "first\n\nsecond");
    server.await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2, "blank chunk is not sent");
}
