use gengate::gateway::error_recovery::classify;
use gengate::gateway::{ErrorKind, GatewayConfig, GenerationGateway, Task};
use gengate::provider::{
    GenerationOutput, GenerationProvider, GenerationRequest, HttpProvider, ProviderConfig,
    ProviderError,
};
use gengate::env::test::{OTHER_TEST_KEY, VALID_TEST_KEY};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Minimal HTTP/1.1 server answering each connection with the next canned response
struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    async fn start(responses: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut socket).await;
                recorded.lock().unwrap().push(request);
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            }
        });

        Self { addr, requests }
    }

    fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: format!("http://{}/", self.addr),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buffer[..end]).to_lowercase();
            let body_len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buffer.len() >= end + 4 + body_len {
                break;
            }
        }
    }

    String::from_utf8_lossy(&buffer).to_lowercase()
}

fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        body.len()
    );
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");

    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn json_response(status: &str, body: &str) -> Vec<u8> {
    http_response(status, &[("Content-Type", "application/json")], body.as_bytes())
}

fn secret(key: &str) -> SecretString {
    SecretString::from(key.to_string())
}

#[tokio::test]
async fn test_text_generation_sends_credential_in_header() {
    let server = MockServer::start(vec![json_response("200 OK", r#"{"text": "hello there"}"#)]).await;
    let provider = HttpProvider::new(server.provider_config()).unwrap();

    let request = GenerationRequest::text("Say hello").with_model("small");
    let output = provider
        .generate(&request, &secret(VALID_TEST_KEY))
        .await
        .unwrap();

    assert_eq!(
        output,
        GenerationOutput::Text {
            text: "hello there".to_string()
        }
    );

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("post /v1/generate/text"));
    assert!(requests[0].contains(&format!("x-api-key: {}", VALID_TEST_KEY)));
    assert!(requests[0].contains("\"model\":\"small\""));
}

#[tokio::test]
async fn test_rate_limit_status_carries_retry_after() {
    let server = MockServer::start(vec![http_response(
        "429 Too Many Requests",
        &[("Retry-After", "7")],
        b"slow down",
    )])
    .await;
    let provider = HttpProvider::new(server.provider_config()).unwrap();

    let error = provider
        .generate(&GenerationRequest::text("Hi"), &secret(VALID_TEST_KEY))
        .await
        .unwrap_err();

    match &error {
        ProviderError::Status {
            status,
            message,
            retry_after,
        } => {
            assert_eq!(*status, 429);
            assert_eq!(message, "slow down");
            assert_eq!(*retry_after, Some(Duration::from_secs(7)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(classify(&error), ErrorKind::RateLimited);
}

#[tokio::test]
async fn test_speech_generation_returns_raw_audio() {
    let audio = [0x52u8, 0x49, 0x46, 0x46, 0x00, 0x01];
    let server = MockServer::start(vec![http_response(
        "200 OK",
        &[("Content-Type", "audio/wav")],
        &audio,
    )])
    .await;
    let provider = HttpProvider::new(server.provider_config()).unwrap();

    let output = provider
        .generate(
            &GenerationRequest::speech("Read this", "alto"),
            &secret(VALID_TEST_KEY),
        )
        .await
        .unwrap();

    assert_eq!(
        output,
        GenerationOutput::Audio {
            bytes: audio.to_vec(),
            mime_type: "audio/wav".to_string()
        }
    );
    assert!(server.requests()[0].starts_with("post /v1/generate/speech"));
}

#[tokio::test]
async fn test_unreachable_service_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let provider = HttpProvider::new(ProviderConfig {
        base_url: format!("http://{}/", addr),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    })
    .unwrap();

    let error = provider
        .generate(&GenerationRequest::text("Hi"), &secret(VALID_TEST_KEY))
        .await
        .unwrap_err();

    assert!(matches!(error, ProviderError::Transport(_)));
    assert_eq!(classify(&error), ErrorKind::NetworkError);
    assert!(!error.to_string().contains(VALID_TEST_KEY));
}

#[tokio::test]
async fn test_gateway_rotates_credentials_over_http() {
    let server = MockServer::start(vec![
        http_response("429 Too Many Requests", &[("Retry-After", "30")], b"busy"),
        json_response("200 OK", r#"{"result": "rotated answer"}"#),
    ])
    .await;

    let mut config = GatewayConfig::default();
    config.pool.credentials = vec![VALID_TEST_KEY.to_string(), OTHER_TEST_KEY.to_string()];
    config.pool.persist_usage = false;
    config.cache.persistent = false;
    config.provider = server.provider_config();
    config.throttle.base_delay = Duration::from_millis(5);
    config.throttle.min_delay = Duration::from_millis(1);
    config.throttle.max_delay = Duration::from_millis(20);
    config.retry.rotation_delay = Duration::from_millis(10);

    let provider = HttpProvider::new(config.provider.clone()).unwrap();
    let gateway = GenerationGateway::init_with_stores(config, Arc::new(provider), None, None)
        .await
        .unwrap();

    let output = gateway
        .submit(Task::new("rotation", GenerationRequest::text("Answer me")))
        .await
        .unwrap();
    assert_eq!(output.as_text(), Some("rotated answer"));

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].contains(&format!("x-api-key: {}", VALID_TEST_KEY)));
    assert!(requests[1].contains(&format!("x-api-key: {}", OTHER_TEST_KEY)));

    let status = gateway.status().await;
    assert_eq!(status.total_slots, 2);
    assert_eq!(status.available_slots, 1);

    gateway.shutdown().await;
}
