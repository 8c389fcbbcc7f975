#[macro_use]
extern crate log;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rawgrpc::client::Client;
use rawgrpc::config::{Config, ConfigBuilder};
use rawgrpc::connection::Connection;
use rawgrpc::errors::{ConnectionError, HandlerError};
use rawgrpc::frames::payloads::RequestEnvelope;
use rawgrpc::frames::FrameKind;
use rawgrpc::handler::{
    ClientStreamingHandler, DuplexStreamingHandler, HandlerRegistry, HandlerResult,
    ServerStreamingHandler, UnaryHandler,
};
use rawgrpc::messages::raw;
use rawgrpc::method::{CallOptions, Method, MethodType};
use rawgrpc::server::context::ServerCallContext;
use rawgrpc::server::stream::{RequestStream, ResponseSink};
use rawgrpc::server::Server;
use rawgrpc::{Code, Metadata, Status};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use test_case::test_case;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ECHO: &str = "/test.Echo/Say";
const SLOW: &str = "/test.Echo/Slow";
const WAIT: &str = "/test.Echo/Wait";
const JOIN: &str = "/test.Collect/Join";
const COUNT: &str = "/test.Stream/Count";
const STALL: &str = "/test.Stream/Stall";
const CHAT: &str = "/test.Chat/Echo";

fn method(method_type: MethodType, name: &str) -> Method<String, String> {
    Method::new(method_type, name, raw::utf8(), raw::utf8())
}

#[test_case("hello";                    "Basic")]
#[test_case("";                         "Empty message")]
#[test_case("zażółć gęślą jaźń";        "Multibyte")]
#[tokio::test]
async fn unary_echo(message: &str) -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;

    // WHEN
    let call = client.unary_call(&method(MethodType::Unary, ECHO), CallOptions::new(), &message.to_owned());

    // THEN
    assert_eq!(message, call.response().await?, "Response should echo request");
    assert_eq!(Code::Ok, call.status().await.code());
    server.shutdown().await;
    Ok(())
}

#[test_case(0)]
#[test_case(1)]
#[test_case(u16::MAX as usize * 10)]
#[tokio::test]
async fn unary_echo_writes_exactly_one_data_and_status(length: usize) -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let token = CancellationToken::new();
    let (mut reader, writer) = Connection::connect(address, &Config::default(), &token)
        .await?
        .split();
    let payload = Bytes::from(vec![b'x'; length]);

    // WHEN
    {
        let mut guard = writer.lock(&token).await?;
        let envelope = RequestEnvelope::new(ECHO.to_owned(), Metadata::new(), None);
        guard.write_typed(envelope, &token).await?;
        guard.write_data(FrameKind::RequestData, payload.clone(), &token).await?;
    }
    let mut kinds = vec![];
    let mut response = None;
    let mut status = None;
    loop {
        match reader.read_frame(&token).await {
            Ok(FrameKind::ResponseData) => {
                kinds.push(FrameKind::ResponseData);
                response = Some(reader.read_blob(&token).await?);
            }
            Ok(FrameKind::ResponseComplete) => {
                kinds.push(FrameKind::ResponseComplete);
                status = Some(reader.read_typed::<Status>(&token).await?);
            }
            Ok(other) => kinds.push(other),
            Err(ConnectionError::Unavailable(_)) => break,
            Err(err) => return Err(err.into()),
        }
    }

    // THEN
    assert_eq!(vec![FrameKind::ResponseData, FrameKind::ResponseComplete], kinds);
    assert_eq!(Some(payload), response);
    assert_eq!(Some(Code::Ok), status.map(|status| status.code()));
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_method_is_unimplemented() -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;

    // WHEN
    let call = client.unary_call(
        &method(MethodType::Unary, "/test.Missing/Method"),
        CallOptions::new(),
        &"hello".to_owned(),
    );

    // THEN
    let err = call.response().await.expect_err("method is not registered");
    assert_eq!(Code::Unimplemented, err.code());
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn headers_and_trailers_round_trip() -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;
    let mut headers = Metadata::new();
    headers.append("x-request-id", "42");
    headers.append("x-token-bin", Bytes::from_static(&[0, 1, 2]));

    // WHEN
    let call = client.unary_call(
        &method(MethodType::Unary, ECHO),
        CallOptions::new().with_headers(headers),
        &"hello".to_owned(),
    );

    // THEN
    call.response().await?;
    let response_headers = call.headers().await?;
    assert_eq!(Some("42"), response_headers.get("x-request-id").and_then(|value| value.as_str()));
    let trailers = call.trailers().await;
    assert_eq!(
        Some(&[0u8, 1, 2][..]),
        trailers.get("x-token-bin").map(|value| value.as_bytes())
    );
    server.shutdown().await;
    Ok(())
}

#[test_case("not found", Code::NotFound;    "Explicit status")]
#[test_case("boom", Code::Unknown;          "General error")]
#[tokio::test]
async fn handler_errors_become_status(request: &str, code: Code) -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;

    // WHEN
    let call = client.unary_call(&method(MethodType::Unary, ECHO), CallOptions::new(), &request.to_owned());

    // THEN
    let err = call.response().await.expect_err("handler fails");
    assert_eq!(code, err.code());
    assert!(err.detail().contains(request), "Detail '{}' should mention '{}'", err.detail(), request);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn explicit_status_keeps_trailers() -> Result<(), anyhow::Error> {
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;

    let call = client.unary_call(&method(MethodType::Unary, ECHO), CallOptions::new(), &"not found".to_owned());

    let status = call.status().await;
    assert_eq!(Code::NotFound, status.code());
    assert_eq!(
        Some("missing"),
        call.trailers().await.get("reason").and_then(|value| value.as_str())
    );
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn deadline_exceeded_before_slow_handler_ends() -> Result<(), anyhow::Error> {
    // GIVEN
    let _ = env_logger::builder().is_test(true).try_init();
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;
    let started = Instant::now();

    // WHEN
    let call = client.unary_call(
        &method(MethodType::Unary, SLOW),
        CallOptions::new().with_timeout(Duration::from_millis(200)),
        &"hello".to_owned(),
    );
    let status = call.status().await;

    // THEN
    assert_eq!(Code::DeadlineExceeded, status.code());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "Deadline fired too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "Deadline fired too late: {:?}", elapsed);
    server.shutdown().await;
    Ok(())
}

#[test_case(1)]
#[test_case(30)]
#[tokio::test]
async fn deadline_exceeded_when_handler_honours_cancellation(calls: usize) -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;

    // WHEN
    let calls: Vec<_> = (0..calls)
        .map(|_| {
            client.unary_call(
                &method(MethodType::Unary, WAIT),
                CallOptions::new().with_timeout(Duration::from_millis(100)),
                &"hello".to_owned(),
            )
        })
        .collect();

    // THEN
    for call in calls {
        let status = call.status().await;
        assert_eq!(Code::DeadlineExceeded, status.code(), "Unexpected {}", status);
    }
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn server_reports_exceeded_deadline_on_the_wire() -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let token = CancellationToken::new();
    let (mut reader, writer) = Connection::connect(address, &Config::default(), &token)
        .await?
        .split();
    let deadline = SystemTime::now() + Duration::from_millis(100);

    // WHEN
    {
        let mut guard = writer.lock(&token).await?;
        let envelope = RequestEnvelope::new(WAIT.to_owned(), Metadata::new(), Some(deadline));
        guard.write_typed(envelope, &token).await?;
        guard.write_data(FrameKind::RequestData, Bytes::from_static(b"hello"), &token).await?;
    }
    let kind = tokio::time::timeout(Duration::from_secs(2), reader.read_frame(&token)).await??;

    // THEN
    assert_eq!(FrameKind::ResponseComplete, kind);
    assert_eq!(Code::DeadlineExceeded, reader.read_typed::<Status>(&token).await?.code());
    server.shutdown().await;
    Ok(())
}

#[test_case(0)]
#[test_case(1)]
#[test_case(10)]
#[test_case(100)]
#[tokio::test]
async fn client_stream_keeps_order(count: usize) -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;
    let messages: Vec<String> = (0..count).map(|i| i.to_string()).collect();

    // WHEN
    let call = client.client_streaming_call(&method(MethodType::ClientStreaming, JOIN), CallOptions::new());
    for message in &messages {
        call.request_stream().write(message).await?;
    }
    call.request_stream().complete().await?;

    // THEN
    // The handler appends "|end" once per observed end of stream.
    assert_eq!(format!("{}|end", messages.join(",")), call.response().await?);
    server.shutdown().await;
    Ok(())
}

#[test_case(0)]
#[test_case(3)]
#[test_case(250)]
#[tokio::test]
async fn server_stream_delivers_all_messages(count: usize) -> Result<(), anyhow::Error> {
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;

    let call = client.server_streaming_call(&method(MethodType::ServerStreaming, COUNT), CallOptions::new(), &count.to_string());
    let received: Vec<String> = call
        .into_response_stream()
        .into_stream()
        .map(|message| message.map_err(anyhow::Error::from))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;

    let expected: Vec<String> = (0..count).map(|i| i.to_string()).collect();
    assert_eq!(expected, received);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_stops_server_stream_between_writes() -> Result<(), anyhow::Error> {
    // GIVEN
    let _ = env_logger::builder().is_test(true).try_init();
    let (server, address, mut reports) = start_server().await?;
    let client = Client::new(address, Config::default())?;
    let mut call = client.server_streaming_call(&method(MethodType::ServerStreaming, STALL), CallOptions::new(), &"go".to_owned());
    assert_eq!(Some("first".to_owned()), call.response_stream().message().await?);

    // WHEN
    call.cancel();

    // THEN
    assert_eq!(Code::Cancelled, call.status().await.code());
    let report = tokio::time::timeout(Duration::from_secs(2), reports.recv())
        .await?
        .expect("handler should report");
    assert!(report.cancelled_promptly, "Handler should observe cancellation promptly");
    assert_eq!(Some(Code::Cancelled), report.write_after_cancel, "Write after cancellation should fail");
    let next = call.response_stream().message().await;
    assert!(matches!(next, Err(_) | Ok(None)), "No message after cancellation");
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_duplex_writers_never_interleave() -> Result<(), anyhow::Error> {
    // GIVEN
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;
    let call = client.duplex_streaming_call(&method(MethodType::DuplexStreaming, CHAT), CallOptions::new());
    let (requests, mut responses) = call.into_streams();
    let writers = 50;
    let messages = 20;

    // WHEN
    let tasks: Vec<_> = (0..writers)
        .map(|writer| {
            let requests = requests.clone();
            tokio::spawn(async move {
                for message in 0..messages {
                    requests.write(&format!("{}:{}:{}", writer, message, "x".repeat(writer * 10))).await?;
                }
                Ok::<(), Status>(())
            })
        })
        .collect();
    let mut received = vec![];
    while received.len() < writers * messages {
        match responses.message().await? {
            Some(message) => received.push(message),
            None => break,
        }
    }
    for task in tasks {
        task.await??;
    }
    requests.complete().await?;

    // THEN
    let mut next_per_writer: HashMap<usize, usize> = HashMap::new();
    for message in &received {
        let parts: Vec<&str> = message.split(':').collect();
        assert_eq!(3, parts.len(), "Corrupted message '{}'", message);
        let writer: usize = parts[0].parse()?;
        let index: usize = parts[1].parse()?;
        assert_eq!("x".repeat(writer * 10), parts[2], "Corrupted payload of writer {}", writer);
        let expected = next_per_writer.entry(writer).or_insert(0);
        assert_eq!(*expected, index, "Messages of writer {} out of order", writer);
        *expected += 1;
    }
    assert_eq!(writers * messages, received.len());
    assert_eq!(None, responses.message().await?);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn nothing_listening_is_unavailable() -> Result<(), anyhow::Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    drop(listener);
    let config = ConfigBuilder::default()
        .connect_timeout(Duration::from_millis(300))
        .build()?;
    let client = Client::new(address, config)?;

    let call = client.unary_call(&method(MethodType::Unary, ECHO), CallOptions::new(), &"hello".to_owned());

    assert_eq!(Code::Unavailable, call.response().await.expect_err("no server").code());
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_live_calls() -> Result<(), anyhow::Error> {
    let (server, address, _) = start_server().await?;
    let client = Client::new(address, Config::default())?;
    let call = client.unary_call(&method(MethodType::Unary, SLOW), CallOptions::new(), &"hello".to_owned());
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(3), server.shutdown()).await?;

    assert_ne!(Code::Ok, call.status().await.code());
    Ok(())
}

// Server side

#[derive(Debug)]
struct StallReport {
    cancelled_promptly: bool,
    write_after_cancel: Option<Code>,
}

async fn start_server() -> Result<(Server, SocketAddr, mpsc::Receiver<StallReport>), anyhow::Error> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (report_sender, reports) = mpsc::channel(1);
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_unary(&method(MethodType::Unary, ECHO), Echo).await?;
    registry.register_unary(&method(MethodType::Unary, SLOW), Slow).await?;
    registry.register_unary(&method(MethodType::Unary, WAIT), Wait).await?;
    registry.register_client_streaming(&method(MethodType::ClientStreaming, JOIN), Join).await?;
    registry.register_server_streaming(&method(MethodType::ServerStreaming, COUNT), Count).await?;
    registry
        .register_server_streaming(&method(MethodType::ServerStreaming, STALL), Stall { reports: report_sender })
        .await?;
    registry.register_duplex_streaming(&method(MethodType::DuplexStreaming, CHAT), Chat).await?;
    let config = ConfigBuilder::default()
        .server_address("127.0.0.1:0".parse()?)
        .build()?;
    let server = Server::new(config, registry);
    let address = server.start().await?;
    Ok((server, address, reports))
}

#[derive(Debug)]
struct Echo;

#[async_trait]
impl UnaryHandler for Echo {
    type REQ = String;
    type RES = String;

    async fn handle(&self, request: String, context: &ServerCallContext) -> HandlerResult<String> {
        debug!("Echo received '{}'", request);
        match request.as_str() {
            "not found" => {
                let mut trailers = Metadata::new();
                trailers.append("reason", "missing");
                Err(Status::with_code(Code::NotFound, "not found").with_trailers(trailers).into())
            }
            "boom" => Err(HandlerError::GeneralError("boom".to_owned())),
            _ => {
                if let Some(id) = context.request_headers().get("x-request-id") {
                    let mut headers = Metadata::new();
                    headers.append("x-request-id", id.clone());
                    context.write_response_headers(headers).await?;
                }
                if let Some(token) = context.request_headers().get("x-token-bin") {
                    context.append_trailer("x-token-bin", token.clone()).await;
                }
                Ok(request)
            }
        }
    }
}

#[derive(Debug)]
struct Slow;

#[async_trait]
impl UnaryHandler for Slow {
    type REQ = String;
    type RES = String;

    async fn handle(&self, request: String, _context: &ServerCallContext) -> HandlerResult<String> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(request)
    }
}

/// Returns only once the call is cancelled.
#[derive(Debug)]
struct Wait;

#[async_trait]
impl UnaryHandler for Wait {
    type REQ = String;
    type RES = String;

    async fn handle(&self, _request: String, context: &ServerCallContext) -> HandlerResult<String> {
        context.cancelled().await;
        Err(HandlerError::Cancelled)
    }
}

#[derive(Debug)]
struct Join;

#[async_trait]
impl ClientStreamingHandler for Join {
    type REQ = String;
    type RES = String;

    async fn handle(&self, mut requests: RequestStream<String>, _context: &ServerCallContext) -> HandlerResult<String> {
        let mut messages = vec![];
        while let Some(message) = requests.message().await? {
            messages.push(message);
        }
        let mut joined = messages.join(",");
        joined.push_str("|end");
        // A second end of stream must not yield anything.
        if requests.message().await?.is_some() {
            joined.push_str("|extra");
        }
        Ok(joined)
    }
}

#[derive(Debug)]
struct Count;

#[async_trait]
impl ServerStreamingHandler for Count {
    type REQ = String;
    type RES = String;

    async fn handle(&self, request: String, responses: ResponseSink<String>, _context: &ServerCallContext) -> HandlerResult<()> {
        let count: usize = request
            .parse()
            .map_err(|_| Status::with_code(Code::InvalidArgument, "count expected"))?;
        for i in 0..count {
            responses.write(&i.to_string()).await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Stall {
    reports: mpsc::Sender<StallReport>,
}

#[async_trait]
impl ServerStreamingHandler for Stall {
    type REQ = String;
    type RES = String;

    async fn handle(&self, _request: String, responses: ResponseSink<String>, context: &ServerCallContext) -> HandlerResult<()> {
        responses.write(&"first".to_owned()).await?;
        let cancelled_promptly = tokio::time::timeout(Duration::from_secs(1), context.cancelled())
            .await
            .is_ok();
        let write_after_cancel = responses
            .write(&"second".to_owned())
            .await
            .err()
            .map(|status| status.code());
        let _ = self
            .reports
            .send(StallReport {
                cancelled_promptly,
                write_after_cancel,
            })
            .await;
        Err(HandlerError::Cancelled)
    }
}

#[derive(Debug)]
struct Chat;

#[async_trait]
impl DuplexStreamingHandler for Chat {
    type REQ = String;
    type RES = String;

    async fn handle(
        &self,
        mut requests: RequestStream<String>,
        responses: ResponseSink<String>,
        _context: &ServerCallContext,
    ) -> HandlerResult<()> {
        while let Some(message) = requests.message().await? {
            responses.write(&message).await?;
        }
        Ok(())
    }
}
