//! End-to-end tests over real sockets: a served router on a loopback
//! listener, exercised through the default pooled client.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use micro_rpc::error::codes;
use micro_rpc::filters::{ErrorFilter, TimeoutFilter, TIMEOUT_HEADER};
use micro_rpc::{listen, service_fn, Request, Router, Server, ServiceError, ServiceExt, Streamer};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Greeting {
    greeting: String,
}

async fn serve_fixture() -> Server {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let router = Router::new();

    router
        .get("/greet/:name", service_fn(|req: Request| async move {
            let name = req.param("name").unwrap_or("world").to_string();
            req.response_with(&Greeting { greeting: format!("hello, {name}") })
        }))
        .unwrap();

    router
        .get("/forbidden-planet", service_fn(|req: Request| async move {
            let mut rsp = req.response();
            rsp.error = Some(
                ServiceError::unauthorized("ah_ah_ah", "You didn't say the magic word!")
                    .with_param("param", "value"),
            );
            rsp
        }))
        .unwrap();

    router
        .get("/slow", service_fn(|req: Request| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            req.response()
        }))
        .unwrap();

    router
        .get("/stream", service_fn(|req: Request| async move {
            let (writer, streamer) = Streamer::pipe();
            tokio::spawn(async move {
                for chunk in ["first ", "second ", "third"] {
                    writer.write(chunk).await.unwrap();
                }
                writer.close();
            });
            let mut rsp = req.response();
            rsp.set_body(streamer);
            rsp
        }))
        .unwrap();

    let svc = router.filter(TimeoutFilter::new(Duration::from_secs(5))).filter(ErrorFilter);
    listen(svc, None).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_round_trip() {
    let server = serve_fixture().await;

    let mut rsp = Request::get(&format!("{}/greet/rust", server.url())).send().await;
    assert!(rsp.error.is_none(), "unexpected error: {:?}", rsp.error);
    assert_eq!(rsp.status(), http::StatusCode::OK);

    let body: Greeting = rsp.decode().await.unwrap();
    assert_eq!(body.greeting, "hello, rust");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn structured_errors_survive_the_wire() {
    let server = serve_fixture().await;

    let rsp = Request::get(&format!("{}/forbidden-planet", server.url())).send().await;
    assert_eq!(rsp.status(), http::StatusCode::UNAUTHORIZED);

    let err = rsp.error.expect("remote error must be decoded");
    assert_eq!(err.code, "unauthorized.ah_ah_ah");
    assert_eq!(err.message, "You didn't say the magic word!");
    assert_eq!(err.params.get("param").map(String::as_str), Some("value"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unrouted_path_is_not_found() {
    let server = serve_fixture().await;

    let rsp = Request::get(&format!("{}/no/such/route", server.url())).send().await;
    assert_eq!(rsp.status(), http::StatusCode::NOT_FOUND);
    assert!(rsp.error.expect("miss must carry an error").matches(codes::NOT_FOUND));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_header_overrides_the_default() {
    let server = serve_fixture().await;

    // the fixture's default timeout is 5s; the header drops it below the
    // handler's sleep
    let mut req = Request::get(&format!("{}/slow", server.url()));
    req.headers_mut().insert(TIMEOUT_HEADER, "50".parse().unwrap());

    let started = Instant::now();
    let rsp = req.send().await;
    assert!(started.elapsed() < Duration::from_secs(2), "timeout must fire early");

    assert_eq!(rsp.status(), http::StatusCode::GATEWAY_TIMEOUT);
    assert!(rsp.error.expect("timeout must carry an error").matches(codes::TIMEOUT));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_aborts_an_in_flight_request() {
    let server = serve_fixture().await;

    let future = Request::get(&format!("{}/slow", server.url())).send();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    future.cancel();
    let rsp = tokio::time::timeout(Duration::from_secs(1), future).await.expect("prompt after cancel");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(rsp.error.is_some(), "cancelled dispatch must surface an error");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_context_dies_with_the_connection() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (observed_tx, mut observed_rx) = tokio::sync::mpsc::channel::<()>(1);

    let router = Router::new();
    router
        .get("/hang", service_fn(move |req: Request| {
            let observed_tx = observed_tx.clone();
            async move {
                // watch from a detached task: hyper drops the in-flight
                // handler future when the connection goes away
                let ctx = req.context().clone();
                tokio::spawn(async move {
                    ctx.done().await;
                    let _ = observed_tx.send(()).await;
                });
                tokio::time::sleep(Duration::from_secs(30)).await;
                req.response()
            }
        }))
        .unwrap();
    let server = listen(router.filter(ErrorFilter), None).await.unwrap();

    let future = Request::get(&format!("{}/hang", server.url())).send();
    tokio::time::sleep(Duration::from_millis(50)).await;
    future.cancel();
    let _ = future.await;

    tokio::time::timeout(Duration::from_secs(1), observed_rx.recv())
        .await
        .expect("request context must be cancelled when the client goes away");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn h2c_upgrade_serves_http2_on_the_same_connection() {
    use http_body_util::{BodyExt, Empty};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use micro_rpc::filters::H2cFilter;

    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let router = Router::new();
    router
        .get("/ping", service_fn(|req: Request| async move { req.response_with(&"pong") }))
        .unwrap();
    let server = listen(router.filter(ErrorFilter).filter(H2cFilter), None).await.unwrap();

    // handshake over plain HTTP/1.1 first
    let stream = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
    let (mut h1, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });

    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri("/ping")
        .header(http::header::HOST, "localhost")
        .header(http::header::UPGRADE, "h2c")
        .header(http::header::CONNECTION, "Upgrade, HTTP2-Settings")
        .header("http2-settings", "")
        .body(Empty::<bytes::Bytes>::new())
        .unwrap();
    let rsp = h1.send_request(req).await.unwrap();
    assert_eq!(rsp.status(), http::StatusCode::SWITCHING_PROTOCOLS);

    // then speak HTTP/2 over the upgraded connection
    let upgraded = hyper::upgrade::on(rsp).await.unwrap();
    let (mut h2, h2conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), upgraded).await.unwrap();
    tokio::spawn(async move {
        let _ = h2conn.await;
    });

    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri(format!("{}/ping", server.url()))
        .body(Empty::<bytes::Bytes>::new())
        .unwrap();
    let rsp = h2.send_request(req).await.unwrap();
    assert_eq!(rsp.version(), http::Version::HTTP_2);
    assert_eq!(rsp.status(), http::StatusCode::OK);

    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, bytes::Bytes::from("\"pong\""));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_request_is_rejected_before_the_service_runs() {
    use micro_rpc::filters::ExpirationFilter;

    let svc = service_fn(|_req: Request| async move { unreachable!("expired request must not reach the service") })
        .filter(ExpirationFilter)
        .filter(ErrorFilter)
        .into_arc();

    let req = Request::get("http://localhost/anything");
    req.context().cancel();

    let rsp = req.send_via(svc).await;
    assert_eq!(rsp.status(), http::StatusCode::BAD_REQUEST);
    assert_eq!(rsp.error.expect("expired request must carry an error").code, "bad_request.expired");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streaming_response_delivers_all_chunks() {
    let server = serve_fixture().await;

    let mut rsp = Request::get(&format!("{}/stream", server.url())).send().await;
    assert!(rsp.error.is_none(), "unexpected error: {:?}", rsp.error);

    let body = rsp.body_bytes(true).await.unwrap();
    assert_eq!(body, bytes::Bytes::from("first second third"));

    server.stop().await;
}
