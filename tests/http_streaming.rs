use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use relay_core::config::HttpConfig;
use relay_core::security::UrlPolicy;
use relay_core::types::{Chunk, ChunkMeta, Output, RequestConfig};
use relay_engine::{Chain, Flow, RequestStage, StreamPolicy};
use relay_http::HttpAdapter;

async fn serve_once(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = sock.read(&mut buf).await;
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        sock.write_all(reply.as_bytes()).await.unwrap();
        sock.shutdown().await.ok();
    });
    format!("http://{}", addr)
}

fn local_adapter() -> Arc<HttpAdapter> {
    let policy = UrlPolicy {
        allow_localhost: true,
        ..UrlPolicy::default()
    };
    Arc::new(HttpAdapter::new(&HttpConfig::default(), policy).unwrap())
}

#[tokio::test]
async fn stage_stream_policy_reads_http_body_progressively() {
    let base = serve_once("hello stream").await;
    let seen: Arc<Mutex<Vec<(Chunk, ChunkMeta)>>> = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let policy = StreamPolicy::new()
        .accumulate(true)
        .on_chunk(move |chunk, meta| s.lock().unwrap().push((chunk, meta)));

    let chain = Chain::new()
        .with_adapter(local_adapter())
        .add_stage(RequestStage::new(RequestConfig::get(format!("{}/events", base))).stream(policy));

    let out = chain.execute().await.unwrap();
    assert_eq!(out, Some(Output::Bytes("hello stream".into())));

    let seen = seen.lock().unwrap();
    assert!(seen.len() >= 2, "expected incremental chunks plus a flush");
    let (last, meta) = seen.last().unwrap();
    assert!(meta.is_last);
    assert_eq!(meta.cumulative_bytes, 12);
    assert_eq!(last.as_bytes(), b"hello stream");
}

#[tokio::test]
async fn disabled_stream_policy_reads_whole_body() {
    let base = serve_once("plain").await;
    let chain = Chain::new()
        .with_adapter(local_adapter())
        .add_stage(RequestStage::new(RequestConfig::get(base)).stream(StreamPolicy::disabled()));

    assert_eq!(chain.execute().await.unwrap(), Some(Output::Text("plain".into())));
}
