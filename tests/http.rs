use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use elastic_model::{api, app_state::AppState, config::AppConfig};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tower::ServiceExt;

const BOUNDARY: &str = "elastic-boundary";

struct Fixture {
    web: TempDir,
    _staging: TempDir,
    router: Router,
    state: AppState,
}

fn fixture(shutdown: Option<oneshot::Sender<()>>) -> Fixture {
    let web = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let config = AppConfig {
        server_addr: "127.0.0.1:0".into(),
        web_root: web.path().to_path_buf(),
        upload_temp_dir: staging.path().to_path_buf(),
        preview_width: 100,
        preview_height: 100,
        max_upload_bytes: 1024 * 1024,
    };
    let state = AppState::new(config, shutdown);
    Fixture {
        web,
        _staging: staging,
        router: api::create_router(state.clone()),
        state,
    }
}

fn multipart(file_name: &str, bytes: &[u8]) -> Body {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Body::from(body)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn upload(router: &Router, name: &str, bytes: &[u8]) -> (StatusCode, Vec<u8>) {
    let request = Request::post("/api/upload?key=sess&id=form")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(multipart(name, bytes))
        .unwrap();
    send(router, request).await
}

async fn preview(router: &Router, query: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::get(format!("/api/preview?{query}")).body(Body::empty()).unwrap();
    send(router, request).await
}

#[tokio::test]
async fn upload_then_preview_then_delete_a_temporary_file() {
    let fx = fixture(None);

    let (status, body) = upload(&fx.router, "Logo.PNG", b"png").await;
    assert_eq!(status, StatusCode::OK);
    let uploaded: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(uploaded, json!([{"fileName": "logo.png", "status": true, "fileSize": 3}]));
    assert!(fx.state.uploads.find("sess", "form", "tmp://logo.png").unwrap().is_some());

    let (status, body) = preview(&fx.router, "fileName=tmp://logo.png&mode=json&key=sess&id=form").await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["status"], json!(true));
    assert_eq!(info["image"], json!(true));
    assert_eq!(info["name"], json!("logo.png"));
    assert_eq!(info["path"], Value::Null);
    assert!(info["url"].as_str().unwrap().contains("mode=raw"));

    let (status, body) = preview(&fx.router, "fileName=tmp://logo.png&mode=raw&key=sess&id=form").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"png");

    let request = Request::post("/api/delete-file")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"name": "tmp://logo.png", "key": "sess", "id": "form"}).to_string()))
        .unwrap();
    let (status, body) = send(&fx.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let deleted: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(deleted, json!({"fileName": "tmp://logo.png", "status": true, "fileSize": 3}));

    let (_, body) = preview(&fx.router, "fileName=tmp://logo.png&mode=json&key=sess&id=form").await;
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info, json!({"status": false, "path": null}));
}

#[tokio::test]
async fn stored_files_are_previewed_with_expanded_placeholders() {
    let fx = fixture(None);
    let dir = fx.web.path().join("files/7");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("doc.pdf"), b"%PDF").unwrap();

    let (status, body) = preview(&fx.router, "fileName=doc.pdf&mode=json&targetPathAlias=files/%7Bid%7D&id=7").await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["status"], json!(true));
    assert_eq!(info["image"], json!(false));
    assert_eq!(info["path"], json!("/files/7/doc.pdf"));

    let request = Request::get("/api/preview?fileName=doc.pdf&mode=raw&targetPathAlias=files/7")
        .body(Body::empty())
        .unwrap();
    let response = fx.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
}

#[tokio::test]
async fn unsafe_requests_are_rejected() {
    let fx = fixture(None);

    let (status, _) = preview(&fx.router, "fileName=../../etc/passwd&mode=raw").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = upload(&fx.router, "..", b"x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::post("/api/delete-file")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"name": "files/1/a.jpg", "key": "sess"}).to_string()))
        .unwrap();
    let (status, _) = send(&fx.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn shutdown_from(peer: Option<SocketAddr>) -> Request<Body> {
    let mut request = Request::post("/api/shutdown").body(Body::empty()).unwrap();
    if let Some(addr) = peer {
        request.extensions_mut().insert(ConnectInfo(addr));
    }
    request
}

#[tokio::test]
async fn shutdown_signals_the_server_from_loopback() {
    let (tx, rx) = oneshot::channel();
    let fx = fixture(Some(tx));

    let (status, _) = send(&fx.router, shutdown_from(Some(SocketAddr::from(([127, 0, 0, 1], 5000))))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(rx.await.is_ok());
}

#[tokio::test]
async fn shutdown_is_refused_to_remote_or_unknown_peers() {
    let (tx, mut rx) = oneshot::channel();
    let fx = fixture(Some(tx));

    let (status, _) = send(&fx.router, shutdown_from(None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) = send(&fx.router, shutdown_from(Some(SocketAddr::from(([203, 0, 113, 9], 5000))))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert!(error["error"].is_string());
    assert!(rx.try_recv().is_err());
}
