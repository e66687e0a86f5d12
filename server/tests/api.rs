use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use iqdb::DB;
use iqdb_server::router;
use tokio::sync::RwLock;
use tower::ServiceExt;

fn app() -> Router {
    let db = DB::open(":memory:").unwrap();
    router(Arc::new(RwLock::new(db)))
}

/// A small solid-color PNG; different colors give different bytes (and so
/// different md5s) with identical dimensions.
fn png(r: u8, g: u8, b: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb([r, g, b]));
    let mut bytes = Vec::new();
    img.write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageFormat::Png,
    )
    .unwrap();
    bytes
}

fn multipart_file(content: &[u8]) -> (String, Vec<u8>) {
    let boundary = "----iqdbTestBoundary1234";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"test.png\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

async fn send_file(app: &Router, method: &str, uri: &str, content: &[u8]) -> (StatusCode, serde_json::Value) {
    let (content_type, body) = multipart_file(content);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    parse(response).await
}

async fn send_empty(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    parse(response).await
}

async fn parse(response: axum::response::Response) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn status_starts_empty() {
    let app = app();
    let (status, json) = send_empty(&app, "GET", "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["image_count"], 0);
    assert_eq!(json["last_post_id"], 0);
}

#[tokio::test]
async fn add_then_query_the_same_file() {
    let app = app();
    let file = png(30, 60, 90);

    let (status, json) = send_file(&app, "POST", "/images/7", &file).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["post_id"], 7);
    assert_eq!(json["md5"].as_str().unwrap().len(), 32);
    let hash = json["hash"].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 533);
    assert!(hash.starts_with("iqdb_"));
    assert_eq!(json["signature"]["avglf"].as_array().unwrap().len(), 3);
    assert_eq!(json["signature"]["sig"][0].as_array().unwrap().len(), 40);

    let (status, json) = send_file(&app, "POST", "/query/file?limit=10", &file).await;
    assert_eq!(status, StatusCode::OK);
    let matches = json.as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["post_id"], 7);
    assert!((matches[0]["score"].as_f64().unwrap() - 100.0).abs() < 1e-3);
    assert_eq!(matches[0]["hash"], hash.as_str());

    let (status, json) = send_empty(&app, "GET", "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["image_count"], 1);
    assert_eq!(json["last_post_id"], 7);
}

#[tokio::test]
async fn query_by_hash_and_md5() {
    let app = app();
    let file = png(200, 10, 10);
    let (_, added) = send_file(&app, "POST", "/images/3", &file).await;
    let hash = added["hash"].as_str().unwrap();
    let md5 = added["md5"].as_str().unwrap();

    let (status, json) = send_empty(&app, "POST", &format!("/query/{hash}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["post_id"], 3);
    assert!((json[0]["score"].as_f64().unwrap() - 100.0).abs() < 1e-3);

    let (status, json) = send_empty(&app, "POST", &format!("/query/{md5}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["post_id"], 3);
    assert_eq!(json[0]["md5"], md5);
}

#[tokio::test]
async fn query_selector_failures() {
    let app = app();

    let (status, json) = send_empty(&app, "POST", "/query/not-a-selector").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("invalid selector"));

    // Well-formed md5 that is not in the catalog.
    let (status, json) =
        send_empty(&app, "POST", "/query/0123456789abcdef0123456789abcdef").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("couldn't find"));

    // Malformed iqdb_ hash.
    let (status, _) = send_empty(&app, "POST", "/query/iqdb_zzzz").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // `file` selector without a multipart body.
    let (status, _) = send_empty(&app, "POST", "/query/file").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn query_respects_limit() {
    let app = app();
    send_file(&app, "POST", "/images/1", &png(10, 10, 10)).await;
    send_file(&app, "POST", "/images/2", &png(20, 20, 20)).await;
    send_file(&app, "POST", "/images/3", &png(250, 250, 250)).await;

    let (status, json) = send_file(&app, "POST", "/query/file?limit=2", &png(10, 10, 10)).await;
    assert_eq!(status, StatusCode::OK);
    let matches = json.as_array().unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0]["post_id"], 1);

    // Default limit returns the whole (small) corpus.
    let (_, json) = send_file(&app, "POST", "/query/file", &png(10, 10, 10)).await;
    assert_eq!(json.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn duplicate_md5_conflicts() {
    let app = app();
    let file = png(1, 2, 3);
    let (status, _) = send_file(&app, "POST", "/images/1", &file).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send_file(&app, "POST", "/images/2", &file).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("already exists"));

    let (_, json) = send_empty(&app, "GET", "/status").await;
    assert_eq!(json["image_count"], 1);
}

#[tokio::test]
async fn replace_keeps_one_row() {
    let app = app();
    let (_, first) = send_file(&app, "POST", "/images/5", &png(9, 9, 9)).await;
    let (status, second) = send_file(&app, "POST", "/images/5", &png(99, 99, 99)).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(first["md5"], second["md5"]);

    let (_, json) = send_empty(&app, "GET", "/status").await;
    assert_eq!(json["image_count"], 1);

    // The old signature is gone from the index; querying the new file
    // still finds the post.
    let (_, json) = send_file(&app, "POST", "/query/file", &png(99, 99, 99)).await;
    assert_eq!(json[0]["post_id"], 5);
    assert_eq!(json[0]["md5"], second["md5"].as_str().unwrap());
}

#[tokio::test]
async fn auto_assigned_post_ids_are_sequential() {
    let app = app();
    let (status, json) = send_file(&app, "POST", "/images", &png(40, 0, 0)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["post_id"], 1);

    let (status, json) = send_file(&app, "POST", "/images", &png(0, 40, 0)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["post_id"], 2);

    // Auto-assignment continues above manually chosen ids.
    send_file(&app, "POST", "/images/10", &png(0, 0, 40)).await;
    let (_, json) = send_file(&app, "POST", "/images", &png(40, 40, 0)).await;
    assert_eq!(json["post_id"], 11);
}

#[tokio::test]
async fn delete_by_post_id_and_md5() {
    let app = app();
    let (_, added) = send_file(&app, "POST", "/images/5", &png(77, 12, 200)).await;
    let md5 = added["md5"].as_str().unwrap().to_string();

    let (status, json) = send_empty(&app, "DELETE", &format!("/images/{md5}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["post_id"], 5);
    assert_eq!(json["md5"], md5.as_str());

    let (_, json) = send_empty(&app, "GET", "/status").await;
    assert_eq!(json["image_count"], 0);

    send_file(&app, "POST", "/images/6", &png(1, 200, 3)).await;
    let (status, json) = send_empty(&app, "DELETE", "/images/6").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["post_id"], 6);

    // Deleting again reports the missing image.
    let (status, json) = send_empty(&app, "DELETE", "/images/6").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("post_id: 6"));

    let (status, _) = send_empty(&app, "DELETE", "/images/not-a-selector").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn add_validation_failures() {
    let app = app();

    let (status, json) = send_file(&app, "POST", "/images/0", &png(5, 5, 5)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("post_id"));

    let (status, _) = send_file(&app, "POST", "/images/abc", &png(5, 5, 5)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = send_file(&app, "POST", "/images/1", b"definitely not an image").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("unsupported"));

    // Multipart body without a `file` field.
    let boundary = "----iqdbTestBoundary1234";
    let body = format!("--{boundary}--\r\n");
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/images/1")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, json) = parse(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("file"));

    let (_, json) = send_empty(&app, "GET", "/status").await;
    assert_eq!(json["image_count"], 0);
}

#[tokio::test]
async fn md5_param_overrides_computed_digest() {
    let app = app();
    let md5 = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    let (status, json) =
        send_file(&app, "POST", &format!("/images/9?md5={md5}"), &png(8, 8, 80)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["md5"], md5);

    // And the supplied digest addresses the image afterwards.
    let (status, json) = send_empty(&app, "DELETE", &format!("/images/{md5}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["post_id"], 9);

    let (status, _) =
        send_file(&app, "POST", "/images/9?md5=tooshort", &png(8, 8, 80)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
