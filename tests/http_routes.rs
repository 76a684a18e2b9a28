mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use common::Harness;
use dedup_store::routes::routes::routes;
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`

fn app(h: &Harness) -> Router {
    routes().with_state(h.service.clone())
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn upload_request(name: &str, content: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/files?name={name}"))
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, content.len())
        .body(Body::from(content))
        .unwrap()
}

#[tokio::test]
async fn upload_duplicate_download_and_delete() {
    let h = Harness::new().await;

    let response = app(&h).oneshot(upload_request("hello.txt", b"hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    assert_eq!(created["was_duplicate"], false);
    assert_eq!(created["record"]["reference_count"], 1);
    assert!(created["record"].get("location").is_none());
    let id = created["record"]["id"].as_str().unwrap().to_string();

    let response = app(&h).oneshot(upload_request("hello.txt", b"hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let duplicate = json_body(response).await;
    assert_eq!(duplicate["was_duplicate"], true);
    assert_eq!(duplicate["record"]["id"], id.as_str());
    assert_eq!(duplicate["record"]["reference_count"], 2);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri(format!("/files/{id}/content"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"hello");

    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri(format!("/files/{id}"))
            .body(Body::empty())
            .unwrap()
    };

    let response = app(&h).oneshot(delete()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = json_body(response).await;
    assert_eq!(outcome["outcome"], "decremented");
    assert_eq!(outcome["record"]["reference_count"], 1);

    let response = app(&h).oneshot(delete()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "deleted");

    let response = app(&h).oneshot(delete()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri(format!("/files/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_without_length_or_name_is_rejected() {
    let h = Harness::new().await;

    let response = app(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/files?name=a.txt")
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/files")
                .header(header::CONTENT_LENGTH, 3)
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/files?name=a.txt")
                .header(header::CONTENT_LENGTH, 99)
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.record_count().await, 0);
}

#[tokio::test]
async fn references_listing_and_digest_lookup() {
    let h = Harness::new().await;

    let response = app(&h).oneshot(upload_request("doc.txt", b"document")).await.unwrap();
    let created = json_body(response).await;
    let id = created["record"]["id"].as_str().unwrap().to_string();
    let digest = created["record"]["digest"].as_str().unwrap().to_string();

    let response = app(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/files/{id}/references"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"name": "doc-link.txt", "media_type": "text/plain"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let reference = json_body(response).await;
    assert_eq!(reference["is_reference"], true);
    assert_eq!(reference["points_to"], id.as_str());

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri("/files?is_reference=true&page_size=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = json_body(response).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["page_size"], 10);
    assert_eq!(page["items"][0]["original_name"], "doc-link.txt");

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri("/files?sort=bogus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri(format!("/files/by-digest/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let owner = json_body(response).await;
    assert_eq!(owner["id"], id.as_str());
    assert_eq!(owner["reference_count"], 2);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/files/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri("/files/by-digest/not-hex")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let h = Harness::new().await;

    let response = app(&h)
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app(&h)
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["checks"]["catalog"]["ok"], true);
    assert_eq!(body["checks"]["blobs"]["ok"], true);
}
