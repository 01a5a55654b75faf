#![cfg(feature = "inmem-store")]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use actix_web::{test, web, App};
use async_trait::async_trait;
use serial_test::serial;

use orbit::geocode::{Geocoder, ReverseGeocode};
use orbit::models::*;
use orbit::repo::inmem::InMemRepo;
use orbit::repo::{AvatarRepo, MediaRepo, PostRepo, Repo, UserRepo};
use orbit::storage::{MediaCategory, MediaStore, MediaStoreError, StoredFile};
use orbit::{config, AppState};

/// In-memory stand-in for the filesystem store.
struct MockMediaStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
    counter: AtomicU64,
}

impl MockMediaStore {
    fn new() -> Self {
        Self { files: Mutex::new(HashMap::new()), counter: AtomicU64::new(0) }
    }

    fn key(category: MediaCategory, filename: &str) -> String {
        format!("/uploads/{}/{}", category.as_str(), filename)
    }
}

#[async_trait]
impl MediaStore for MockMediaStore {
    async fn store(&self, category: MediaCategory, ext: &str, bytes: &[u8]) -> Result<StoredFile, MediaStoreError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let filename = if ext.is_empty() { format!("file{n}") } else { format!("file{n}.{ext}") };
        let file_url = Self::key(category, &filename);
        self.files.lock().unwrap().insert(file_url.clone(), bytes.to_vec());
        Ok(StoredFile { filename, file_url, size: bytes.len() as i64 })
    }

    async fn generate_thumbnail(&self, category: MediaCategory, filename: &str) -> Option<String> {
        let mut files = self.files.lock().unwrap();
        let bytes = files.get(&Self::key(category, filename))?.clone();
        let thumb = format!("/uploads/thumbnails/thumb_{filename}");
        files.insert(thumb.clone(), bytes);
        Some(thumb)
    }

    async fn load(&self, category: MediaCategory, filename: &str) -> Result<(Vec<u8>, String), MediaStoreError> {
        let files = self.files.lock().unwrap();
        let bytes = files.get(&Self::key(category, filename)).ok_or(MediaStoreError::NotFound)?;
        let mime = infer::get(bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        Ok((bytes.clone(), mime))
    }

    async fn delete(&self, file_url: &str) -> Result<(), MediaStoreError> {
        self.files.lock().unwrap().remove(file_url);
        Ok(())
    }
}

/// Geocoder with a canned answer (None simulates an unreachable service).
struct StubGeocoder(Option<ReverseGeocode>);

#[async_trait]
impl Geocoder for StubGeocoder {
    async fn reverse_geocode(&self, _latitude: f64, _longitude: f64) -> Option<ReverseGeocode> {
        self.0.clone()
    }
}

struct TestContext {
    repo: Arc<InMemRepo>,
    state: AppState,
    // keeps the snapshot directory alive for the duration of the test
    _data_dir: tempfile::TempDir,
}

fn context_with_geocoder(geocoder: StubGeocoder) -> TestContext {
    let data_dir = tempfile::tempdir().unwrap();
    std::env::set_var("ORBIT_DATA_DIR", data_dir.path());
    let repo = Arc::new(InMemRepo::new());
    let state = AppState {
        repo: repo.clone() as Arc<dyn Repo>,
        media_store: Arc::new(MockMediaStore::new()),
        geocoder: Arc::new(geocoder),
    };
    TestContext { repo, state, _data_dir: data_dir }
}

fn context() -> TestContext {
    context_with_geocoder(StubGeocoder(None))
}

macro_rules! app {
    ($ctx:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($ctx.state.clone()))
                .configure(config),
        )
        .await
    };
}

async fn seed_user(ctx: &TestContext) -> User {
    ctx.repo.create_user("orbit", "orbit@example.com").await.unwrap()
}

fn sample_png() -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
        0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00,
        0x00, 0x1F, 0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78,
        0x9C, 0x62, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00,
        0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ]
}

const BOUNDARY: &str = "----testboundary42";

/// Raw multipart body with one file field and optional text fields.
fn build_multipart(field_name: &str, file_name: &str, bytes: &[u8], text_fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field_name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    for (name, value) in text_fields {
        body.extend_from_slice(
            format!("\r\n--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}").as_bytes(),
        );
    }
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(uri: &str, body: Vec<u8>) -> test::TestRequest {
    test::TestRequest::post()
        .uri(uri)
        .insert_header(("content-type", format!("multipart/form-data; boundary={BOUNDARY}")))
        .set_payload(body)
}

#[actix_web::test]
#[serial]
async fn health_reports_ok() {
    let ctx = context();
    let app = app!(ctx);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
}

#[actix_web::test]
#[serial]
async fn create_post_requires_user_and_content_type() {
    let ctx = context();
    seed_user(&ctx).await;
    let app = app!(ctx);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/posts")
            .set_json(serde_json::json!({ "text_content": "no ids here" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Missing required fields");
    assert_eq!(body["message"], "user_id and content_type are required");
}

#[actix_web::test]
#[serial]
async fn create_post_stamps_current_avatar() {
    let ctx = context();
    let user = seed_user(&ctx).await;
    let avatar = ctx.repo.create_avatar(user.id, "/uploads/avatars/a.png", true).await.unwrap();
    let app = app!(ctx);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/posts")
            .set_json(serde_json::json!({
                "user_id": user.id,
                "content_type": "text",
                "text_content": "first post",
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["text_content"], "first post");
    assert_eq!(body["avatar"]["id"], avatar.id);
    assert_eq!(body["avatar"]["avatar_url"], "/uploads/avatars/a.png");
    assert!(body["reposted_post"].is_null());
}

#[actix_web::test]
#[serial]
async fn feed_envelope_has_camel_case_has_more() {
    let ctx = context();
    let user = seed_user(&ctx).await;
    for i in 0..3 {
        ctx.repo
            .create_post(CreatePost {
                user_id: user.id,
                avatar_id: None,
                content_type: ContentType::Text,
                text_content: Some(format!("post {i}")),
                metadata: serde_json::json!({}),
                media_items: vec![],
                location: None,
                whisper_mode: false,
            })
            .await
            .unwrap();
    }
    let app = app!(ctx);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/api/posts?page=1&limit=2").to_request(),
    )
    .await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["posts"].as_array().unwrap().len(), 2);
    assert_eq!(body["pagination"]["total"], 3);
    assert_eq!(body["pagination"]["hasMore"], true);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/api/posts?page=2&limit=2").to_request(),
    )
    .await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["pagination"]["hasMore"], false);
}

#[actix_web::test]
#[serial]
async fn search_requires_a_keyword() {
    let ctx = context();
    seed_user(&ctx).await;
    let app = app!(ctx);

    for uri in ["/api/posts/search", "/api/posts/search?q=", "/api/posts/search?q=%20%20"] {
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), 400, "expected 400 for {uri}");
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Missing search query");
        assert_eq!(body["message"], "Query parameter \"q\" is required");
    }
}

#[actix_web::test]
#[serial]
async fn post_lifecycle_over_http() {
    let ctx = context();
    let user = seed_user(&ctx).await;
    let app = app!(ctx);

    // create
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/posts")
            .set_json(serde_json::json!({
                "user_id": user.id,
                "content_type": "text",
                "text_content": "hello world",
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = test::read_body_json(resp).await;
    let id = created["id"].as_i64().unwrap();

    // update
    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri(&format!("/api/posts/{id}"))
            .set_json(serde_json::json!({ "text_content": "hello again" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let updated: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(updated["text_content"], "hello again");

    // soft delete
    let resp = test::call_service(
        &app,
        test::TestRequest::delete().uri(&format!("/api/posts/{id}")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["message"], "Post deleted successfully");
    assert!(!body["post"]["deleted_at"].is_null());

    // gone from the feed and from direct fetch
    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri(&format!("/api/posts/{id}")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);

    // visible in the recycle bin
    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/api/posts/deleted").to_request(),
    )
    .await;
    let bin: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(bin["posts"][0]["id"], id);

    // restore
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri(&format!("/api/posts/{id}/restore")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["message"], "Post restored successfully");

    // delete again, then purge
    test::call_service(&app, test::TestRequest::delete().uri(&format!("/api/posts/{id}")).to_request()).await;
    let resp = test::call_service(
        &app,
        test::TestRequest::delete().uri(&format!("/api/posts/{id}/permanent")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["message"], "Post permanently deleted");

    // purging a live or missing post is refused
    let resp = test::call_service(
        &app,
        test::TestRequest::delete().uri(&format!("/api/posts/{id}/permanent")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn repost_has_its_own_error_label() {
    let ctx = context();
    let user = seed_user(&ctx).await;
    let app = app!(ctx);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/posts/9999/repost")
            .set_json(serde_json::json!({ "user_id": user.id }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Original post not found");

    // missing user_id is a validation error
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/posts/9999/repost")
            .set_json(serde_json::json!({ "repost_comment": "nice" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn repost_nests_the_original() {
    let ctx = context();
    let user = seed_user(&ctx).await;
    let original = ctx
        .repo
        .create_post(CreatePost {
            user_id: user.id,
            avatar_id: None,
            content_type: ContentType::Text,
            text_content: Some("worth sharing".to_string()),
            metadata: serde_json::json!({}),
            media_items: vec![],
            location: None,
            whisper_mode: false,
        })
        .await
        .unwrap();
    let app = app!(ctx);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri(&format!("/api/posts/{}/repost", original.id))
            .set_json(serde_json::json!({ "user_id": user.id, "repost_comment": "look at this" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["content_type"], "repost");
    assert_eq!(body["repost_comment"], "look at this");
    assert_eq!(body["reposted_post"]["id"], original.id);
    assert_eq!(body["reposted_post"]["text_content"], "worth sharing");
}

#[actix_web::test]
#[serial]
async fn geocoding_failure_still_saves_coordinates() {
    let ctx = context_with_geocoder(StubGeocoder(None));
    let user = seed_user(&ctx).await;
    let app = app!(ctx);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/posts")
            .set_json(serde_json::json!({
                "user_id": user.id,
                "content_type": "text",
                "text_content": "from somewhere",
                // out-of-range latitude: the lookup yields nothing but the
                // coordinates are persisted as given
                "location": { "latitude": 200.0, "longitude": 0.0 }
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["location_latitude"], 200.0);
    assert_eq!(body["location_longitude"], 0.0);
    assert!(body["location_address"].is_null());
    assert!(body["location_city"].is_null());
}

#[actix_web::test]
#[serial]
async fn geocoding_success_fills_address_fields() {
    let ctx = context_with_geocoder(StubGeocoder(Some(ReverseGeocode {
        formatted_address: "somewhere nice".to_string(),
        province: "Guangdong".to_string(),
        city: "Guangzhou".to_string(),
        district: "Tianhe".to_string(),
    })));
    let user = seed_user(&ctx).await;
    let app = app!(ctx);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/posts")
            .set_json(serde_json::json!({
                "user_id": user.id,
                "content_type": "text",
                "text_content": "checked in",
                "location": { "latitude": 23.1, "longitude": 113.2 }
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["location_address"], "somewhere nice");
    assert_eq!(body["location_city"], "Guangzhou");
    assert_eq!(body["location_district"], "Tianhe");
}

#[actix_web::test]
#[serial]
async fn profile_round_trip() {
    let ctx = context();
    let app = app!(ctx);

    // no user bootstrapped yet
    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/user/profile").to_request()).await;
    assert_eq!(resp.status(), 404);

    let user = seed_user(&ctx).await;
    ctx.repo.create_avatar(user.id, "/uploads/avatars/a.png", true).await.unwrap();

    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/user/profile").to_request()).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["username"], "orbit");
    assert_eq!(body["current_avatar"]["avatar_url"], "/uploads/avatars/a.png");

    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri("/api/user/profile")
            .set_json(serde_json::json!({ "username": "renamed", "email": "new@example.com" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["username"], "renamed");

    // blank fields are rejected
    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri("/api/user/profile")
            .set_json(serde_json::json!({ "username": " ", "email": "new@example.com" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn avatar_upload_and_set_current() {
    let ctx = context();
    seed_user(&ctx).await;
    let app = app!(ctx);

    let body = build_multipart("avatar", "face.png", &sample_png(), &[("set_current", "true")]);
    let resp = test::call_service(&app, multipart_request("/api/avatars", body).to_request()).await;
    assert_eq!(resp.status(), 201);
    let first: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(first["is_current"], true);
    assert!(first["avatar_url"].as_str().unwrap().starts_with("/uploads/avatars/"));

    // a second upload without set_current leaves the first current
    let body = build_multipart("avatar", "face2.png", &sample_png(), &[]);
    let resp = test::call_service(&app, multipart_request("/api/avatars", body).to_request()).await;
    assert_eq!(resp.status(), 201);
    let second: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(second["is_current"], false);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/avatars/current").to_request()).await;
    let current: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(current["id"], first["id"]);

    // promote the second via the gallery endpoint
    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri(&format!("/api/avatars/{}/current", second["id"].as_i64().unwrap()))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/avatars").to_request()).await;
    let gallery: serde_json::Value = test::read_body_json(resp).await;
    let gallery = gallery.as_array().unwrap();
    assert_eq!(gallery.len(), 2);
    // newest first
    assert_eq!(gallery[0]["id"], second["id"]);
    assert_eq!(gallery[0]["is_current"], true);
    assert_eq!(gallery[1]["is_current"], false);
}

#[actix_web::test]
#[serial]
async fn media_upload_stores_and_serves() {
    let ctx = context();
    seed_user(&ctx).await;
    let app = app!(ctx);

    let body = build_multipart("file", "photo.png", &sample_png(), &[]);
    let resp = test::call_service(&app, multipart_request("/api/media/upload", body).to_request()).await;
    assert_eq!(resp.status(), 201);
    let uploaded: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(uploaded["media_type"], "image");
    assert_eq!(uploaded["mime_type"], "image/png");
    let file_url = uploaded["file_url"].as_str().unwrap().to_string();
    assert!(file_url.starts_with("/uploads/images/"));
    assert!(uploaded["thumbnail_url"].as_str().unwrap().starts_with("/uploads/thumbnails/thumb_"));

    // the stored file is reachable through the public uploads route
    let resp = test::call_service(&app, test::TestRequest::get().uri(&file_url).to_request()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
    let bytes = test::read_body(resp).await;
    assert_eq!(bytes.as_ref(), sample_png().as_slice());

    // unknown category 404s rather than touching the store
    let resp = test::call_service(&app, test::TestRequest::get().uri("/uploads/other/x.png").to_request()).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn upload_rejects_unknown_extensions() {
    let ctx = context();
    seed_user(&ctx).await;
    let app = app!(ctx);

    let body = build_multipart("file", "script.exe", b"MZ fake binary", &[]);
    let resp = test::call_service(&app, multipart_request("/api/media/upload", body).to_request()).await;
    assert_eq!(resp.status(), 400);
    let err: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(err["error"], "Invalid file type");
}

#[actix_web::test]
#[serial]
async fn delete_media_removes_row_and_file() {
    let ctx = context();
    let user = seed_user(&ctx).await;

    // store a file first so the handler has something to remove
    let stored = ctx
        .state
        .media_store
        .store(MediaCategory::Images, "png", &sample_png())
        .await
        .unwrap();
    let post = ctx
        .repo
        .create_post(CreatePost {
            user_id: user.id,
            avatar_id: None,
            content_type: ContentType::Image,
            text_content: None,
            metadata: serde_json::json!({}),
            media_items: vec![NewMedia {
                media_type: MediaType::Image,
                file_url: stored.file_url.clone(),
                is_external: false,
                thumbnail_url: None,
                file_size: Some(stored.size),
                mime_type: Some("image/png".to_string()),
            }],
            location: None,
            whisper_mode: false,
        })
        .await
        .unwrap();
    let media_id = ctx.repo.media_for_post(post.id).await.unwrap()[0].id;
    let app = app!(ctx);

    let resp = test::call_service(
        &app,
        test::TestRequest::delete().uri(&format!("/api/media/{media_id}")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    // row gone
    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri(&format!("/api/media/post/{}", post.id)).to_request(),
    )
    .await;
    let rows: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(rows.as_array().unwrap().len(), 0);

    // file gone from the store
    let resp = test::call_service(&app, test::TestRequest::get().uri(&stored.file_url).to_request()).await;
    assert_eq!(resp.status(), 404);

    // deleting again 404s
    let resp = test::call_service(
        &app,
        test::TestRequest::delete().uri(&format!("/api/media/{media_id}")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
}
