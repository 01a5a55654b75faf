use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt as _;
use serde::Deserialize;

use crate::error::ApiError;
use crate::geocode::{resolve_location, Geocoder};
use crate::models::*;
use crate::repo::{Repo, RepoError};
use crate::storage::{MediaCategory, MediaStore, MediaStoreError};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            // fixed segments must register before /posts/{id}
            .service(web::resource("/posts/search").route(web::get().to(search_posts)))
            .service(web::resource("/posts/deleted").route(web::get().to(deleted_posts)))
            .service(
                web::resource("/posts/{id}")
                    .route(web::get().to(get_post))
                    .route(web::put().to(update_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(web::resource("/posts/{id}/repost").route(web::post().to(repost_post)))
            .service(web::resource("/posts/{id}/restore").route(web::post().to(restore_post)))
            .service(web::resource("/posts/{id}/permanent").route(web::delete().to(permanently_delete_post)))
            .service(web::resource("/media/upload").route(web::post().to(upload_media)))
            .service(web::resource("/media/post/{post_id}").route(web::get().to(media_by_post)))
            .service(web::resource("/media/{id}").route(web::delete().to(delete_media)))
            .service(
                web::resource("/user/profile")
                    .route(web::get().to(get_profile))
                    .route(web::put().to(update_profile)),
            )
            .service(
                web::resource("/avatars")
                    .route(web::get().to(list_avatars))
                    .route(web::post().to(upload_avatar)),
            )
            .service(web::resource("/avatars/current").route(web::get().to(current_avatar)))
            .service(web::resource("/avatars/{id}/current").route(web::put().to(set_current_avatar))),
    );
    // public fetch route so <img src="/uploads/..."> works without the /api prefix
    cfg.route("/uploads/{category}/{filename}", web::get().to(serve_upload));
    cfg.route("/health", web::get().to(health));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub media_store: Arc<dyn MediaStore>,
    pub geocoder: Arc<dyn Geocoder>,
}

fn default_page() -> i64 {
    1
}
fn default_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub view_mode: ViewMode,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub view_mode: ViewMode,
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "message": "Orbit backend is running"
    }))
}

// ---------------- posts ----------------

#[utoipa::path(
    get,
    path = "/api/posts",
    params(
        ("page" = Option<i64>, Query, description = "1-based page number"),
        ("limit" = Option<i64>, Query, description = "Page size"),
        ("view_mode" = Option<String>, Query, description = "public | private | all")
    ),
    responses((status = 200, description = "Paginated feed", body = Page))
)]
pub async fn list_posts(data: web::Data<AppState>, query: web::Query<ListQuery>) -> Result<HttpResponse, ApiError> {
    let page = data.repo.list_posts(query.page, query.limit, query.view_mode).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    get,
    path = "/api/posts/search",
    params(
        ("q" = String, Query, description = "Keyword, case-insensitive substring"),
        ("page" = Option<i64>, Query, description = "1-based page number"),
        ("limit" = Option<i64>, Query, description = "Page size"),
        ("view_mode" = Option<String>, Query, description = "public | private | all")
    ),
    responses(
        (status = 200, description = "Matching posts", body = Page),
        (status = 400, description = "Missing search query")
    )
)]
pub async fn search_posts(data: web::Data<AppState>, query: web::Query<SearchQuery>) -> Result<HttpResponse, ApiError> {
    let keyword = query.q.as_deref().map(str::trim).unwrap_or("");
    if keyword.is_empty() {
        return Err(ApiError::MissingQuery);
    }
    let page = data
        .repo
        .search_posts(keyword, query.page, query.limit, query.view_mode)
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    get,
    path = "/api/posts/deleted",
    params(
        ("page" = Option<i64>, Query, description = "1-based page number"),
        ("limit" = Option<i64>, Query, description = "Page size")
    ),
    responses((status = 200, description = "Recycle bin, newest-deleted first", body = Page))
)]
pub async fn deleted_posts(data: web::Data<AppState>, query: web::Query<ListQuery>) -> Result<HttpResponse, ApiError> {
    let page = data.repo.deleted_posts(query.page, query.limit).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    get,
    path = "/api/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Assembled post", body = PostView),
        (status = 404, description = "Post not found")
    )
)]
pub async fn get_post(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let view = data.repo.get_post(path.into_inner()).await?.ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(view))
}

#[utoipa::path(
    post,
    path = "/api/posts",
    request_body = NewPost,
    responses(
        (status = 201, description = "Post created", body = PostView),
        (status = 400, description = "Missing required fields")
    )
)]
pub async fn create_post(
    data: web::Data<AppState>,
    payload: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    let (user_id, content_type) = match (body.user_id, body.content_type) {
        (Some(u), Some(c)) => (u, c),
        _ => {
            return Err(ApiError::Validation(
                "user_id and content_type are required".to_string(),
            ))
        }
    };

    // stamp the post with the avatar active right now
    let avatar_id = data.repo.current_avatar(user_id).await?.map(|a| a.id);

    let location = match &body.location {
        Some(input) => resolve_location(data.geocoder.as_ref(), input).await,
        None => None,
    };

    let post = data
        .repo
        .create_post(CreatePost {
            user_id,
            avatar_id,
            content_type,
            text_content: body.text_content,
            metadata: body.metadata.unwrap_or_else(|| serde_json::json!({})),
            media_items: body.media_items.unwrap_or_default(),
            location,
            whisper_mode: body.whisper_mode.unwrap_or(false),
        })
        .await?;

    let view = data.repo.get_post(post.id).await?.ok_or(ApiError::Internal)?;
    Ok(HttpResponse::Created().json(view))
}

#[utoipa::path(
    put,
    path = "/api/posts/{id}",
    request_body = UpdatePost,
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post updated", body = PostView),
        (status = 404, description = "Post not found")
    )
)]
pub async fn update_post(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdatePost>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    data.repo.update_post(id, payload.into_inner()).await?;
    let view = data.repo.get_post(id).await?.ok_or(ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(view))
}

#[utoipa::path(
    delete,
    path = "/api/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post soft-deleted"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn delete_post(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let post = data.repo.soft_delete_post(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Post deleted successfully",
        "post": post
    })))
}

#[utoipa::path(
    post,
    path = "/api/posts/{id}/repost",
    request_body = NewRepost,
    params(("id" = Id, Path, description = "Post being reposted")),
    responses(
        (status = 201, description = "Repost created", body = PostView),
        (status = 400, description = "Missing required fields"),
        (status = 404, description = "Original post not found")
    )
)]
pub async fn repost_post(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewRepost>,
) -> Result<HttpResponse, ApiError> {
    let original_id = path.into_inner();
    let body = payload.into_inner();
    let user_id = body
        .user_id
        .ok_or_else(|| ApiError::Validation("user_id is required".to_string()))?;

    let avatar_id = data.repo.current_avatar(user_id).await?.map(|a| a.id);

    let post = data
        .repo
        .repost(user_id, original_id, body.repost_comment, avatar_id)
        .await
        .map_err(|e| match e {
            RepoError::NotFound => ApiError::OriginalNotFound,
            other => other.into(),
        })?;

    let view = data.repo.get_post(post.id).await?.ok_or(ApiError::Internal)?;
    Ok(HttpResponse::Created().json(view))
}

#[utoipa::path(
    post,
    path = "/api/posts/{id}/restore",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post restored"),
        (status = 404, description = "Post not found or already restored")
    )
)]
pub async fn restore_post(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let post = data.repo.restore_post(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Post restored successfully",
        "post": post
    })))
}

#[utoipa::path(
    delete,
    path = "/api/posts/{id}/permanent",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post permanently deleted"),
        (status = 404, description = "Post not found in recycle bin")
    )
)]
pub async fn permanently_delete_post(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let post = data.repo.permanently_delete_post(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Post permanently deleted",
        "post": post
    })))
}

// ---------------- media ----------------

const UPLOAD_SIZE_LIMIT: usize = 50 * 1024 * 1024; // 50 MB

const ALLOWED_EXTS: &[&str] = &[
    "jpeg", "jpg", "png", "gif", "webp", "mp4", "webm", "mov", "mp3", "wav", "ogg", "m4a",
];

struct UploadedFile {
    field_name: String,
    ext: String,
    bytes: Vec<u8>,
}

/// Drain a multipart payload: the first file field plus any `set_current`
/// text field. Enforces the size limit and the allowed-extension set.
async fn read_multipart(payload: &mut Multipart) -> Result<(Option<UploadedFile>, bool), ApiError> {
    let mut file: Option<UploadedFile> = None;
    let mut set_current = false;

    while let Some(mut field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::Internal
    })? {
        let cd = field.content_disposition();
        let name = cd.get_name().unwrap_or("").to_string();
        let filename = cd.get_filename().map(|f| f.to_string());

        match filename {
            Some(original) if file.is_none() => {
                let ext = original.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
                if !ALLOWED_EXTS.contains(&ext.as_str()) {
                    return Err(ApiError::InvalidFileType);
                }
                let mut bytes: Vec<u8> = Vec::new();
                while let Some(chunk) = field.try_next().await.map_err(|e| {
                    log::error!("stream read error: {e}");
                    ApiError::Internal
                })? {
                    if bytes.len() + chunk.len() > UPLOAD_SIZE_LIMIT {
                        return Err(ApiError::FileTooLarge);
                    }
                    bytes.extend_from_slice(&chunk);
                }
                file = Some(UploadedFile { field_name: name, ext, bytes });
            }
            _ => {
                // text field; only set_current is meaningful
                let mut bytes: Vec<u8> = Vec::new();
                while let Some(chunk) = field.try_next().await.map_err(|e| {
                    log::error!("stream read error: {e}");
                    ApiError::Internal
                })? {
                    bytes.extend_from_slice(&chunk);
                }
                if name == "set_current" {
                    let v = String::from_utf8_lossy(&bytes);
                    set_current = v == "true" || v == "1";
                }
            }
        }
    }
    Ok((file, set_current))
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct MediaUploadResponse {
    pub filename: String,
    pub media_type: MediaType,
    pub file_url: String,
    pub thumbnail_url: Option<String>,
    pub file_size: i64,
    pub mime_type: String,
}

#[utoipa::path(
    post,
    path = "/api/media/upload",
    responses(
        (status = 201, description = "File stored", body = MediaUploadResponse),
        (status = 400, description = "No file uploaded / invalid type / too large")
    )
)]
pub async fn upload_media(data: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse, ApiError> {
    let (file, _) = read_multipart(&mut payload).await?;
    let file = file.ok_or_else(|| ApiError::Validation("No file uploaded".to_string()))?;

    let mime = infer::get(&file.bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into());
    let media_type = MediaType::from_mime(&mime);
    let category = MediaCategory::for_upload(&file.field_name, media_type);

    let stored = data
        .media_store
        .store(category, &file.ext, &file.bytes)
        .await
        .map_err(|e| {
            log::error!("media store save error: {e}");
            ApiError::Internal
        })?;

    let thumbnail_url = if media_type == MediaType::Image {
        data.media_store.generate_thumbnail(category, &stored.filename).await
    } else {
        None
    };

    // no DB row yet: media rows are created with the owning post
    Ok(HttpResponse::Created().json(MediaUploadResponse {
        filename: stored.filename,
        media_type,
        file_url: stored.file_url,
        thumbnail_url,
        file_size: stored.size,
        mime_type: mime,
    }))
}

#[utoipa::path(
    delete,
    path = "/api/media/{id}",
    params(("id" = Id, Path, description = "Media id")),
    responses(
        (status = 200, description = "Media deleted"),
        (status = 404, description = "Media not found")
    )
)]
pub async fn delete_media(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let media = data.repo.get_media(id).await?.ok_or(ApiError::NotFound)?;

    // local files go with the row; external links have nothing to remove
    if !media.is_external {
        if let Err(e) = data.media_store.delete(&media.file_url).await {
            log::warn!("failed to delete stored file {}: {e}", media.file_url);
        }
        if let Some(thumb) = &media.thumbnail_url {
            if let Err(e) = data.media_store.delete(thumb).await {
                log::warn!("failed to delete thumbnail {thumb}: {e}");
            }
        }
    }
    data.repo.delete_media(id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Media deleted successfully" })))
}

#[utoipa::path(
    get,
    path = "/api/media/post/{post_id}",
    params(("post_id" = Id, Path, description = "Owning post id")),
    responses((status = 200, description = "Media rows for the post", body = [Media]))
)]
pub async fn media_by_post(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let media = data.repo.media_for_post(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(media))
}

pub async fn serve_upload(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (category, filename) = path.into_inner();
    let category = MediaCategory::parse(&category).ok_or(ApiError::NotFound)?;
    match data.media_store.load(category, &filename).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok().insert_header(("Content-Type", mime)).body(bytes)),
        Err(MediaStoreError::NotFound) | Err(MediaStoreError::InvalidPath) => Err(ApiError::NotFound),
        Err(e) => {
            log::error!("media store load error: {e}");
            Err(ApiError::Internal)
        }
    }
}

// ---------------- user ----------------

#[utoipa::path(
    get,
    path = "/api/user/profile",
    responses(
        (status = 200, description = "Default user with current avatar", body = UserProfile),
        (status = 404, description = "User not found")
    )
)]
pub async fn get_profile(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.default_user().await?.ok_or(ApiError::NotFound)?;
    let current_avatar = data.repo.current_avatar(user.id).await?;
    Ok(HttpResponse::Ok().json(UserProfile { user, current_avatar }))
}

#[utoipa::path(
    put,
    path = "/api/user/profile",
    request_body = UpdateProfile,
    responses(
        (status = 200, description = "Profile updated", body = User),
        (status = 400, description = "Missing required fields"),
        (status = 404, description = "User not found")
    )
)]
pub async fn update_profile(
    data: web::Data<AppState>,
    payload: web::Json<UpdateProfile>,
) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    let (username, email) = match (body.username.as_deref(), body.email.as_deref()) {
        (Some(u), Some(e)) if !u.trim().is_empty() && !e.trim().is_empty() => (u, e),
        _ => return Err(ApiError::Validation("username and email are required".to_string())),
    };
    let user = data.repo.default_user().await?.ok_or(ApiError::NotFound)?;
    let updated = data.repo.update_user(user.id, username, email).await?;
    Ok(HttpResponse::Ok().json(updated))
}

// ---------------- avatars ----------------

#[utoipa::path(
    get,
    path = "/api/avatars",
    responses((status = 200, description = "All avatars, newest first", body = [Avatar]))
)]
pub async fn list_avatars(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.default_user().await?.ok_or(ApiError::NotFound)?;
    let avatars = data.repo.avatars_for_user(user.id).await?;
    Ok(HttpResponse::Ok().json(avatars))
}

#[utoipa::path(
    post,
    path = "/api/avatars",
    responses(
        (status = 201, description = "Avatar uploaded", body = Avatar),
        (status = 400, description = "No file uploaded")
    )
)]
pub async fn upload_avatar(data: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse, ApiError> {
    let (file, set_current) = read_multipart(&mut payload).await?;
    let file = file.ok_or_else(|| ApiError::Validation("No file uploaded".to_string()))?;

    let user = data.repo.default_user().await?.ok_or(ApiError::NotFound)?;
    let stored = data
        .media_store
        .store(MediaCategory::Avatars, &file.ext, &file.bytes)
        .await
        .map_err(|e| {
            log::error!("avatar store save error: {e}");
            ApiError::Internal
        })?;

    let avatar = data.repo.create_avatar(user.id, &stored.file_url, set_current).await?;
    Ok(HttpResponse::Created().json(avatar))
}

#[utoipa::path(
    get,
    path = "/api/avatars/current",
    responses(
        (status = 200, description = "Current avatar", body = Avatar),
        (status = 404, description = "No current avatar set")
    )
)]
pub async fn current_avatar(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.default_user().await?.ok_or(ApiError::NotFound)?;
    let avatar = data.repo.current_avatar(user.id).await?.ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(avatar))
}

#[utoipa::path(
    put,
    path = "/api/avatars/{id}/current",
    params(("id" = Id, Path, description = "Avatar id")),
    responses(
        (status = 200, description = "Avatar set as current", body = Avatar),
        (status = 404, description = "Avatar not found")
    )
)]
pub async fn set_current_avatar(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.default_user().await?.ok_or(ApiError::NotFound)?;
    let avatar = data.repo.set_current_avatar(path.into_inner(), user.id).await?;
    Ok(HttpResponse::Ok().json(avatar))
}
