use crate::models::{
    Avatar, AvatarRef, ContentType, LocationData, LocationInput, Media, MediaType, NewMedia,
    NewPost, NewRepost, Page, Pagination, Post, PostView, RepostedPost, UpdatePost, UpdateProfile,
    User, UserProfile, ViewMode,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_posts,
        crate::routes::search_posts,
        crate::routes::deleted_posts,
        crate::routes::get_post,
        crate::routes::create_post,
        crate::routes::update_post,
        crate::routes::delete_post,
        crate::routes::repost_post,
        crate::routes::restore_post,
        crate::routes::permanently_delete_post,
        crate::routes::upload_media,
        crate::routes::delete_media,
        crate::routes::media_by_post,
        crate::routes::get_profile,
        crate::routes::update_profile,
        crate::routes::list_avatars,
        crate::routes::upload_avatar,
        crate::routes::current_avatar,
        crate::routes::set_current_avatar,
    ),
    components(schemas(
        User, UserProfile, Avatar, AvatarRef, Post, PostView, RepostedPost,
        Media, NewMedia, NewPost, UpdatePost, NewRepost, UpdateProfile,
        Page, Pagination, ContentType, MediaType, ViewMode,
        LocationInput, LocationData,
        crate::routes::MediaUploadResponse,
    )),
    tags(
        (name = "posts", description = "Post and repost operations"),
        (name = "media", description = "Media upload and lookup"),
        (name = "avatars", description = "Avatar gallery"),
        (name = "user", description = "Default user profile")
    )
)]
pub struct ApiDoc;
