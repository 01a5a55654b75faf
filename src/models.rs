use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub type Id = i64;

/// What kind of payload a post carries. Reposts always use `Repost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Video,
    Audio,
    Youtube,
    Music,
    Link,
    Mixed,
    Repost,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
            ContentType::Youtube => "youtube",
            ContentType::Music => "music",
            ContentType::Link => "link",
            ContentType::Mixed => "mixed",
            ContentType::Repost => "repost",
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentType::Text),
            "image" => Ok(ContentType::Image),
            "video" => Ok(ContentType::Video),
            "audio" => Ok(ContentType::Audio),
            "youtube" => Ok(ContentType::Youtube),
            "music" => Ok(ContentType::Music),
            "link" => Ok(ContentType::Link),
            "mixed" => Ok(ContentType::Mixed),
            "repost" => Ok(ContentType::Repost),
            other => Err(format!("unknown content type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Unknown,
}

impl MediaType {
    /// Classify by MIME prefix the way the upload pipeline does.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            MediaType::Image
        } else if mime.starts_with("video/") {
            MediaType::Video
        } else if mime.starts_with("audio/") {
            MediaType::Audio
        } else {
            MediaType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "unknown" => Ok(MediaType::Unknown),
            other => Err(format!("unknown media type '{other}'")),
        }
    }
}

/// Timeline visibility filter: public hides whisper posts, private shows
/// only whisper posts, all applies no filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Public,
    Private,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Avatar {
    pub id: Id,
    pub user_id: Id,
    pub avatar_url: String,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Post {
    pub id: Id,
    pub user_id: Id,
    pub avatar_id: Option<Id>,
    pub content_type: ContentType,
    pub text_content: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: Value,
    pub reposted_from_id: Option<Id>,
    pub repost_comment: Option<String>,
    pub whisper_mode: bool,
    pub location_latitude: Option<f64>,
    pub location_longitude: Option<f64>,
    pub location_accuracy: Option<f64>,
    pub location_address: Option<String>,
    pub location_city: Option<String>,
    pub location_province: Option<String>,
    pub location_district: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker; set rows only show up in the recycle bin.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Post {
    pub fn is_repost(&self) -> bool {
        self.reposted_from_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Media {
    pub id: Id,
    pub post_id: Id,
    pub media_type: MediaType,
    pub file_url: String,
    pub is_external: bool,
    pub thumbnail_url: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
}

// ---------------- request bodies ----------------

/// Media descriptor attached to a post create/update. Mirrors the media
/// table minus id/post_id.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewMedia {
    pub media_type: MediaType,
    pub file_url: String,
    #[serde(default)]
    pub is_external: bool,
    pub thumbnail_url: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
}

/// Raw location as reported by the client; address fields may be absent,
/// in which case the geocoding collaborator fills them in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LocationInput {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub district: Option<String>,
}

/// Fully resolved location, ready to persist on the post row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LocationData {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub district: Option<String>,
}

/// Create-post body. `user_id` and `content_type` are validated in the
/// handler so a missing field yields the API's own 400 shape instead of a
/// deserialization error.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    pub user_id: Option<Id>,
    pub content_type: Option<ContentType>,
    pub text_content: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    pub media_items: Option<Vec<NewMedia>>,
    pub location: Option<LocationInput>,
    pub whisper_mode: Option<bool>,
}

/// Update-post body. `media_items: None` means "leave media untouched";
/// an explicit empty list removes all media.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdatePost {
    pub content_type: Option<ContentType>,
    pub text_content: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    pub media_items: Option<Vec<NewMedia>>,
    pub whisper_mode: Option<bool>,
}

/// Fully validated create-post input handed to the repository: the handler
/// has resolved the avatar and location by this point.
#[derive(Debug, Clone)]
pub struct CreatePost {
    pub user_id: Id,
    pub avatar_id: Option<Id>,
    pub content_type: ContentType,
    pub text_content: Option<String>,
    pub metadata: Value,
    pub media_items: Vec<NewMedia>,
    pub location: Option<LocationData>,
    pub whisper_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewRepost {
    pub user_id: Option<Id>,
    pub repost_comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateProfile {
    pub username: Option<String>,
    pub email: Option<String>,
}

// ---------------- assembled views ----------------

/// Avatar snapshot embedded in feed rows.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AvatarRef {
    pub id: Id,
    pub avatar_url: String,
}

/// One level of the repost chain: the post being reposted, with its own
/// avatar and media. If the target is itself a repost its narrative lives
/// in `repost_comment`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RepostedPost {
    pub id: Id,
    pub user_id: Id,
    pub avatar_id: Option<Id>,
    pub content_type: ContentType,
    pub text_content: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: Value,
    pub reposted_from_id: Option<Id>,
    pub repost_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub avatar: Option<AvatarRef>,
    pub media: Vec<Media>,
}

/// A feed row: the post plus its denormalized avatar, media list (ordered
/// by media id) and, for reposts, the nested original.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostView {
    #[serde(flatten)]
    pub post: Post,
    pub avatar: Option<AvatarRef>,
    pub media: Vec<Media>,
    pub reposted_post: Option<RepostedPost>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

impl Pagination {
    pub fn new(total: i64, page: i64, limit: i64) -> Self {
        let offset = (page - 1) * limit;
        Self { total, page, limit, has_more: offset + limit < total }
    }
}

/// Paginated feed envelope.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Page {
    pub posts: Vec<PostView>,
    pub pagination: Pagination,
}

/// Default user plus their current avatar, as served by /api/user/profile.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    #[serde(flatten)]
    pub user: User,
    pub current_avatar: Option<Avatar>,
}
