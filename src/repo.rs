use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("foreign key violation")]
    ForeignKey,
    #[error("internal: {0}")]
    Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// The single user this deployment serves (lowest id wins).
    async fn default_user(&self) -> RepoResult<Option<User>>;
    async fn create_user(&self, username: &str, email: &str) -> RepoResult<User>;
    async fn update_user(&self, id: Id, username: &str, email: &str) -> RepoResult<User>;
}

#[async_trait]
pub trait AvatarRepo: Send + Sync {
    /// Insert an avatar; when `is_current` the user's other avatars are
    /// demoted in the same transaction.
    async fn create_avatar(&self, user_id: Id, avatar_url: &str, is_current: bool) -> RepoResult<Avatar>;
    /// All avatars for a user, newest first.
    async fn avatars_for_user(&self, user_id: Id) -> RepoResult<Vec<Avatar>>;
    async fn current_avatar(&self, user_id: Id) -> RepoResult<Option<Avatar>>;
    /// Promote one avatar, demoting the rest. Scoped to `user_id` so an id
    /// belonging to another user is a NotFound, not a hijack.
    async fn set_current_avatar(&self, id: Id, user_id: Id) -> RepoResult<Avatar>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn list_posts(&self, page: i64, limit: i64, view: ViewMode) -> RepoResult<Page>;
    async fn search_posts(&self, keyword: &str, page: i64, limit: i64, view: ViewMode) -> RepoResult<Page>;
    /// Recycle bin: soft-deleted posts, newest-deleted first.
    async fn deleted_posts(&self, page: i64, limit: i64) -> RepoResult<Page>;
    /// Assembled view of one live post.
    async fn get_post(&self, id: Id) -> RepoResult<Option<PostView>>;
    async fn create_post(&self, new: CreatePost) -> RepoResult<Post>;
    async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post>;
    async fn soft_delete_post(&self, id: Id) -> RepoResult<Post>;
    /// Insert a repost of a live post; whisper_mode is inherited from the
    /// target at this instant.
    async fn repost(&self, user_id: Id, original_post_id: Id, repost_comment: Option<String>, avatar_id: Option<Id>) -> RepoResult<Post>;
    async fn restore_post(&self, id: Id) -> RepoResult<Post>;
    /// Hard delete, only valid on rows already in the recycle bin. Removes
    /// dependent media rows.
    async fn permanently_delete_post(&self, id: Id) -> RepoResult<Post>;
}

#[async_trait]
pub trait MediaRepo: Send + Sync {
    async fn media_for_post(&self, post_id: Id) -> RepoResult<Vec<Media>>;
    async fn get_media(&self, id: Id) -> RepoResult<Option<Media>>;
    async fn delete_media(&self, id: Id) -> RepoResult<Media>;
}

pub trait Repo: UserRepo + AvatarRepo + PostRepo + MediaRepo {}

impl<T> Repo for T where T: UserRepo + AvatarRepo + PostRepo + MediaRepo {}

/// Create the default user on first boot. The system serves exactly one
/// user; there is no signup flow. A no-op when a user already exists.
pub async fn ensure_default_user(repo: &dyn Repo) -> anyhow::Result<()> {
    if repo.default_user().await?.is_some() {
        return Ok(());
    }
    let username = std::env::var("DEFAULT_USERNAME").ok();
    let email = std::env::var("DEFAULT_EMAIL").ok();
    let (username, email) = match (username, email) {
        (Some(u), Some(e)) if !u.is_empty() && !e.is_empty() => (u, e),
        _ => anyhow::bail!(
            "no user found in database. Set DEFAULT_USERNAME and DEFAULT_EMAIL to create the default user on first run"
        ),
    };
    repo.create_user(&username, &email).await?;
    log::info!("Created default user: {username} <{email}>");
    Ok(())
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        avatars: HashMap<Id, Avatar>,
        posts: HashMap<Id, Post>,
        media: HashMap<Id, Media>,
        next_id: Id,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn snapshot_path() -> PathBuf {
            match std::env::var("ORBIT_DATA_DIR") {
                Ok(dir) => {
                    let mut p = PathBuf::from(dir);
                    p.push("state.json");
                    p
                }
                Err(_) => PathBuf::from(SNAPSHOT_PATH),
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        log::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        log::warn!("failed to parse snapshot '{}': {e}. Starting empty.", path.display());
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    log::error!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }

        // ---------- assembly ----------

        fn avatar_ref(s: &State, avatar_id: Option<Id>) -> Option<AvatarRef> {
            let a = s.avatars.get(&avatar_id?)?;
            Some(AvatarRef { id: a.id, avatar_url: a.avatar_url.clone() })
        }

        fn media_of(s: &State, post_id: Id) -> Vec<Media> {
            let mut v: Vec<_> = s.media.values().filter(|m| m.post_id == post_id).cloned().collect();
            v.sort_by_key(|m| m.id);
            v
        }

        /// Nested one-level view of the repost target. In normal listings a
        /// soft-deleted target drops out (the left join would not match);
        /// the recycle bin keeps it so the bin can show what was reposted.
        fn reposted_view(s: &State, post: &Post, include_deleted_target: bool) -> Option<RepostedPost> {
            let target = s.posts.get(&post.reposted_from_id?)?;
            if target.deleted_at.is_some() && !include_deleted_target {
                return None;
            }
            Some(RepostedPost {
                id: target.id,
                user_id: target.user_id,
                avatar_id: target.avatar_id,
                content_type: target.content_type,
                text_content: target.text_content.clone(),
                metadata: target.metadata.clone(),
                reposted_from_id: target.reposted_from_id,
                repost_comment: target.repost_comment.clone(),
                created_at: target.created_at,
                avatar: Self::avatar_ref(s, target.avatar_id),
                media: Self::media_of(s, target.id),
            })
        }

        fn assemble(s: &State, post: &Post, include_deleted_target: bool) -> PostView {
            PostView {
                post: post.clone(),
                avatar: Self::avatar_ref(s, post.avatar_id),
                media: Self::media_of(s, post.id),
                reposted_post: Self::reposted_view(s, post, include_deleted_target),
            }
        }

        fn matches_view(post: &Post, view: ViewMode) -> bool {
            match view {
                ViewMode::Public => !post.whisper_mode,
                ViewMode::Private => post.whisper_mode,
                ViewMode::All => true,
            }
        }

        fn paginate(posts: Vec<PostView>, total: i64, page: i64, limit: i64) -> Page {
            Page { posts, pagination: Pagination::new(total, page, limit) }
        }

        fn page_slice<T>(mut items: Vec<T>, page: i64, limit: i64) -> (Vec<T>, i64) {
            let total = items.len() as i64;
            let offset = ((page - 1) * limit).max(0) as usize;
            let items = if offset >= items.len() {
                Vec::new()
            } else {
                items.drain(offset..).take(limit.max(0) as usize).collect()
            };
            (items, total)
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn default_user(&self) -> RepoResult<Option<User>> {
            let s = self.state.read().unwrap();
            Ok(s.users.values().min_by_key(|u| u.id).cloned())
        }

        async fn create_user(&self, username: &str, email: &str) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            if s.users.values().any(|u| u.username == username) {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let user = User {
                id,
                username: username.to_string(),
                email: email.to_string(),
                created_at: Utc::now(),
            };
            s.users.insert(id, user.clone());
            drop(s);
            self.persist();
            Ok(user)
        }

        async fn update_user(&self, id: Id, username: &str, email: &str) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
            user.username = username.to_string();
            user.email = email.to_string();
            let updated = user.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }
    }

    #[async_trait]
    impl AvatarRepo for InMemRepo {
        async fn create_avatar(&self, user_id: Id, avatar_url: &str, is_current: bool) -> RepoResult<Avatar> {
            let mut s = self.state.write().unwrap();
            if !s.users.contains_key(&user_id) {
                return Err(RepoError::ForeignKey);
            }
            if is_current {
                for a in s.avatars.values_mut().filter(|a| a.user_id == user_id) {
                    a.is_current = false;
                }
            }
            let id = Self::next_id(&mut s);
            let avatar = Avatar {
                id,
                user_id,
                avatar_url: avatar_url.to_string(),
                is_current,
                created_at: Utc::now(),
            };
            s.avatars.insert(id, avatar.clone());
            drop(s);
            self.persist();
            Ok(avatar)
        }

        async fn avatars_for_user(&self, user_id: Id) -> RepoResult<Vec<Avatar>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s.avatars.values().filter(|a| a.user_id == user_id).cloned().collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(v)
        }

        async fn current_avatar(&self, user_id: Id) -> RepoResult<Option<Avatar>> {
            let s = self.state.read().unwrap();
            Ok(s.avatars.values().find(|a| a.user_id == user_id && a.is_current).cloned())
        }

        async fn set_current_avatar(&self, id: Id, user_id: Id) -> RepoResult<Avatar> {
            let mut s = self.state.write().unwrap();
            // ownership check first so a miss leaves the current flag alone
            if !s.avatars.get(&id).map(|a| a.user_id == user_id).unwrap_or(false) {
                return Err(RepoError::NotFound);
            }
            for a in s.avatars.values_mut().filter(|a| a.user_id == user_id) {
                a.is_current = a.id == id;
            }
            let updated = s.avatars.get(&id).cloned().ok_or(RepoError::NotFound)?;
            drop(s);
            self.persist();
            Ok(updated)
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn list_posts(&self, page: i64, limit: i64, view: ViewMode) -> RepoResult<Page> {
            let s = self.state.read().unwrap();
            let mut live: Vec<_> = s
                .posts
                .values()
                .filter(|p| p.deleted_at.is_none() && Self::matches_view(p, view))
                .collect();
            live.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            let views: Vec<_> = live.into_iter().map(|p| Self::assemble(&s, p, false)).collect();
            let (posts, total) = Self::page_slice(views, page, limit);
            Ok(Self::paginate(posts, total, page, limit))
        }

        async fn search_posts(&self, keyword: &str, page: i64, limit: i64, view: ViewMode) -> RepoResult<Page> {
            let needle = keyword.to_lowercase();
            let s = self.state.read().unwrap();
            let contains = |text: &Option<String>| {
                text.as_deref().map(|t| t.to_lowercase().contains(&needle)).unwrap_or(false)
            };
            let mut hits: Vec<_> = s
                .posts
                .values()
                .filter(|p| p.deleted_at.is_none() && Self::matches_view(p, view))
                .filter(|p| {
                    if contains(&p.text_content) || contains(&p.repost_comment) {
                        return true;
                    }
                    // a repost is also discoverable by its live target's text
                    p.reposted_from_id
                        .and_then(|id| s.posts.get(&id))
                        .filter(|t| t.deleted_at.is_none())
                        .map(|t| contains(&t.text_content) || contains(&t.repost_comment))
                        .unwrap_or(false)
                })
                .collect();
            hits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            let views: Vec<_> = hits.into_iter().map(|p| Self::assemble(&s, p, false)).collect();
            let (posts, total) = Self::page_slice(views, page, limit);
            Ok(Self::paginate(posts, total, page, limit))
        }

        async fn deleted_posts(&self, page: i64, limit: i64) -> RepoResult<Page> {
            let s = self.state.read().unwrap();
            let mut gone: Vec<_> = s.posts.values().filter(|p| p.deleted_at.is_some()).collect();
            gone.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at).then(b.id.cmp(&a.id)));
            let views: Vec<_> = gone.into_iter().map(|p| Self::assemble(&s, p, true)).collect();
            let (posts, total) = Self::page_slice(views, page, limit);
            Ok(Self::paginate(posts, total, page, limit))
        }

        async fn get_post(&self, id: Id) -> RepoResult<Option<PostView>> {
            let s = self.state.read().unwrap();
            Ok(s.posts
                .get(&id)
                .filter(|p| p.deleted_at.is_none())
                .map(|p| Self::assemble(&s, p, false)))
        }

        async fn create_post(&self, new: CreatePost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            if !s.users.contains_key(&new.user_id) {
                return Err(RepoError::ForeignKey);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let loc = new.location;
            let post = Post {
                id,
                user_id: new.user_id,
                avatar_id: new.avatar_id,
                content_type: new.content_type,
                text_content: new.text_content,
                metadata: new.metadata,
                reposted_from_id: None,
                repost_comment: None,
                whisper_mode: new.whisper_mode,
                location_latitude: loc.as_ref().map(|l| l.latitude),
                location_longitude: loc.as_ref().map(|l| l.longitude),
                location_accuracy: loc.as_ref().and_then(|l| l.accuracy),
                location_address: loc.as_ref().and_then(|l| l.address.clone()),
                location_city: loc.as_ref().and_then(|l| l.city.clone()),
                location_province: loc.as_ref().and_then(|l| l.province.clone()),
                location_district: loc.as_ref().and_then(|l| l.district.clone()),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            s.posts.insert(id, post.clone());
            for item in new.media_items {
                let media_id = Self::next_id(&mut s);
                s.media.insert(
                    media_id,
                    Media {
                        id: media_id,
                        post_id: id,
                        media_type: item.media_type,
                        file_url: item.file_url,
                        is_external: item.is_external,
                        thumbnail_url: item.thumbnail_url,
                        file_size: item.file_size,
                        mime_type: item.mime_type,
                    },
                );
            }
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            {
                let post = s
                    .posts
                    .get_mut(&id)
                    .filter(|p| p.deleted_at.is_none())
                    .ok_or(RepoError::NotFound)?;
                if post.is_repost() {
                    // reposts only carry a comment; type/metadata are frozen
                    post.repost_comment = upd.text_content.clone();
                } else {
                    if let Some(ct) = upd.content_type {
                        post.content_type = ct;
                    }
                    post.text_content = upd.text_content.clone();
                    post.metadata = upd.metadata.clone().unwrap_or_else(|| serde_json::json!({}));
                }
                if let Some(w) = upd.whisper_mode {
                    post.whisper_mode = w;
                }
                post.updated_at = Utc::now();
            }
            if let Some(items) = upd.media_items {
                s.media.retain(|_, m| m.post_id != id);
                for item in items {
                    let media_id = Self::next_id(&mut s);
                    s.media.insert(
                        media_id,
                        Media {
                            id: media_id,
                            post_id: id,
                            media_type: item.media_type,
                            file_url: item.file_url,
                            is_external: item.is_external,
                            thumbnail_url: item.thumbnail_url,
                            file_size: item.file_size,
                            mime_type: item.mime_type,
                        },
                    );
                }
            }
            let updated = s.posts.get(&id).cloned().ok_or(RepoError::NotFound)?;
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn soft_delete_post(&self, id: Id) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            let post = s
                .posts
                .get_mut(&id)
                .filter(|p| p.deleted_at.is_none())
                .ok_or(RepoError::NotFound)?;
            post.deleted_at = Some(Utc::now());
            let deleted = post.clone();
            drop(s);
            self.persist();
            Ok(deleted)
        }

        async fn repost(&self, user_id: Id, original_post_id: Id, repost_comment: Option<String>, avatar_id: Option<Id>) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            let whisper = s
                .posts
                .get(&original_post_id)
                .filter(|p| p.deleted_at.is_none())
                .map(|p| p.whisper_mode)
                .ok_or(RepoError::NotFound)?;
            if !s.users.contains_key(&user_id) {
                return Err(RepoError::ForeignKey);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let post = Post {
                id,
                user_id,
                avatar_id,
                content_type: ContentType::Repost,
                text_content: None,
                metadata: serde_json::json!({}),
                reposted_from_id: Some(original_post_id),
                repost_comment,
                whisper_mode: whisper,
                location_latitude: None,
                location_longitude: None,
                location_accuracy: None,
                location_address: None,
                location_city: None,
                location_province: None,
                location_district: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            s.posts.insert(id, post.clone());
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn restore_post(&self, id: Id) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            let post = s
                .posts
                .get_mut(&id)
                .filter(|p| p.deleted_at.is_some())
                .ok_or(RepoError::NotFound)?;
            post.deleted_at = None;
            let restored = post.clone();
            drop(s);
            self.persist();
            Ok(restored)
        }

        async fn permanently_delete_post(&self, id: Id) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            match s.posts.get(&id) {
                Some(p) if p.deleted_at.is_some() => {}
                _ => return Err(RepoError::NotFound),
            }
            let removed = s.posts.remove(&id).ok_or(RepoError::NotFound)?;
            // cascade, mirroring the media.post_id ON DELETE CASCADE constraint
            s.media.retain(|_, m| m.post_id != id);
            drop(s);
            self.persist();
            Ok(removed)
        }
    }

    #[async_trait]
    impl MediaRepo for InMemRepo {
        async fn media_for_post(&self, post_id: Id) -> RepoResult<Vec<Media>> {
            let s = self.state.read().unwrap();
            Ok(Self::media_of(&s, post_id))
        }

        async fn get_media(&self, id: Id) -> RepoResult<Option<Media>> {
            let s = self.state.read().unwrap();
            Ok(s.media.get(&id).cloned())
        }

        async fn delete_media(&self, id: Id) -> RepoResult<Media> {
            let mut s = self.state.write().unwrap();
            let removed = s.media.remove(&id).ok_or(RepoError::NotFound)?;
            drop(s);
            self.persist();
            Ok(removed)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::postgres::PgRow;
    use sqlx::{Pool, Postgres, Row};
    use std::str::FromStr;

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    fn map_db_err(e: sqlx::Error) -> RepoError {
        match &e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("23505") => RepoError::Conflict,
                Some("23503") => RepoError::ForeignKey,
                _ => RepoError::Internal(e.to_string()),
            },
            _ => RepoError::Internal(e.to_string()),
        }
    }

    fn user_from_row(row: &PgRow) -> RepoResult<User> {
        Ok(User {
            id: row.try_get("id").map_err(|e| RepoError::Internal(e.to_string()))?,
            username: row.try_get("username").map_err(|e| RepoError::Internal(e.to_string()))?,
            email: row.try_get("email").map_err(|e| RepoError::Internal(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(|e| RepoError::Internal(e.to_string()))?,
        })
    }

    fn avatar_from_row(row: &PgRow) -> RepoResult<Avatar> {
        Ok(Avatar {
            id: row.try_get("id").map_err(|e| RepoError::Internal(e.to_string()))?,
            user_id: row.try_get("user_id").map_err(|e| RepoError::Internal(e.to_string()))?,
            avatar_url: row.try_get("avatar_url").map_err(|e| RepoError::Internal(e.to_string()))?,
            is_current: row.try_get("is_current").map_err(|e| RepoError::Internal(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(|e| RepoError::Internal(e.to_string()))?,
        })
    }

    fn media_from_row(row: &PgRow) -> RepoResult<Media> {
        let media_type: String = row.try_get("media_type").map_err(|e| RepoError::Internal(e.to_string()))?;
        Ok(Media {
            id: row.try_get("id").map_err(|e| RepoError::Internal(e.to_string()))?,
            post_id: row.try_get("post_id").map_err(|e| RepoError::Internal(e.to_string()))?,
            media_type: MediaType::from_str(&media_type).map_err(RepoError::Internal)?,
            file_url: row.try_get("file_url").map_err(|e| RepoError::Internal(e.to_string()))?,
            is_external: row.try_get("is_external").map_err(|e| RepoError::Internal(e.to_string()))?,
            thumbnail_url: row.try_get("thumbnail_url").map_err(|e| RepoError::Internal(e.to_string()))?,
            file_size: row.try_get("file_size").map_err(|e| RepoError::Internal(e.to_string()))?,
            mime_type: row.try_get("mime_type").map_err(|e| RepoError::Internal(e.to_string()))?,
        })
    }

    fn post_from_row(row: &PgRow) -> RepoResult<Post> {
        let ct: String = row.try_get("content_type").map_err(|e| RepoError::Internal(e.to_string()))?;
        Ok(Post {
            id: row.try_get("id").map_err(|e| RepoError::Internal(e.to_string()))?,
            user_id: row.try_get("user_id").map_err(|e| RepoError::Internal(e.to_string()))?,
            avatar_id: row.try_get("avatar_id").map_err(|e| RepoError::Internal(e.to_string()))?,
            content_type: ContentType::from_str(&ct).map_err(RepoError::Internal)?,
            text_content: row.try_get("text_content").map_err(|e| RepoError::Internal(e.to_string()))?,
            metadata: row.try_get("metadata").map_err(|e| RepoError::Internal(e.to_string()))?,
            reposted_from_id: row.try_get("reposted_from_id").map_err(|e| RepoError::Internal(e.to_string()))?,
            repost_comment: row.try_get("repost_comment").map_err(|e| RepoError::Internal(e.to_string()))?,
            whisper_mode: row.try_get("whisper_mode").map_err(|e| RepoError::Internal(e.to_string()))?,
            location_latitude: row.try_get("location_latitude").map_err(|e| RepoError::Internal(e.to_string()))?,
            location_longitude: row.try_get("location_longitude").map_err(|e| RepoError::Internal(e.to_string()))?,
            location_accuracy: row.try_get("location_accuracy").map_err(|e| RepoError::Internal(e.to_string()))?,
            location_address: row.try_get("location_address").map_err(|e| RepoError::Internal(e.to_string()))?,
            location_city: row.try_get("location_city").map_err(|e| RepoError::Internal(e.to_string()))?,
            location_province: row.try_get("location_province").map_err(|e| RepoError::Internal(e.to_string()))?,
            location_district: row.try_get("location_district").map_err(|e| RepoError::Internal(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(|e| RepoError::Internal(e.to_string()))?,
            updated_at: row.try_get("updated_at").map_err(|e| RepoError::Internal(e.to_string()))?,
            deleted_at: row.try_get("deleted_at").map_err(|e| RepoError::Internal(e.to_string()))?,
        })
    }

    /// A feed row carries three server-built JSON columns next to the post
    /// columns: avatar, media and (for reposts) the nested original.
    fn view_from_row(row: &PgRow) -> RepoResult<PostView> {
        let post = post_from_row(row)?;
        let avatar: Option<serde_json::Value> = row.try_get("avatar").map_err(|e| RepoError::Internal(e.to_string()))?;
        let avatar = match avatar {
            Some(v) if !v.is_null() => {
                serde_json::from_value(v).map_err(|e| RepoError::Internal(e.to_string()))?
            }
            _ => None,
        };
        let media: serde_json::Value = row.try_get("media").map_err(|e| RepoError::Internal(e.to_string()))?;
        let media = serde_json::from_value(media).map_err(|e| RepoError::Internal(e.to_string()))?;
        let reposted: Option<serde_json::Value> = row.try_get("reposted_post").map_err(|e| RepoError::Internal(e.to_string()))?;
        let reposted_post = match reposted {
            Some(v) if !v.is_null() => {
                Some(serde_json::from_value(v).map_err(|e| RepoError::Internal(e.to_string()))?)
            }
            _ => None,
        };
        Ok(PostView { post, avatar, media, reposted_post })
    }

    /// SELECT list shared by every assembled-feed query. `target_join`
    /// controls whether a soft-deleted repost target still renders (recycle
    /// bin keeps it; normal listings drop it).
    fn feed_select(target_join: &str, where_clause: &str, order: &str) -> String {
        format!(
            r#"
            SELECT
              p.id, p.user_id, p.avatar_id, p.content_type, p.text_content,
              p.metadata, p.reposted_from_id, p.repost_comment, p.whisper_mode,
              p.location_latitude, p.location_longitude, p.location_accuracy,
              p.location_address, p.location_city, p.location_province,
              p.location_district, p.created_at, p.updated_at, p.deleted_at,
              CASE WHEN a.id IS NULL THEN NULL ELSE
                json_build_object('id', a.id, 'avatar_url', a.avatar_url)
              END AS avatar,
              COALESCE(
                json_agg(
                  json_build_object(
                    'id', m.id, 'post_id', m.post_id, 'media_type', m.media_type,
                    'file_url', m.file_url, 'is_external', m.is_external,
                    'thumbnail_url', m.thumbnail_url, 'file_size', m.file_size,
                    'mime_type', m.mime_type
                  ) ORDER BY m.id
                ) FILTER (WHERE m.id IS NOT NULL),
                '[]'
              ) AS media,
              CASE WHEN op.id IS NULL THEN NULL ELSE
                json_build_object(
                  'id', op.id, 'user_id', op.user_id, 'avatar_id', op.avatar_id,
                  'content_type', op.content_type, 'text_content', op.text_content,
                  'metadata', op.metadata, 'reposted_from_id', op.reposted_from_id,
                  'repost_comment', op.repost_comment, 'created_at', op.created_at,
                  'avatar', CASE WHEN oa.id IS NULL THEN NULL ELSE
                    json_build_object('id', oa.id, 'avatar_url', oa.avatar_url)
                  END,
                  'media', COALESCE(
                    (SELECT json_agg(
                       json_build_object(
                         'id', om.id, 'post_id', om.post_id, 'media_type', om.media_type,
                         'file_url', om.file_url, 'is_external', om.is_external,
                         'thumbnail_url', om.thumbnail_url, 'file_size', om.file_size,
                         'mime_type', om.mime_type
                       ) ORDER BY om.id)
                     FROM media om WHERE om.post_id = op.id),
                    '[]'
                  )
                )
              END AS reposted_post
            FROM posts p
            LEFT JOIN avatars a ON p.avatar_id = a.id
            LEFT JOIN media m ON p.id = m.post_id
            LEFT JOIN posts op ON p.reposted_from_id = op.id{target_join}
            LEFT JOIN avatars oa ON op.avatar_id = oa.id
            {where_clause}
            GROUP BY p.id, a.id, op.id, oa.id
            {order}
            "#
        )
    }

    fn whisper_filter(view: ViewMode) -> &'static str {
        match view {
            ViewMode::Public => " AND p.whisper_mode = false",
            ViewMode::Private => " AND p.whisper_mode = true",
            ViewMode::All => "",
        }
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }

        async fn count(&self, sql: &str, binds: &[&str]) -> RepoResult<i64> {
            let mut q = sqlx::query_scalar::<_, i64>(sql);
            for b in binds {
                q = q.bind(*b);
            }
            q.fetch_one(&self.pool).await.map_err(map_db_err)
        }
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn default_user(&self) -> RepoResult<Option<User>> {
            let row = sqlx::query("SELECT * FROM users ORDER BY id LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?;
            row.as_ref().map(user_from_row).transpose()
        }

        async fn create_user(&self, username: &str, email: &str) -> RepoResult<User> {
            let row = sqlx::query("INSERT INTO users (username, email) VALUES ($1, $2) RETURNING *")
                .bind(username)
                .bind(email)
                .fetch_one(&self.pool)
                .await
                .map_err(map_db_err)?;
            user_from_row(&row)
        }

        async fn update_user(&self, id: Id, username: &str, email: &str) -> RepoResult<User> {
            let row = sqlx::query("UPDATE users SET username = $1, email = $2 WHERE id = $3 RETURNING *")
                .bind(username)
                .bind(email)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?
                .ok_or(RepoError::NotFound)?;
            user_from_row(&row)
        }
    }

    #[async_trait]
    impl AvatarRepo for PgRepo {
        async fn create_avatar(&self, user_id: Id, avatar_url: &str, is_current: bool) -> RepoResult<Avatar> {
            let mut tx = self.pool.begin().await.map_err(map_db_err)?;
            if is_current {
                sqlx::query("UPDATE avatars SET is_current = false WHERE user_id = $1")
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_db_err)?;
            }
            let row = sqlx::query(
                "INSERT INTO avatars (user_id, avatar_url, is_current) VALUES ($1, $2, $3) RETURNING *",
            )
            .bind(user_id)
            .bind(avatar_url)
            .bind(is_current)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_err)?;
            tx.commit().await.map_err(map_db_err)?;
            avatar_from_row(&row)
        }

        async fn avatars_for_user(&self, user_id: Id) -> RepoResult<Vec<Avatar>> {
            let rows = sqlx::query("SELECT * FROM avatars WHERE user_id = $1 ORDER BY created_at DESC, id DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_db_err)?;
            rows.iter().map(avatar_from_row).collect()
        }

        async fn current_avatar(&self, user_id: Id) -> RepoResult<Option<Avatar>> {
            let row = sqlx::query("SELECT * FROM avatars WHERE user_id = $1 AND is_current = true LIMIT 1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?;
            row.as_ref().map(avatar_from_row).transpose()
        }

        async fn set_current_avatar(&self, id: Id, user_id: Id) -> RepoResult<Avatar> {
            let mut tx = self.pool.begin().await.map_err(map_db_err)?;
            sqlx::query("UPDATE avatars SET is_current = false WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
            let row = sqlx::query(
                "UPDATE avatars SET is_current = true WHERE id = $1 AND user_id = $2 RETURNING *",
            )
            .bind(id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)?;
            // no row: roll back so the demote above is not kept
            let row = match row {
                Some(r) => r,
                None => {
                    tx.rollback().await.map_err(map_db_err)?;
                    return Err(RepoError::NotFound);
                }
            };
            tx.commit().await.map_err(map_db_err)?;
            avatar_from_row(&row)
        }
    }

    async fn insert_media(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        post_id: Id,
        items: &[NewMedia],
    ) -> RepoResult<()> {
        for item in items {
            sqlx::query(
                "INSERT INTO media (post_id, media_type, file_url, is_external, thumbnail_url, file_size, mime_type)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(post_id)
            .bind(item.media_type.as_str())
            .bind(&item.file_url)
            .bind(item.is_external)
            .bind(&item.thumbnail_url)
            .bind(item.file_size)
            .bind(&item.mime_type)
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)?;
        }
        Ok(())
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn list_posts(&self, page: i64, limit: i64, view: ViewMode) -> RepoResult<Page> {
            let filter = whisper_filter(view);
            let total = self
                .count(&format!("SELECT COUNT(*) FROM posts p WHERE p.deleted_at IS NULL{filter}"), &[])
                .await?;
            let sql = feed_select(
                " AND op.deleted_at IS NULL",
                &format!("WHERE p.deleted_at IS NULL{filter}"),
                "ORDER BY p.created_at DESC, p.id DESC LIMIT $1 OFFSET $2",
            );
            let rows = sqlx::query(&sql)
                .bind(limit)
                .bind((page - 1) * limit)
                .fetch_all(&self.pool)
                .await
                .map_err(map_db_err)?;
            let posts = rows.iter().map(view_from_row).collect::<RepoResult<Vec<_>>>()?;
            Ok(Page { posts, pagination: Pagination::new(total, page, limit) })
        }

        async fn search_posts(&self, keyword: &str, page: i64, limit: i64, view: ViewMode) -> RepoResult<Page> {
            let filter = whisper_filter(view);
            // the keyword is a literal substring, not an ILIKE pattern
            let escaped = keyword
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            let term = format!("%{escaped}%");
            let match_clause = "(p.text_content ILIKE $1 OR p.repost_comment ILIKE $1
                 OR op.text_content ILIKE $1 OR op.repost_comment ILIKE $1)";
            let count_sql = format!(
                "SELECT COUNT(DISTINCT p.id) FROM posts p
                 LEFT JOIN posts op ON p.reposted_from_id = op.id AND op.deleted_at IS NULL
                 WHERE p.deleted_at IS NULL{filter} AND {match_clause}"
            );
            let total = self.count(&count_sql, &[&term]).await?;
            let sql = feed_select(
                " AND op.deleted_at IS NULL",
                &format!("WHERE p.deleted_at IS NULL{filter} AND {match_clause}"),
                "ORDER BY p.created_at DESC, p.id DESC LIMIT $2 OFFSET $3",
            );
            let rows = sqlx::query(&sql)
                .bind(&term)
                .bind(limit)
                .bind((page - 1) * limit)
                .fetch_all(&self.pool)
                .await
                .map_err(map_db_err)?;
            let posts = rows.iter().map(view_from_row).collect::<RepoResult<Vec<_>>>()?;
            Ok(Page { posts, pagination: Pagination::new(total, page, limit) })
        }

        async fn deleted_posts(&self, page: i64, limit: i64) -> RepoResult<Page> {
            let total = self
                .count("SELECT COUNT(*) FROM posts WHERE deleted_at IS NOT NULL", &[])
                .await?;
            // recycle bin intentionally keeps soft-deleted repost targets
            let sql = feed_select(
                "",
                "WHERE p.deleted_at IS NOT NULL",
                "ORDER BY p.deleted_at DESC, p.id DESC LIMIT $1 OFFSET $2",
            );
            let rows = sqlx::query(&sql)
                .bind(limit)
                .bind((page - 1) * limit)
                .fetch_all(&self.pool)
                .await
                .map_err(map_db_err)?;
            let posts = rows.iter().map(view_from_row).collect::<RepoResult<Vec<_>>>()?;
            Ok(Page { posts, pagination: Pagination::new(total, page, limit) })
        }

        async fn get_post(&self, id: Id) -> RepoResult<Option<PostView>> {
            let sql = feed_select(
                " AND op.deleted_at IS NULL",
                "WHERE p.id = $1 AND p.deleted_at IS NULL",
                "",
            );
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?;
            row.as_ref().map(view_from_row).transpose()
        }

        async fn create_post(&self, new: CreatePost) -> RepoResult<Post> {
            let mut tx = self.pool.begin().await.map_err(map_db_err)?;
            let loc = new.location;
            let row = sqlx::query(
                "INSERT INTO posts (
                   user_id, avatar_id, content_type, text_content, metadata,
                   location_latitude, location_longitude, location_accuracy,
                   location_address, location_city, location_province, location_district,
                   whisper_mode
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 RETURNING *",
            )
            .bind(new.user_id)
            .bind(new.avatar_id)
            .bind(new.content_type.as_str())
            .bind(&new.text_content)
            .bind(&new.metadata)
            .bind(loc.as_ref().map(|l| l.latitude))
            .bind(loc.as_ref().map(|l| l.longitude))
            .bind(loc.as_ref().and_then(|l| l.accuracy))
            .bind(loc.as_ref().and_then(|l| l.address.clone()))
            .bind(loc.as_ref().and_then(|l| l.city.clone()))
            .bind(loc.as_ref().and_then(|l| l.province.clone()))
            .bind(loc.as_ref().and_then(|l| l.district.clone()))
            .bind(new.whisper_mode)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_err)?;
            let post = post_from_row(&row)?;
            insert_media(&mut tx, post.id, &new.media_items).await?;
            tx.commit().await.map_err(map_db_err)?;
            Ok(post)
        }

        async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
            let mut tx = self.pool.begin().await.map_err(map_db_err)?;
            let is_repost: Option<Option<Id>> = sqlx::query_scalar(
                "SELECT reposted_from_id FROM posts WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)?;
            let is_repost = is_repost.ok_or(RepoError::NotFound)?.is_some();

            let row = if is_repost {
                sqlx::query(
                    "UPDATE posts
                     SET repost_comment = $1,
                         whisper_mode = COALESCE($2, whisper_mode),
                         updated_at = CURRENT_TIMESTAMP
                     WHERE id = $3 AND deleted_at IS NULL
                     RETURNING *",
                )
                .bind(&upd.text_content)
                .bind(upd.whisper_mode)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_err)?
            } else {
                sqlx::query(
                    "UPDATE posts
                     SET content_type = COALESCE($1, content_type),
                         text_content = $2,
                         metadata = $3,
                         whisper_mode = COALESCE($4, whisper_mode),
                         updated_at = CURRENT_TIMESTAMP
                     WHERE id = $5 AND deleted_at IS NULL
                     RETURNING *",
                )
                .bind(upd.content_type.map(|c| c.as_str()))
                .bind(&upd.text_content)
                .bind(upd.metadata.clone().unwrap_or_else(|| serde_json::json!({})))
                .bind(upd.whisper_mode)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_err)?
            };
            let row = row.ok_or(RepoError::NotFound)?;

            if let Some(items) = &upd.media_items {
                sqlx::query("DELETE FROM media WHERE post_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_db_err)?;
                insert_media(&mut tx, id, items).await?;
            }
            tx.commit().await.map_err(map_db_err)?;
            post_from_row(&row)
        }

        async fn soft_delete_post(&self, id: Id) -> RepoResult<Post> {
            let row = sqlx::query(
                "UPDATE posts SET deleted_at = CURRENT_TIMESTAMP
                 WHERE id = $1 AND deleted_at IS NULL RETURNING *",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?
            .ok_or(RepoError::NotFound)?;
            post_from_row(&row)
        }

        async fn repost(&self, user_id: Id, original_post_id: Id, repost_comment: Option<String>, avatar_id: Option<Id>) -> RepoResult<Post> {
            let mut tx = self.pool.begin().await.map_err(map_db_err)?;
            // existence check and insert share the transaction so a target
            // soft-deleted in between does not slip through
            let whisper: Option<bool> = sqlx::query_scalar(
                "SELECT whisper_mode FROM posts WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(original_post_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)?;
            let whisper = whisper.ok_or(RepoError::NotFound)?;

            let row = sqlx::query(
                "INSERT INTO posts (user_id, avatar_id, content_type, text_content, metadata, reposted_from_id, repost_comment, whisper_mode)
                 VALUES ($1, $2, 'repost', NULL, '{}', $3, $4, $5)
                 RETURNING *",
            )
            .bind(user_id)
            .bind(avatar_id)
            .bind(original_post_id)
            .bind(&repost_comment)
            .bind(whisper)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_err)?;
            tx.commit().await.map_err(map_db_err)?;
            post_from_row(&row)
        }

        async fn restore_post(&self, id: Id) -> RepoResult<Post> {
            let row = sqlx::query(
                "UPDATE posts SET deleted_at = NULL
                 WHERE id = $1 AND deleted_at IS NOT NULL RETURNING *",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?
            .ok_or(RepoError::NotFound)?;
            post_from_row(&row)
        }

        async fn permanently_delete_post(&self, id: Id) -> RepoResult<Post> {
            // media rows go with the post via ON DELETE CASCADE
            let row = sqlx::query(
                "DELETE FROM posts WHERE id = $1 AND deleted_at IS NOT NULL RETURNING *",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?
            .ok_or(RepoError::NotFound)?;
            post_from_row(&row)
        }
    }

    #[async_trait]
    impl MediaRepo for PgRepo {
        async fn media_for_post(&self, post_id: Id) -> RepoResult<Vec<Media>> {
            let rows = sqlx::query("SELECT * FROM media WHERE post_id = $1 ORDER BY id")
                .bind(post_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_db_err)?;
            rows.iter().map(media_from_row).collect()
        }

        async fn get_media(&self, id: Id) -> RepoResult<Option<Media>> {
            let row = sqlx::query("SELECT * FROM media WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?;
            row.as_ref().map(media_from_row).transpose()
        }

        async fn delete_media(&self, id: Id) -> RepoResult<Media> {
            let row = sqlx::query("DELETE FROM media WHERE id = $1 RETURNING *")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?
                .ok_or(RepoError::NotFound)?;
            media_from_row(&row)
        }
    }
}
