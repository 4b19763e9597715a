//! Post model.

use crate::hashing::ImageHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric surrogate key of a post.
///
/// The ANN index addresses items by integer, so every post carries a durable
/// row id next to its externally visible [`PostId`].
pub type RowId = u64;

/// Externally visible post identifier (e.g. `"t3_abc123"` without prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    /// Creates a new post ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of submission.
///
/// Only [`PostType::Image`] posts go through near-duplicate matching; link
/// reposts are an exact URL-hash join handled by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostType {
    /// Single image post.
    #[default]
    Image,
    /// Link post.
    Link,
    /// Self/text post.
    Text,
    /// Hosted video.
    Video,
    /// Gallery of images.
    Gallery,
    /// Anything else.
    Other,
}

impl PostType {
    /// Returns the canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Link => "link",
            Self::Text => "text",
            Self::Video => "video",
            Self::Gallery => "gallery",
            Self::Other => "other",
        }
    }

    /// Parses a post type name, case-insensitively.
    ///
    /// Unknown names map to [`PostType::Other`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "image" => Self::Image,
            "link" => Self::Link,
            "text" | "self" => Self::Text,
            "video" => Self::Video,
            "gallery" => Self::Gallery,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for PostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submission as known to the post store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Numeric surrogate key used by the index.
    pub row_id: RowId,
    /// External post identifier.
    pub post_id: PostId,
    /// Author name.
    pub author: String,
    /// Creation time, Unix seconds.
    pub created_at: i64,
    /// Subreddit the post was made in.
    pub subreddit: String,
    /// Submitted URL.
    pub url: String,
    /// Kind of post.
    pub post_type: PostType,
    /// Parent post id when this post is a native crosspost.
    pub crosspost_parent: Option<String>,
    /// Stored perceptual hash, if computed.
    pub image_hash: Option<ImageHash>,
}

impl Post {
    /// Creates an image post with the required fields.
    #[must_use]
    pub fn new(
        row_id: RowId,
        post_id: impl Into<PostId>,
        author: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            row_id,
            post_id: post_id.into(),
            author: author.into(),
            created_at,
            subreddit: String::new(),
            url: String::new(),
            post_type: PostType::Image,
            crosspost_parent: None,
            image_hash: None,
        }
    }

    /// Sets the perceptual hash.
    #[must_use]
    pub fn with_hash(mut self, hash: ImageHash) -> Self {
        self.image_hash = Some(hash);
        self
    }

    /// Sets the subreddit.
    #[must_use]
    pub fn with_subreddit(mut self, subreddit: impl Into<String>) -> Self {
        self.subreddit = subreddit.into();
        self
    }

    /// Sets the URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the post type.
    #[must_use]
    pub const fn with_post_type(mut self, post_type: PostType) -> Self {
        self.post_type = post_type;
        self
    }

    /// Marks the post as a crosspost of `parent`.
    #[must_use]
    pub fn with_crosspost_parent(mut self, parent: impl Into<String>) -> Self {
        self.crosspost_parent = Some(parent.into());
        self
    }

    /// Returns true if this post is a native crosspost.
    #[must_use]
    pub const fn is_crosspost(&self) -> bool {
        self.crosspost_parent.is_some()
    }
}
