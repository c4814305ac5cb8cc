//! In-memory ownership of live posts
//!
//! Each post sits behind its own async mutex. That mutex is the per-post
//! critical section: release, cancellation and every attempt transition
//! take it, so status recomputation is serialized per post while posts
//! never contend with each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::types::Post;

pub type PostHandle = Arc<Mutex<Post>>;

#[derive(Default, Clone)]
pub struct PostRegistry {
    posts: Arc<RwLock<HashMap<String, PostHandle>>>,
}

impl PostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a post, returning its handle
    pub async fn insert(&self, post: Post) -> PostHandle {
        let id = post.id.clone();
        let handle = Arc::new(Mutex::new(post));
        self.posts.write().await.insert(id, handle.clone());
        handle
    }

    pub async fn get(&self, post_id: &str) -> Option<PostHandle> {
        self.posts.read().await.get(post_id).cloned()
    }

    /// Drop a post that reached a terminal status; later reads go to storage
    pub async fn evict(&self, post_id: &str) -> Option<PostHandle> {
        self.posts.write().await.remove(post_id)
    }

    pub async fn len(&self) -> usize {
        self.posts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.posts.read().await.is_empty()
    }
}
