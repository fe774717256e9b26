//! Directory listing cache.
//!
//! One instance lives inside each pool entry and is only touched under
//! that entry's lock. Entries hold the raw LIST text, so the parser can
//! run again with whatever dialect is known at read time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedListing {
    text: String,
    read_at: Instant,
}

#[derive(Debug)]
pub struct DirListingCache {
    ttl: Duration,
    entries: HashMap<String, CachedListing>,
}

impl DirListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, path: &str) -> Option<String> {
        self.get_at(path, Instant::now())
    }

    /// Cached text for `path` if it is younger than the TTL at `now`.
    /// Expired entries are dropped on the way.
    pub fn get_at(&mut self, path: &str, now: Instant) -> Option<String> {
        let fresh = match self.entries.get(path) {
            Some(entry) => now.saturating_duration_since(entry.read_at) < self.ttl,
            None => return None,
        };
        if fresh {
            self.entries.get(path).map(|e| e.text.clone())
        } else {
            self.entries.remove(path);
            None
        }
    }

    pub fn put(&mut self, path: &str, text: String) {
        self.put_at(path, text, Instant::now());
    }

    pub fn put_at(&mut self, path: &str, text: String, now: Instant) {
        self.entries.insert(
            path.to_string(),
            CachedListing {
                text,
                read_at: now,
            },
        );
    }

    pub fn invalidate(&mut self, path: &str) {
        if self.entries.remove(path).is_some() {
            log::trace!("dircache: dropped {}", path);
        }
    }

    /// Drop the listing of the directory that contains `path`.
    pub fn invalidate_parent(&mut self, path: &str) {
        self.invalidate(&parent_of(path));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parent_of(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => trimmed[..pos].to_string(),
    }
}
