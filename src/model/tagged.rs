//! Collections of user-owned, optionally tagged entities.
//!
//! Containers and volumes are both identified by uuid and advertised to
//! other sessions by an optional (user, tag) pair; a tag must be unique
//! among the live entities of one user.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// An entity addressable by uuid and optionally by (user, tag).
pub trait Tagged {
    fn user(&self) -> &[u8];
    fn uuid(&self) -> &[u8];
    fn tag(&self) -> Option<&[u8]>;

    /// Display form used in logs and the inspection endpoint:
    /// `user64:tag` when tagged, `user64:(uuid)` otherwise.
    fn display_name(&self) -> String {
        let user = BASE64.encode(self.user());
        match self.tag() {
            Some(tag) => format!("{}:{}", user, String::from_utf8_lossy(tag)),
            None => format!("{}:({})", user, String::from_utf8_lossy(self.uuid())),
        }
    }
}

/// Uuid-keyed store enforcing per-user tag uniqueness.
#[derive(Debug)]
pub struct TaggedStore<T: Tagged> {
    items: HashMap<Vec<u8>, T>,
}

impl<T: Tagged> Default for TaggedStore<T> {
    fn default() -> Self {
        Self { items: HashMap::new() }
    }
}

impl<T: Tagged> TaggedStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: T) {
        self.items.insert(item.uuid().to_vec(), item);
    }

    pub fn remove(&mut self, uuid: &[u8]) -> Option<T> {
        self.items.remove(uuid)
    }

    pub fn get(&self, uuid: &[u8]) -> Option<&T> {
        self.items.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &[u8]) -> Option<&mut T> {
        self.items.get_mut(uuid)
    }

    pub fn contains(&self, uuid: &[u8]) -> bool {
        self.items.contains_key(uuid)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Would `(user, tag)` collide with a different live uuid?
    ///
    /// Untagged entities never clash.
    pub fn will_clash(&self, user: &[u8], uuid: &[u8], tag: Option<&[u8]>) -> bool {
        let Some(tag) = tag else { return false };
        self.items.values().any(|item| {
            item.user() == user && item.tag() == Some(tag) && item.uuid() != uuid
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        user: Vec<u8>,
        uuid: Vec<u8>,
        tag: Option<Vec<u8>>,
    }

    impl Tagged for Item {
        fn user(&self) -> &[u8] {
            &self.user
        }
        fn uuid(&self) -> &[u8] {
            &self.uuid
        }
        fn tag(&self) -> Option<&[u8]> {
            self.tag.as_deref()
        }
    }

    fn item(user: &[u8], uuid: &[u8], tag: Option<&[u8]>) -> Item {
        Item {
            user: user.to_vec(),
            uuid: uuid.to_vec(),
            tag: tag.map(<[u8]>::to_vec),
        }
    }

    #[test]
    fn test_tag_clash_same_user_only() {
        let mut store = TaggedStore::new();
        store.insert(item(b"alice", b"u1", Some(b"web")));

        // same user, same tag, different uuid
        assert!(store.will_clash(b"alice", b"u2", Some(b"web")));
        // same uuid is re-registration, not a clash
        assert!(!store.will_clash(b"alice", b"u1", Some(b"web")));
        // different user may reuse the tag
        assert!(!store.will_clash(b"bob", b"u3", Some(b"web")));
        // untagged never clashes
        assert!(!store.will_clash(b"alice", b"u4", None));
    }

    #[test]
    fn test_remove_frees_tag() {
        let mut store = TaggedStore::new();
        store.insert(item(b"alice", b"u1", Some(b"web")));
        store.remove(b"u1");
        assert!(!store.will_clash(b"alice", b"u2", Some(b"web")));
    }
}
