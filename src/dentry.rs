//! In-memory mirror of the monitored subtrees.
//!
//! The cache is an arena keyed by [`DKey`]: every entry holds the key of
//! its parent and a name-keyed map of child keys, so path reconstruction
//! is lazy and an ancestor rename automatically shows up in all
//! descendant paths. The cache is owned by the single processor task and
//! needs no internal locking.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use nix::unistd::Pid;

use crate::event::DKey;

/// One node of the mirror: a monitored root or anything observed below one.
#[derive(Debug)]
pub struct DEntry {
    /// Basename, or the full monitored path for a root.
    name: String,
    key: DKey,
    /// Hops from the nearest monitored root; roots are 0.
    depth: u32,
    parent: Option<DKey>,
    children: HashMap<String, DKey>,
}

impl DEntry {
    /// A root entry seeded by the traverser. `name` holds the full
    /// monitored path and `depth` is as reported by the walk.
    pub fn root(name: &str, key: DKey, depth: u32) -> Self {
        Self {
            name: name.to_owned(),
            key,
            depth,
            parent: None,
            children: HashMap::new(),
        }
    }

    /// A child entry; parent and depth are fixed on insertion.
    pub fn new(name: &str, key: DKey) -> Self {
        Self::root(name, key, 0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> DKey {
        self.key
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn parent(&self) -> Option<DKey> {
        self.parent
    }
}

/// Join a path with a basename, without touching the filesystem.
pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

#[derive(Debug)]
struct StagedMove {
    key: DKey,
    staged_at: Instant,
}

/// The `DKey` index, the parent/child graph and the per-task rename
/// staging slots.
#[derive(Debug, Default)]
pub struct DEntryCache {
    entries: HashMap<DKey, DEntry>,
    staged_moves: HashMap<i32, StagedMove>,
}

impl DEntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DKey) -> Option<&DEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a child of `parent` by basename.
    pub fn child_of(&self, parent: &DEntry, name: &str) -> Option<&DEntry> {
        parent
            .children
            .get(name)
            .and_then(|key| self.entries.get(key))
    }

    /// Install `entry`, as a root when `parent` is `None`. Re-notification
    /// of a key already in the index is a no-op.
    pub fn add(&mut self, mut entry: DEntry, parent: Option<DKey>) {
        if self.entries.contains_key(&entry.key) {
            return;
        }
        let Some(parent_key) = parent else {
            self.entries.insert(entry.key, entry);
            return;
        };
        let Some(parent_entry) = self.entries.get_mut(&parent_key) else {
            log::warn!("dropping entry {:?}: parent not in cache", entry.key);
            return;
        };
        entry.parent = Some(parent_key);
        entry.depth = parent_entry.depth + 1;
        let key = entry.key;
        let stale = parent_entry.children.insert(entry.name.clone(), key);
        self.entries.insert(key, entry);
        // a name can only address one child: an older entry squatting on
        // it was missed by a delete and gets dropped now
        if let Some(stale) = stale {
            if stale != key {
                self.evict(stale);
            }
        }
    }

    /// Detach `entry` from its parent and drop it and every descendant
    /// from the index.
    pub fn remove(&mut self, key: DKey) {
        self.detach(key);
        self.evict(key);
    }

    /// Reconstruct the absolute path of `entry` by walking parent links up
    /// to the nearest root. For a root the name already is the full path.
    pub fn path_of(&self, entry: &DEntry) -> String {
        let mut names = vec![entry.name.as_str()];
        let mut parent = entry.parent;
        while let Some(key) = parent {
            match self.entries.get(&key) {
                Some(ancestor) => {
                    names.push(ancestor.name.as_str());
                    parent = ancestor.parent;
                }
                None => break,
            }
        }
        let mut path = names.pop().unwrap_or_default().to_owned();
        while let Some(name) = names.pop() {
            path = join_path(&path, name);
        }
        path
    }

    /// Detach `entry` into the task's staging slot, where a matching
    /// `MoveTo` can pick it up. A previously staged entry for the same
    /// task is dropped.
    pub fn move_from(&mut self, tid: Pid, key: DKey) {
        self.detach(key);
        let slot = StagedMove {
            key,
            staged_at: Instant::now(),
        };
        if let Some(prev) = self.staged_moves.insert(tid.as_raw(), slot) {
            if prev.key != key {
                log::debug!("dropping staged move of task {tid}");
                self.evict(prev.key);
            }
        }
    }

    /// Complete a rename pair: reattach the task's staged entry under
    /// `new_parent` as `new_name`, fix descendant depths and return the
    /// new path. `None` when the task has nothing staged, in which case
    /// the caller falls back to walking the destination.
    pub fn move_to(&mut self, tid: Pid, new_parent: DKey, new_name: &str) -> Option<String> {
        let staged = self.staged_moves.remove(&tid.as_raw())?;
        let mut entry = self.entries.remove(&staged.key)?;
        let Some(parent_entry) = self.entries.get_mut(&new_parent) else {
            for child in entry.children.into_values() {
                self.evict(child);
            }
            return None;
        };
        let key = staged.key;
        let new_depth = parent_entry.depth + 1;
        let stale = parent_entry.children.insert(new_name.to_owned(), key);
        entry.name = new_name.to_owned();
        entry.parent = Some(new_parent);
        entry.depth = new_depth;
        let children: Vec<DKey> = entry.children.values().copied().collect();
        self.entries.insert(key, entry);
        if let Some(stale) = stale {
            if stale != key {
                self.evict(stale);
            }
        }
        self.fix_depths(&children, new_depth + 1);
        self.entries.get(&key).map(|entry| self.path_of(entry))
    }

    /// Drop the task's staged entry, if any. Called when one half of a
    /// move turns out not to belong to a monitored subtree.
    pub fn move_clear(&mut self, tid: Pid) {
        if let Some(staged) = self.staged_moves.remove(&tid.as_raw()) {
            log::debug!("clearing staged move of task {tid}");
            self.evict(staged.key);
        }
    }

    /// Drop staged entries whose `MoveTo` never arrived within `horizon`.
    pub fn expire_staged_moves(&mut self, horizon: Duration) {
        let now = Instant::now();
        let expired: Vec<i32> = self
            .staged_moves
            .iter()
            .filter(|(_, staged)| now.duration_since(staged.staged_at) >= horizon)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in expired {
            if let Some(staged) = self.staged_moves.remove(&tid) {
                log::debug!("expiring staged move of task {tid}");
                self.evict(staged.key);
            }
        }
    }

    /// Unlink `key` from its parent's child map, keeping it in the index.
    fn detach(&mut self, key: DKey) {
        let Some(entry) = self.entries.get(&key) else {
            return;
        };
        let name = entry.name.clone();
        if let Some(parent_key) = entry.parent {
            if let Some(parent) = self.entries.get_mut(&parent_key) {
                if parent.children.get(&name) == Some(&key) {
                    parent.children.remove(&name);
                }
            }
        }
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.parent = None;
        }
    }

    /// Drop `key` and every descendant from the index.
    fn evict(&mut self, key: DKey) {
        if let Some(entry) = self.entries.remove(&key) {
            for child in entry.children.into_values() {
                self.evict(child);
            }
        }
    }

    fn fix_depths(&mut self, keys: &[DKey], depth: u32) {
        for key in keys {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.depth = depth;
                let grandchildren: Vec<DKey> = entry.children.values().copied().collect();
                self.fix_depths(&grandchildren, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ino: u64) -> DKey {
        DKey {
            ino,
            dev_major: 8,
            dev_minor: 1,
        }
    }

    const TID: Pid = Pid::from_raw(7);

    fn cache_with_root() -> DEntryCache {
        let mut cache = DEntryCache::new();
        cache.add(DEntry::root("/m", key(1), 0), None);
        cache
    }

    #[test]
    fn path_reconstruction() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("sub", key(2)), Some(key(1)));
        cache.add(DEntry::new("x", key(3)), Some(key(2)));

        let entry = cache.get(&key(3)).unwrap();
        assert_eq!(entry.depth(), 2);
        assert_eq!(cache.path_of(entry), "/m/sub/x");
        assert_eq!(cache.path_of(cache.get(&key(1)).unwrap()), "/m");
    }

    #[test]
    fn add_is_idempotent() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("a", key(2)), Some(key(1)));
        cache.add(DEntry::new("renamed", key(2)), Some(key(1)));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key(2)).unwrap().name(), "a");
    }

    #[test]
    fn child_lookup() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("a", key(2)), Some(key(1)));

        let root = cache.get(&key(1)).unwrap();
        assert_eq!(cache.child_of(root, "a").unwrap().key(), key(2));
        assert!(cache.child_of(root, "b").is_none());
    }

    #[test]
    fn remove_evicts_subtree() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("sub", key(2)), Some(key(1)));
        cache.add(DEntry::new("x", key(3)), Some(key(2)));

        cache.remove(key(2));

        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(3)).is_none());
        let root = cache.get(&key(1)).unwrap();
        assert!(cache.child_of(root, "sub").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rename_within_parent() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("a", key(2)), Some(key(1)));

        cache.move_from(TID, key(2));
        // detached but still indexed, reachable through the staging slot
        assert!(cache.get(&key(2)).is_some());
        let root = cache.get(&key(1)).unwrap();
        assert!(cache.child_of(root, "a").is_none());

        let path = cache.move_to(TID, key(1), "b").unwrap();
        assert_eq!(path, "/m/b");
        let entry = cache.get(&key(2)).unwrap();
        assert_eq!(entry.name(), "b");
        assert_eq!(entry.depth(), 1);
        assert_eq!(entry.parent(), Some(key(1)));
    }

    #[test]
    fn move_fixes_descendant_depths() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("deep", key(5)), Some(key(1)));
        cache.add(DEntry::new("sub", key(2)), Some(key(5)));
        cache.add(DEntry::new("x", key(3)), Some(key(2)));
        assert_eq!(cache.get(&key(3)).unwrap().depth(), 3);

        // move "sub" from /m/deep up to /m
        cache.move_from(TID, key(2));
        let path = cache.move_to(TID, key(1), "sub").unwrap();
        assert_eq!(path, "/m/sub");
        assert_eq!(cache.get(&key(2)).unwrap().depth(), 1);
        assert_eq!(cache.get(&key(3)).unwrap().depth(), 2);
        assert_eq!(cache.path_of(cache.get(&key(3)).unwrap()), "/m/sub/x");
    }

    #[test]
    fn move_to_without_staged_entry() {
        let mut cache = cache_with_root();
        assert_eq!(cache.move_to(TID, key(1), "b"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn move_clear_drops_staged_subtree() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("sub", key(2)), Some(key(1)));
        cache.add(DEntry::new("x", key(3)), Some(key(2)));

        cache.move_from(TID, key(2));
        cache.move_clear(TID);

        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(3)).is_none());
        // clearing again is a no-op
        cache.move_clear(TID);
    }

    #[test]
    fn second_move_from_replaces_staged_entry() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("a", key(2)), Some(key(1)));
        cache.add(DEntry::new("b", key(3)), Some(key(1)));

        cache.move_from(TID, key(2));
        cache.move_from(TID, key(3));

        // the first staged entry is gone, the second pairs up
        assert!(cache.get(&key(2)).is_none());
        let path = cache.move_to(TID, key(1), "c").unwrap();
        assert_eq!(path, "/m/c");
    }

    #[test]
    fn staged_moves_expire() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("a", key(2)), Some(key(1)));
        cache.move_from(TID, key(2));

        cache.expire_staged_moves(Duration::from_secs(60));
        assert!(cache.get(&key(2)).is_some());

        cache.expire_staged_moves(Duration::ZERO);
        assert!(cache.get(&key(2)).is_none());
        assert_eq!(cache.move_to(TID, key(1), "b"), None);
    }

    #[test]
    fn name_collision_replaces_stale_child() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("a", key(2)), Some(key(1)));
        // a delete we never saw: a new object shows up under the same name
        cache.add(DEntry::new("a", key(9)), Some(key(1)));

        assert!(cache.get(&key(2)).is_none());
        let root = cache.get(&key(1)).unwrap();
        assert_eq!(cache.child_of(root, "a").unwrap().key(), key(9));
    }

    #[test]
    fn ancestor_rename_shows_in_descendant_paths() {
        let mut cache = cache_with_root();
        cache.add(DEntry::new("sub", key(2)), Some(key(1)));
        cache.add(DEntry::new("x", key(3)), Some(key(2)));

        cache.move_from(TID, key(2));
        cache.move_to(TID, key(1), "renamed").unwrap();

        assert_eq!(cache.path_of(cache.get(&key(3)).unwrap()), "/m/renamed/x");
    }
}
