//! Maps a token-sequence key to a serialized backend state, with
//! longest-common-prefix lookup. Two implementations share the
//! same trait: an in-RAM LRU bounded by byte capacity, and a disk-backed
//! store (one file per key hash) that survives process restart.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

pub struct CacheHit {
    pub prefix_len: usize,
    pub state: Vec<u8>,
}

/// Length of the common prefix shared by two token sequences.
pub fn common_prefix_len(a: &[i32], b: &[i32]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

pub trait PrefixCache: Send + Sync {
    /// Find the cached entry whose key shares the longest common prefix
    /// with `tokens`. Cache misses are not errors: callers
    /// should treat `None` as "nothing to warm from".
    fn get_longest_prefix(&self, tokens: &[i32]) -> Option<CacheHit>;

    fn put(&self, tokens: &[i32], state: Vec<u8>);
}

struct RamEntry {
    key: Vec<i32>,
    state: Vec<u8>,
}

struct RamInner {
    entries: VecDeque<RamEntry>,
    total_bytes: u64,
    capacity_bytes: u64,
}

/// Byte-capacity-bounded in-memory prefix cache. Eviction is LRU: `get`
/// moves a hit to the back of the deque, `put` evicts from the front
/// until the new entry fits.
pub struct RamPrefixCache {
    inner: Mutex<RamInner>,
}

impl RamPrefixCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(RamInner {
                entries: VecDeque::new(),
                total_bytes: 0,
                capacity_bytes,
            }),
        }
    }
}

impl PrefixCache for RamPrefixCache {
    fn get_longest_prefix(&self, tokens: &[i32]) -> Option<CacheHit> {
        let mut inner = self.inner.lock().unwrap();
        let mut best_idx = None;
        let mut best_len = 0;
        for (idx, entry) in inner.entries.iter().enumerate() {
            let len = common_prefix_len(tokens, &entry.key);
            if len > best_len {
                best_len = len;
                best_idx = Some(idx);
            }
        }

        let idx = best_idx?;
        if best_len == 0 {
            return None;
        }
        let entry = inner.entries.remove(idx).unwrap();
        let hit = CacheHit {
            prefix_len: best_len,
            state: entry.state.clone(),
        };
        inner.entries.push_back(entry);
        Some(hit)
    }

    fn put(&self, tokens: &[i32], state: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let new_bytes = state.len() as u64;

        inner.entries.retain(|e| e.key != tokens);
        while inner.total_bytes + new_bytes > inner.capacity_bytes {
            match inner.entries.pop_front() {
                Some(evicted) => inner.total_bytes -= evicted.state.len() as u64,
                None => break,
            }
        }

        inner.total_bytes += new_bytes;
        inner.entries.push_back(RamEntry {
            key: tokens.to_vec(),
            state,
        });
    }
}

struct DiskIndexEntry {
    key: Vec<i32>,
    hash: String,
}

struct DiskInner {
    index: Vec<DiskIndexEntry>,
    total_bytes: u64,
}

/// Disk-backed prefix cache. Each entry is stored as `<hash>.state` under
/// `dir`, where `hash` is the hex SHA-256 of the token sequence. An
/// in-memory index (rebuilt by scanning `<hash>.key` sidecar files on
/// construction) is kept so prefix lookups don't need to re-read every
/// state file from disk.
pub struct DiskPrefixCache {
    dir: PathBuf,
    capacity_bytes: u64,
    inner: Mutex<DiskInner>,
}

fn hash_tokens(tokens: &[i32]) -> String {
    let mut hasher = Sha256::new();
    for t in tokens {
        hasher.update(t.to_le_bytes());
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn key_to_text(tokens: &[i32]) -> String {
    tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn text_to_key(text: &str) -> Vec<i32> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split(',').filter_map(|s| s.parse().ok()).collect()
}

impl DiskPrefixCache {
    pub fn open(dir: PathBuf, capacity_bytes: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut index = Vec::new();
        let mut total_bytes = 0u64;

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "key").unwrap_or(false) {
                let hash = path.file_stem().unwrap().to_string_lossy().into_owned();
                let key_text = std::fs::read_to_string(&path)?;
                let state_path = dir.join(format!("{hash}.state"));
                if let Ok(meta) = std::fs::metadata(&state_path) {
                    total_bytes += meta.len();
                    index.push(DiskIndexEntry {
                        key: text_to_key(key_text.trim()),
                        hash,
                    });
                }
            }
        }

        Ok(Self {
            dir,
            capacity_bytes,
            inner: Mutex::new(DiskInner { index, total_bytes }),
        })
    }

    fn state_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.state"))
    }

    fn key_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.key"))
    }

    fn evict(&self, inner: &mut DiskInner) {
        while inner.total_bytes > self.capacity_bytes && !inner.index.is_empty() {
            let evicted = inner.index.remove(0);
            if let Ok(meta) = std::fs::metadata(self.state_path(&evicted.hash)) {
                inner.total_bytes = inner.total_bytes.saturating_sub(meta.len());
            }
            let _ = std::fs::remove_file(self.state_path(&evicted.hash));
            let _ = std::fs::remove_file(self.key_path(&evicted.hash));
        }
    }
}

impl PrefixCache for DiskPrefixCache {
    fn get_longest_prefix(&self, tokens: &[i32]) -> Option<CacheHit> {
        let inner = self.inner.lock().unwrap();
        let mut best: Option<(&DiskIndexEntry, usize)> = None;
        for entry in &inner.index {
            let len = common_prefix_len(tokens, &entry.key);
            if len > 0 && best.as_ref().map(|(_, best_len)| len > *best_len).unwrap_or(true) {
                best = Some((entry, len));
            }
        }
        let (entry, prefix_len) = best?;
        let state = std::fs::read(self.state_path(&entry.hash)).ok()?;
        Some(CacheHit { prefix_len, state })
    }

    fn put(&self, tokens: &[i32], state: Vec<u8>) {
        let hash = hash_tokens(tokens);
        let mut inner = self.inner.lock().unwrap();

        if std::fs::write(self.key_path(&hash), key_to_text(tokens)).is_err() {
            return;
        }
        let new_bytes = state.len() as u64;
        if std::fs::write(self.state_path(&hash), &state).is_err() {
            return;
        }

        inner.index.retain(|e| e.hash != hash);
        inner.index.push(DiskIndexEntry {
            key: tokens.to_vec(),
            hash,
        });
        inner.total_bytes += new_bytes;
        self.evict(&mut inner);
    }
}

pub fn validate_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_cache_returns_longest_prefix() {
        let cache = RamPrefixCache::new(1024);
        cache.put(&[1, 2, 3], vec![1]);
        cache.put(&[1, 2, 3, 4, 5], vec![2]);

        let hit = cache.get_longest_prefix(&[1, 2, 3, 4, 9]).unwrap();
        assert_eq!(hit.prefix_len, 4);
        assert_eq!(hit.state, vec![2]);
    }

    #[test]
    fn ram_cache_evicts_oldest_when_over_capacity() {
        let cache = RamPrefixCache::new(2);
        cache.put(&[1], vec![1]);
        cache.put(&[2], vec![1]);
        cache.put(&[3], vec![1]); // should evict key [1]

        assert!(cache.get_longest_prefix(&[1]).is_none());
        assert!(cache.get_longest_prefix(&[3]).is_some());
    }

    #[test]
    fn disk_cache_round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskPrefixCache::open(dir.path().to_path_buf(), 1024 * 1024).unwrap();
            cache.put(&[10, 20, 30], vec![9, 9, 9]);
        }
        let reopened = DiskPrefixCache::open(dir.path().to_path_buf(), 1024 * 1024).unwrap();
        let hit = reopened.get_longest_prefix(&[10, 20, 30, 40]).unwrap();
        assert_eq!(hit.prefix_len, 3);
        assert_eq!(hit.state, vec![9, 9, 9]);
    }

    #[test]
    fn cache_miss_is_none_not_a_panic() {
        let cache = RamPrefixCache::new(1024);
        assert!(cache.get_longest_prefix(&[1, 2, 3]).is_none());
    }
}
