use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::{Cache, Entry};
use crate::config::{DEFAULT_CACHE_HYSTERESIS_FACTOR, DEFAULT_CACHE_MAX_SIZE_BYTES};
use crate::util::lock_unpoisoned;

/// Identifies a cache file written by this layout.
const CACHE_MAGIC: u32 = 0x2015_0306;

/// Upper bound on any length prefix read back from disk; anything larger is
/// treated as corruption rather than attempted as an allocation.
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

/// File-per-entry disk cache with an in-memory index of entry headers.
///
/// File layout: magic u32, length-prefixed UTF-8 strings for key and etag,
/// little-endian u64s for server date, last-modified, ttl, and soft ttl,
/// a length-prefixed header map, then the raw body. All multi-byte fields
/// are little-endian; string and map lengths are u32. A file that fails any
/// part of this layout is deleted and skipped.
///
/// A crash between header and body write leaves a short file; the size
/// check against the index drops it on the next read, and the magic check
/// drops it on the next startup scan.
pub struct DiskCache {
    root: PathBuf,
    max_size: usize,
    hysteresis: f32,
    state: Mutex<DiskState>,
}

#[derive(Default)]
struct DiskState {
    entries: HashMap<String, IndexedHeader>,
    total_size: u64,
    tick: u64,
}

struct IndexedHeader {
    size: u64,
    /// Monotonic access stamp; smallest stamp is the LRU eviction victim.
    stamp: u64,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_limits(
            root,
            DEFAULT_CACHE_MAX_SIZE_BYTES,
            DEFAULT_CACHE_HYSTERESIS_FACTOR,
        )
    }

    pub fn with_limits(root: impl Into<PathBuf>, max_size: usize, hysteresis: f32) -> Self {
        Self {
            root: root.into(),
            max_size,
            hysteresis: hysteresis.clamp(0.0, 1.0),
            state: Mutex::new(DiskState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes currently accounted to the cache (headers + bodies).
    pub fn total_size(&self) -> u64 {
        lock_unpoisoned(&self.state).total_size
    }

    fn file_for_key(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(digest.len() * 2);
        for byte in digest {
            name.push_str(&format!("{byte:02x}"));
        }
        self.root.join(name)
    }

    fn delete_file(&self, path: &Path) {
        if let Err(error) = fs::remove_file(path) {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), %error, "failed to delete cache file");
            }
        }
    }

    /// Evicts least-recently-used entries until `incoming` more bytes fit
    /// within the hysteresis target. Caller holds the state lock.
    fn prune_if_needed(&self, state: &mut DiskState, incoming: u64) {
        if state.total_size + incoming <= self.max_size as u64 {
            return;
        }
        let target = (self.max_size as f32 * self.hysteresis) as u64;
        let mut pruned = 0usize;
        while state.total_size + incoming > target {
            let Some(victim) = state
                .entries
                .iter()
                .min_by_key(|(_, header)| header.stamp)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            if let Some(evicted) = state.entries.remove(&victim) {
                state.total_size -= evicted.size;
                self.delete_file(&self.file_for_key(&victim));
                pruned += 1;
            }
        }
        debug!(pruned, total_size = state.total_size, "cache pruned");
    }
}

impl Cache for DiskCache {
    fn initialize(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.entries.clear();
        state.total_size = 0;

        if !self.root.exists() {
            if let Err(error) = fs::create_dir_all(&self.root) {
                warn!(root = %self.root.display(), %error, "unable to create cache directory");
            }
            return;
        }
        let listing = match fs::read_dir(&self.root) {
            Ok(listing) => listing,
            Err(error) => {
                warn!(root = %self.root.display(), %error, "unable to scan cache directory");
                return;
            }
        };
        for dir_entry in listing.flatten() {
            let path = dir_entry.path();
            let parsed = File::open(&path).and_then(|mut file| {
                let header = EntryHeader::read(&mut file)?;
                let size = file.metadata()?.len();
                Ok((header, size))
            });
            match parsed {
                Ok((header, size)) => {
                    state.tick += 1;
                    state.total_size += size;
                    let stamp = state.tick;
                    state.entries.insert(
                        header.key,
                        IndexedHeader { size, stamp },
                    );
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "dropping unreadable cache file");
                    self.delete_file(&path);
                }
            }
        }
        debug!(
            entries = state.entries.len(),
            total_size = state.total_size,
            "cache index initialized"
        );
    }

    fn get(&self, key: &str) -> Option<Entry> {
        let mut state = lock_unpoisoned(&self.state);
        let indexed_size = state.entries.get(key)?.size;
        let path = self.file_for_key(key);

        let read = File::open(&path).and_then(|mut file| {
            let header = EntryHeader::read(&mut file)?;
            if header.key != key {
                return Err(corrupt(format!("key mismatch: {}", header.key)));
            }
            if file.metadata()?.len() != indexed_size {
                return Err(corrupt("size changed since indexing"));
            }
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            Ok(header.into_entry(Bytes::from(data)))
        });
        match read {
            Ok(entry) => {
                state.tick += 1;
                let stamp = state.tick;
                if let Some(indexed) = state.entries.get_mut(key) {
                    indexed.stamp = stamp;
                }
                Some(entry)
            }
            Err(error) => {
                warn!(key, %error, "dropping invalid cache file");
                if let Some(evicted) = state.entries.remove(key) {
                    state.total_size -= evicted.size;
                }
                self.delete_file(&path);
                None
            }
        }
    }

    fn put(&self, key: &str, entry: Entry) {
        let header = EntryHeader::from_entry(key, &entry);
        let mut serialized = Vec::new();
        if header.write(&mut serialized).is_err() {
            return;
        }
        let size = (serialized.len() + entry.data.len()) as u64;

        let mut state = lock_unpoisoned(&self.state);
        self.prune_if_needed(&mut state, size);

        if !self.root.exists() {
            if let Err(error) = fs::create_dir_all(&self.root) {
                warn!(root = %self.root.display(), %error, "unable to create cache directory");
                return;
            }
        }
        let path = self.file_for_key(key);
        let written = File::create(&path).and_then(|mut file| {
            file.write_all(&serialized)?;
            file.write_all(&entry.data)
        });
        if let Err(error) = written {
            warn!(key, %error, "cache write failed");
            self.delete_file(&path);
            return;
        }

        if let Some(previous) = state.entries.remove(key) {
            state.total_size -= previous.size;
        }
        state.tick += 1;
        state.total_size += size;
        let stamp = state.tick;
        state.entries.insert(
            key.to_owned(),
            IndexedHeader { size, stamp },
        );
    }

    fn invalidate(&self, key: &str, full_expire: bool) {
        let Some(mut entry) = self.get(key) else {
            return;
        };
        entry.soft_ttl = 0;
        if full_expire {
            entry.ttl = 0;
        }
        self.put(key, entry);
    }

    fn remove(&self, key: &str) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(removed) = state.entries.remove(key) {
            state.total_size -= removed.size;
        }
        self.delete_file(&self.file_for_key(key));
    }

    fn clear(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if let Ok(listing) = fs::read_dir(&self.root) {
            for dir_entry in listing.flatten() {
                self.delete_file(&dir_entry.path());
            }
        }
        state.entries.clear();
        state.total_size = 0;
        debug!("cache cleared");
    }
}

/// Everything about an entry except its body, in on-disk order.
#[derive(Debug)]
pub(crate) struct EntryHeader {
    pub(crate) key: String,
    pub(crate) etag: Option<String>,
    pub(crate) server_date: u64,
    pub(crate) last_modified: u64,
    pub(crate) ttl: u64,
    pub(crate) soft_ttl: u64,
    pub(crate) response_headers: HeaderMap,
}

impl EntryHeader {
    pub(crate) fn from_entry(key: &str, entry: &Entry) -> Self {
        Self {
            key: key.to_owned(),
            etag: entry.etag.clone(),
            server_date: entry.server_date,
            last_modified: entry.last_modified,
            ttl: entry.ttl,
            soft_ttl: entry.soft_ttl,
            response_headers: entry.response_headers.clone(),
        }
    }

    pub(crate) fn into_entry(self, data: Bytes) -> Entry {
        Entry {
            data,
            etag: self.etag,
            server_date: self.server_date,
            last_modified: self.last_modified,
            ttl: self.ttl,
            soft_ttl: self.soft_ttl,
            response_headers: self.response_headers,
        }
    }

    pub(crate) fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_u32(writer, CACHE_MAGIC)?;
        write_string(writer, &self.key)?;
        write_string(writer, self.etag.as_deref().unwrap_or(""))?;
        write_u64(writer, self.server_date)?;
        write_u64(writer, self.last_modified)?;
        write_u64(writer, self.ttl)?;
        write_u64(writer, self.soft_ttl)?;
        write_u32(writer, self.response_headers.len() as u32)?;
        for (name, value) in &self.response_headers {
            write_string(writer, name.as_str())?;
            write_string(writer, value.to_str().unwrap_or(""))?;
        }
        Ok(())
    }

    pub(crate) fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let magic = read_u32(reader)?;
        if magic != CACHE_MAGIC {
            return Err(corrupt(format!("bad magic {magic:#x}")));
        }
        let key = read_string(reader)?;
        let etag = match read_string(reader)? {
            etag if etag.is_empty() => None,
            etag => Some(etag),
        };
        let server_date = read_u64(reader)?;
        let last_modified = read_u64(reader)?;
        let ttl = read_u64(reader)?;
        let soft_ttl = read_u64(reader)?;
        let header_count = read_u32(reader)?;
        if header_count > MAX_FIELD_LEN {
            return Err(corrupt(format!("implausible header count {header_count}")));
        }
        let mut response_headers = HeaderMap::new();
        for _ in 0..header_count {
            let name = read_string(reader)?;
            let value = read_string(reader)?;
            let name = HeaderName::try_from(name.as_str()).map_err(|_| corrupt("header name"))?;
            let value = HeaderValue::try_from(value.as_str()).map_err(|_| corrupt("header value"))?;
            response_headers.append(name, value);
        }
        Ok(Self {
            key,
            etag,
            server_date,
            last_modified,
            ttl,
            soft_ttl,
            response_headers,
        })
    }
}

fn corrupt(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_u32(writer, value.len() as u32)?;
    writer.write_all(value.as_bytes())
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut raw = [0u8; 8];
    reader.read_exact(&mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = read_u32(reader)?;
    if len > MAX_FIELD_LEN {
        return Err(corrupt(format!("implausible string length {len}")));
    }
    let mut raw = vec![0u8; len as usize];
    reader.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|_| corrupt("non-utf8 string field"))
}
