use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use sb_core::{parse_json, BridgeError, HostValue};
use tracing::{info, trace, warn};

/// Optional on-disk copy of a cached result, reused across processes while
/// the file is younger than `minutes`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskShadow {
    pub dir: PathBuf,
    pub minutes: u64,
}

impl DiskShadow {
    pub fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", qualified_name(key)))
    }
}

/// Suite-wide memo of `callSingle` results.
///
/// Reads never take the cache-wide lock. A miss serializes on one mutex so
/// the computation for a key runs at most once; the lock is re-entrant so a
/// computation may itself call other units once. A failed computation leaves
/// nothing behind and the next caller retries.
#[derive(Debug)]
pub struct CallOnceCache {
    entries: DashMap<String, HostValue>,
    lock: ReentrantMutex<()>,
}

impl Default for CallOnceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CallOnceCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            lock: ReentrantMutex::new(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> Result<HostValue, BridgeError>
    where
        F: FnOnce() -> Result<HostValue, BridgeError>,
    {
        self.get_or_compute_persisted(key, None, compute)
    }

    pub fn get_or_compute_persisted<F>(
        &self,
        key: &str,
        shadow: Option<&DiskShadow>,
        compute: F,
    ) -> Result<HostValue, BridgeError>
    where
        F: FnOnce() -> Result<HostValue, BridgeError>,
    {
        if let Some(value) = self.get(key) {
            trace!(target: "sb::call_once", "callSingle cache hit: {}", key);
            return Ok(value);
        }
        let started = Instant::now();
        trace!(target: "sb::call_once", "callSingle waiting for lock: {}", key);
        let _guard = self.lock.lock();
        if let Some(value) = self.get(key) {
            warn!(
                target: "sb::call_once",
                "this thread waited {} milliseconds for callSingle lock: {}",
                started.elapsed().as_millis(),
                key
            );
            return Ok(value);
        }
        info!(target: "sb::call_once", ">> lock acquired, begin callSingle: {}", key);
        let shadow = shadow.filter(|shadow| shadow.minutes > 0);
        let cached = match shadow {
            Some(shadow) => read_shadow(&shadow.file_for(key), shadow.minutes),
            None => None,
        };
        let value = match cached {
            Some(value) => value,
            None => {
                let value = compute()?;
                if let Some(shadow) = shadow {
                    write_shadow(&shadow.file_for(key), &value);
                }
                value
            }
        };
        self.entries.insert(key.to_string(), value.clone());
        info!(target: "sb::call_once", "<< lock released, cached callSingle: {}", key);
        Ok(value)
    }
}

/// `classpath:auth/token.feature` becomes `auth.token.feature`.
pub fn qualified_name(path: &str) -> String {
    let stripped = path
        .strip_prefix("classpath:")
        .unwrap_or(path)
        .trim_start_matches("./")
        .trim_start_matches(['/', '\\']);
    stripped
        .chars()
        .map(|ch| match ch {
            '/' | '\\' => '.',
            ':' => '_',
            other => other,
        })
        .collect()
}

fn read_shadow(file: &Path, minutes: u64) -> Option<HostValue> {
    let modified = match std::fs::metadata(file).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(_) => {
            info!(
                target: "sb::call_once",
                "callSingleCache file does not exist, will create: {}",
                file.display()
            );
            return None;
        }
    };
    let since = SystemTime::now()
        .checked_sub(Duration::from_secs(minutes.saturating_mul(60)))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    if modified <= since {
        info!(
            target: "sb::call_once",
            "callSingleCache stale, last modified {:?} - is before {:?} (minutes: {})",
            modified,
            since,
            minutes
        );
        return None;
    }
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(error) => {
            warn!(target: "sb::call_once", "callSingleCache read failed: {}: {}", file.display(), error);
            return None;
        }
    };
    match parse_json(&text) {
        Ok(value) => {
            info!(target: "sb::call_once", "callSingleCache hit: {}", file.display());
            Some(value)
        }
        Err(error) => {
            warn!(target: "sb::call_once", "callSingleCache unreadable: {}: {}", file.display(), error);
            None
        }
    }
}

fn write_shadow(file: &Path, value: &HostValue) {
    if !value.is_map_or_list() {
        warn!(
            target: "sb::call_once",
            "callSingleCache write failed, not json-like: {}",
            value.to_display_text()
        );
        return;
    }
    let written = file
        .parent()
        .map(std::fs::create_dir_all)
        .unwrap_or(Ok(()))
        .and_then(|_| std::fs::write(file, value.to_json().to_string()));
    match written {
        Ok(()) => info!(target: "sb::call_once", "callSingleCache write: {}", file.display()),
        Err(error) => warn!(
            target: "sb::call_once",
            "callSingleCache write failed: {}: {}",
            file.display(),
            error
        ),
    }
}
