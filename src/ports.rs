//! Port allocation for per-database proxies.
//!
//! The allocator hands out ports from a bounded, configured range and keeps a
//! persistent `name -> port` map (`servers.json`) so a database gets the same
//! port back across restarts. The map is flushed to disk only when it changed
//! and reloaded when edited externally; an in-memory inverse map keeps the
//! two directions consistent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Inclusive bounds of the allocator pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }
}

/// The persistent name/port mapping with its in-memory inverse.
///
/// Invariant: the two directions are bijective on their common domain; for
/// any `(name, port)` in the forward map there is exactly one `(port, name)`
/// entry in the inverse.
pub struct PortMap {
    path: PathBuf,
    forward: BTreeMap<String, u16>,
    inverse: BTreeMap<u16, String>,
    /// Last port handed out by the forward scan; u32 so `max + 1` cannot wrap.
    port_last: u32,
    /// The forward map has changes not yet flushed to disk.
    dirty: bool,
    /// The next observed file change was caused by our own `persist`.
    ignore_next_reload: bool,
}

impl PortMap {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            forward: BTreeMap::new(),
            inverse: BTreeMap::new(),
            port_last: 0,
            dirty: false,
            ignore_next_reload: false,
        }
    }

    /// Ensure the port-map file exists (creating an empty one if not) and
    /// load it. Read or parse failures are logged by the caller; the
    /// in-memory state stays authoritative.
    pub fn init(&mut self) -> Result<()> {
        if !self.path.exists() {
            std::fs::write(&self.path, b"{}")
                .with_context(|| format!("failed to create {}", self.path.display()))?;
        }
        self.load_from_file()
    }

    /// Reload the forward map from disk and rebuild the inverse.
    ///
    /// External edits may remove or remap entries; the new state is honored
    /// on subsequent `assign` calls, running proxies are not migrated.
    pub fn load_from_file(&mut self) -> Result<()> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read port map {}", self.path.display()))?;
        let parsed: BTreeMap<String, u16> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse port map {}", self.path.display()))?;

        self.forward.clear();
        self.inverse.clear();
        for (name, port) in parsed {
            // Duplicate ports in an edited file: last entry wins, earlier
            // names are dropped to keep the maps bijective.
            if let Some(previous) = self.inverse.insert(port, name.clone()) {
                self.forward.remove(&previous);
            }
            self.forward.insert(name, port);
        }
        debug!(path = %self.path.display(), entries = self.forward.len(), "port map loaded");
        Ok(())
    }

    /// Flush the forward map to disk if it changed since the last flush.
    /// The write is flagged so the file watcher does not reload it.
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let json = serde_json::to_string_pretty(&self.forward)
            .context("failed to serialize the port map")?;

        // Mark as an internal update before the bytes hit the disk.
        self.ignore_next_reload = true;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write port map {}", self.path.display()))?;

        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.forward.len(), "port map persisted");
        Ok(())
    }

    /// Consume the self-write flag. The watcher calls this on every observed
    /// change and skips the reload when it returns true.
    pub fn take_ignore_flag(&mut self) -> bool {
        std::mem::take(&mut self.ignore_next_reload)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, name: &str) -> Option<u16> {
        self.forward.get(name).copied()
    }

    pub fn forward(&self) -> &BTreeMap<String, u16> {
        &self.forward
    }

    pub fn inverse(&self) -> &BTreeMap<u16, String> {
        &self.inverse
    }

    /// Assign a port to `name`, or 0 when the range is exhausted.
    ///
    /// Precedence: sticky reuse of the persisted port, then a forward scan
    /// continuing past the last handed-out port, then a wrap-around recycle
    /// of the first free port in the range. `active` is the set of ports
    /// currently held by running servers and is never reassigned.
    pub fn assign(
        &mut self,
        name: &str,
        range: PortRange,
        active: &BTreeMap<u16, String>,
    ) -> u16 {
        // Sticky reuse: the previously persisted port, provided it is still
        // in bounds, not held by an active server and free to bind.
        if let Some(port) = self.lookup(name) {
            if range.contains(port) && !active.contains_key(&port) && port_is_free(port) {
                return port;
            }
            self.evict_name(name);
        }

        // The configuration may have changed since the last assignment;
        // restart the scan just below the highest mapped in-range port.
        if self.port_last < range.min as u32 || self.port_last > range.max as u32 {
            self.port_last = self
                .forward
                .values()
                .copied()
                .filter(|p| *p <= range.max)
                .max()
                .map(u32::from)
                .unwrap_or(0)
                .max(range.min as u32 - 1);
        }

        // Room left in the range?
        while self.port_last < range.max as u32 {
            self.port_last += 1;
            let port = self.port_last as u16;
            if port_is_free(port) {
                self.bind(name, port);
                return port;
            }
        }

        // Must recycle the first port in the range that is unused and free.
        for port in range.min..=range.max {
            if !active.contains_key(&port) && port_is_free(port) {
                self.bind(name, port);
                return port;
            }
        }

        // No unused ports left in the range.
        0
    }

    /// Record `name -> port`, evicting whatever stale mapping existed on
    /// either side so the two directions stay bijective.
    fn bind(&mut self, name: &str, port: u16) {
        if let Some(previous) = self.inverse.insert(port, name.to_string()) {
            if previous != name {
                self.forward.remove(&previous);
            }
        }
        if let Some(previous) = self.forward.insert(name.to_string(), port) {
            if previous != port {
                self.inverse.remove(&previous);
            }
        }
        self.dirty = true;
    }

    fn evict_name(&mut self, name: &str) {
        if let Some(port) = self.forward.remove(name) {
            if self.inverse.get(&port).map(String::as_str) == Some(name) {
                self.inverse.remove(&port);
            }
            self.dirty = true;
        }
    }

    #[cfg(test)]
    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Probe whether the OS would let us bind the port, by binding it and
/// releasing it immediately. The window between probe and the proxy's own
/// bind is inherent; a losing race is logged at proxy start and retried on
/// the next reconcile.
fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Snapshot of a file's identity for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    pub fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Observe the port-map file and report whether it changed since the last
/// poll. Used by the fleet's watcher task.
pub struct PortMapWatch {
    path: PathBuf,
    last: Option<FileStamp>,
}

impl PortMapWatch {
    pub fn new(path: PathBuf) -> Self {
        let last = FileStamp::of(&path);
        Self { path, last }
    }

    pub fn changed(&mut self) -> bool {
        let current = FileStamp::of(&self.path);
        if current == self.last {
            return false;
        }
        if current.is_none() {
            // Deleted or unreadable; treat as unchanged and warn once it
            // reappears with different contents.
            warn!(path = %self.path.display(), "port map file is not readable");
        }
        self.last = current;
        current.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;
    use std::net::TcpListener;

    fn temp_map(tag: &str) -> PortMap {
        let path = temp_dir().join(format!(
            "admsrv-ports-{tag}-{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        PortMap::new(path)
    }

    fn assert_bijective(map: &PortMap) {
        assert_eq!(map.forward().len(), map.inverse().len());
        for (name, port) in map.forward() {
            assert_eq!(map.inverse().get(port), Some(name));
        }
    }

    #[test]
    fn assigns_sequentially_from_range_min() {
        let mut map = temp_map("seq");
        let range = PortRange { min: 42611, max: 42615 };
        let active = BTreeMap::new();

        assert_eq!(map.assign("D1", range, &active), 42611);
        assert_eq!(map.assign("D2", range, &active), 42612);
        assert_eq!(map.assign("D3", range, &active), 42613);
        assert_bijective(&map);
    }

    #[test]
    fn assign_is_sticky_without_eviction() {
        let mut map = temp_map("sticky");
        let range = PortRange { min: 42621, max: 42625 };
        let active = BTreeMap::new();

        let first = map.assign("D1", range, &active);
        assert_eq!(map.assign("D1", range, &active), first);
        assert_eq!(map.assign("D1", range, &active), first);
        assert_bijective(&map);
    }

    #[test]
    fn sticky_reuse_survives_removal() {
        let mut map = temp_map("reuse");
        let range = PortRange { min: 42631, max: 42635 };
        let mut active = BTreeMap::new();

        let port = map.assign("D1", range, &active);
        active.insert(port, "D1".to_string());

        // The database disappears; the mapping stays for later reuse.
        active.clear();
        assert_eq!(map.assign("D1", range, &active), port);
    }

    #[test]
    fn busy_persisted_port_is_evicted() {
        let mut map = temp_map("busy");
        let range = PortRange { min: 42641, max: 42645 };
        let active = BTreeMap::new();

        let first = map.assign("D1", range, &active);
        assert_eq!(first, 42641);

        // Occupy the persisted port; the sticky path must evict and move on.
        let _holder = TcpListener::bind(("0.0.0.0", first)).unwrap();
        let second = map.assign("D1", range, &active);
        assert_eq!(second, 42642);
        assert_eq!(map.lookup("D1"), Some(second));
        assert_bijective(&map);
    }

    #[test]
    fn out_of_range_mapping_is_evicted_on_assign() {
        let mut map = temp_map("shrink");
        map.bind("D1", 42690);
        map.bind("D2", 42691);

        // The configured range no longer covers the persisted ports.
        let range = PortRange { min: 42651, max: 42655 };
        let active = BTreeMap::new();
        let port = map.assign("D1", range, &active);

        assert!(range.contains(port));
        assert_eq!(map.lookup("D1"), Some(port));
        assert!(!map.inverse().contains_key(&42690));
        assert_bijective(&map);
    }

    #[test]
    fn exhausted_range_returns_zero() {
        let mut map = temp_map("full");
        let range = PortRange { min: 42661, max: 42662 };
        let mut active = BTreeMap::new();

        let p1 = map.assign("D1", range, &active);
        active.insert(p1, "D1".to_string());
        let p2 = map.assign("D2", range, &active);
        active.insert(p2, "D2".to_string());
        assert_eq!(
            [p1, p2],
            [42661, 42662],
            "both pool ports should be handed out first"
        );

        assert_eq!(map.assign("D3", range, &active), 0);
    }

    #[test]
    fn wrap_around_recycles_released_port() {
        let mut map = temp_map("wrap");
        let range = PortRange { min: 42671, max: 42672 };
        let mut active = BTreeMap::new();

        let p1 = map.assign("D1", range, &active);
        active.insert(p1, "D1".to_string());
        let p2 = map.assign("D2", range, &active);
        active.insert(p2, "D2".to_string());

        // D1 goes away; a third database takes over its port and the stale
        // mapping is dropped.
        active.remove(&p1);
        let p3 = map.assign("D3", range, &active);
        assert_eq!(p3, p1);
        assert_eq!(map.lookup("D1"), None);
        assert_eq!(map.lookup("D3"), Some(p3));
        assert_bijective(&map);
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let mut map = temp_map("roundtrip");
        map.init().unwrap();
        let range = PortRange { min: 42681, max: 42685 };
        let active = BTreeMap::new();

        map.assign("D1", range, &active);
        map.assign("D2", range, &active);
        let before = map.forward().clone();

        map.persist().unwrap();
        assert!(!map.is_dirty());
        assert!(map.take_ignore_flag(), "persist must flag its own write");

        let mut reloaded = PortMap::new(map.path().to_path_buf());
        reloaded.load_from_file().unwrap();
        assert_eq!(reloaded.forward(), &before);
        assert_bijective(&reloaded);

        let _ = std::fs::remove_file(map.path());
    }

    #[test]
    fn persist_skips_clean_map() {
        let mut map = temp_map("clean");
        map.init().unwrap();
        map.persist().unwrap();
        assert!(!map.take_ignore_flag(), "a clean map must not write");
        let _ = std::fs::remove_file(map.path());
    }

    #[test]
    fn external_reload_drops_duplicate_ports() {
        let mut map = temp_map("dupes");
        std::fs::write(map.path(), r#"{"A": 42699, "B": 42699}"#).unwrap();
        map.load_from_file().unwrap();
        assert_eq!(map.forward().len(), 1);
        assert_bijective(&map);
        let _ = std::fs::remove_file(map.path());
    }

    #[test]
    fn external_reload_redirects_assignment() {
        let mut map = temp_map("external");
        map.init().unwrap();
        let range = PortRange { min: 42601, max: 42605 };
        let active = BTreeMap::new();

        map.assign("D1", range, &active);
        std::fs::write(map.path(), r#"{"D1": 42604}"#).unwrap();
        map.load_from_file().unwrap();

        assert_eq!(map.assign("D1", range, &active), 42604);
        let _ = std::fs::remove_file(map.path());
    }

    #[test]
    fn watch_detects_external_write() {
        let mut map = temp_map("watch");
        map.init().unwrap();
        let mut watch = PortMapWatch::new(map.path().to_path_buf());
        assert!(!watch.changed());

        std::fs::write(map.path(), r#"{"D1": 42607}"#).unwrap();
        assert!(watch.changed());
        assert!(!watch.changed());
        let _ = std::fs::remove_file(map.path());
    }
}
