//! Persistent state: identity, auth token, root set, cached network
//! configs and peer hints.
//!
//! Two backends share one trait: files under the caller's home directory,
//! or memory only (state is then lost on shutdown, which some embedders
//! want). Every successful write through the file backend reports the
//! matching store event so applications can mirror state elsewhere.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use zerolink_core::{Event, Result};
use zerolink_node::StateObject;

/// Reported alongside writes so the service can publish store events.
pub type StoreEventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Pluggable persistence for the node and service.
pub trait Storage: Send + Sync {
    /// Write an object; empty data deletes it.
    fn put(&self, object: StateObject, data: &[u8]);
    /// Read an object.
    fn get(&self, object: StateObject) -> Option<Vec<u8>>;
    /// Network IDs with cached configs (for re-join on start).
    fn cached_networks(&self) -> Vec<zerolink_core::NetworkId>;
    /// Retire the current identity after an address collision. The old
    /// secret is renamed, never deleted.
    fn retire_identity(&self);
    /// Delete peer hints older than the cutoff (milliseconds of age).
    fn cleanup_peers(&self, max_age_ms: i64);
    /// The local API auth token, created on first use where supported.
    fn auth_token(&self) -> Option<String>;
}

/// File-backed storage rooted at a home directory.
pub struct FileStorage {
    home: PathBuf,
    events: Option<StoreEventSink>,
}

impl FileStorage {
    pub fn open(home: impl Into<PathBuf>, events: Option<StoreEventSink>) -> Result<Self> {
        let home = home.into();
        fs::create_dir_all(&home)?;
        fs::create_dir_all(home.join("networks.d"))?;
        fs::create_dir_all(home.join("peers.d"))?;
        Ok(Self { home, events })
    }

    fn path_for(&self, object: StateObject) -> PathBuf {
        match object {
            StateObject::IdentityPublic => self.home.join("identity.public"),
            StateObject::IdentitySecret => self.home.join("identity.secret"),
            StateObject::Planet => self.home.join("planet"),
            StateObject::NetworkConfig(nwid) => {
                self.home.join("networks.d").join(format!("{nwid}.conf"))
            }
            StateObject::Peer(addr) => self.home.join("peers.d").join(format!("{addr}.peer")),
        }
    }

    fn event_for(object: StateObject) -> Event {
        match object {
            StateObject::IdentityPublic => Event::StoreIdentityPublic,
            StateObject::IdentitySecret => Event::StoreIdentitySecret,
            StateObject::Planet => Event::StorePlanet,
            StateObject::NetworkConfig(_) => Event::StoreNetwork,
            StateObject::Peer(_) => Event::StorePeer,
        }
    }

    fn secure(object: StateObject) -> bool {
        matches!(
            object,
            StateObject::IdentitySecret | StateObject::NetworkConfig(_)
        )
    }
}

#[cfg(unix)]
fn lock_down(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn lock_down(_path: &Path) {}

impl Storage for FileStorage {
    fn put(&self, object: StateObject, data: &[u8]) {
        let path = self.path_for(object);
        if data.is_empty() {
            let _ = fs::remove_file(&path);
            return;
        }
        // Skip rewrites of identical content; these are frequent for
        // planet and network objects
        if let Ok(existing) = fs::read(&path) {
            if existing == data {
                return;
            }
        }
        match fs::write(&path, data) {
            Ok(()) => {
                if Self::secure(object) {
                    lock_down(&path);
                }
                if let Some(events) = &self.events {
                    events(Self::event_for(object));
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "state write failed"),
        }
    }

    fn get(&self, object: StateObject) -> Option<Vec<u8>> {
        fs::read(self.path_for(object)).ok()
    }

    fn cached_networks(&self) -> Vec<zerolink_core::NetworkId> {
        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir(self.home.join("networks.d")) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(hexid) = name.strip_suffix(".conf") {
                if hexid.len() == 16 {
                    if let Ok(nwid) = hexid.parse() {
                        out.push(nwid);
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    fn retire_identity(&self) {
        let secret = self.home.join("identity.secret");
        let saved = self.home.join("identity.secret.saved_after_collision");
        if secret.exists() {
            if let Err(e) = fs::rename(&secret, &saved) {
                warn!(error = %e, "could not save collided identity");
            }
        }
        let _ = fs::remove_file(self.home.join("identity.public"));
        debug!("identity retired after collision");
    }

    fn cleanup_peers(&self, max_age_ms: i64) {
        let Ok(entries) = fs::read_dir(self.home.join("peers.d")) else {
            return;
        };
        let now = std::time::SystemTime::now();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let age_ms = now
                .duration_since(modified)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            if age_ms > max_age_ms {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    fn auth_token(&self) -> Option<String> {
        let path = self.home.join("authtoken.secret");
        if let Ok(token) = fs::read_to_string(&path) {
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Some(token);
            }
        }
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        match fs::write(&path, &token) {
            Ok(()) => {
                lock_down(&path);
                Some(token)
            }
            Err(e) => {
                warn!(error = %e, "could not write auth token");
                None
            }
        }
    }
}

/// In-memory storage; nothing survives the process.
#[derive(Default)]
pub struct MemStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(object: StateObject) -> String {
        match object {
            StateObject::IdentityPublic => "identity.public".into(),
            StateObject::IdentitySecret => "identity.secret".into(),
            StateObject::Planet => "planet".into(),
            StateObject::NetworkConfig(nwid) => format!("network/{nwid}"),
            StateObject::Peer(addr) => format!("peer/{addr}"),
        }
    }
}

impl Storage for MemStorage {
    fn put(&self, object: StateObject, data: &[u8]) {
        let key = Self::key(object);
        if data.is_empty() {
            self.objects.lock().remove(&key);
        } else {
            self.objects.lock().insert(key, data.to_vec());
        }
    }

    fn get(&self, object: StateObject) -> Option<Vec<u8>> {
        self.objects.lock().get(&Self::key(object)).cloned()
    }

    fn cached_networks(&self) -> Vec<zerolink_core::NetworkId> {
        let objects = self.objects.lock();
        let mut out: Vec<zerolink_core::NetworkId> = objects
            .keys()
            .filter_map(|k| k.strip_prefix("network/"))
            .filter_map(|hexid| hexid.parse().ok())
            .collect();
        out.sort_unstable();
        out
    }

    fn retire_identity(&self) {
        let mut objects = self.objects.lock();
        if let Some(secret) = objects.remove("identity.secret") {
            objects.insert("identity.secret.saved_after_collision".into(), secret);
        }
        objects.remove("identity.public");
    }

    fn cleanup_peers(&self, _max_age_ms: i64) {}

    fn auth_token(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use zerolink_core::{NetworkId, NodeId};

    #[test]
    fn file_round_trip_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let storage = FileStorage::open(
            dir.path(),
            Some(Arc::new(move |e| sink.lock().push(e))),
        )
        .unwrap();

        storage.put(StateObject::IdentitySecret, b"secret-blob");
        assert_eq!(storage.get(StateObject::IdentitySecret).unwrap(), b"secret-blob");
        // Identical rewrite publishes nothing
        storage.put(StateObject::IdentitySecret, b"secret-blob");
        assert_eq!(seen.lock().as_slice(), &[Event::StoreIdentitySecret]);

        let nwid: NetworkId = "8056c2e21c000001".parse().unwrap();
        storage.put(StateObject::NetworkConfig(nwid), b"cfg");
        assert_eq!(storage.cached_networks(), vec![nwid]);
        // Deletion via empty write
        storage.put(StateObject::NetworkConfig(nwid), b"");
        assert!(storage.cached_networks().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn secret_files_are_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path(), None).unwrap();
        storage.put(StateObject::IdentitySecret, b"s");
        let mode = std::fs::metadata(dir.path().join("identity.secret"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let token = storage.auth_token().unwrap();
        assert_eq!(token.len(), 24);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        // Stable across reads
        assert_eq!(storage.auth_token().unwrap(), token);
        let mode = std::fs::metadata(dir.path().join("authtoken.secret"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn collision_renames_not_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path(), None).unwrap();
        storage.put(StateObject::IdentitySecret, b"old-secret");
        storage.put(StateObject::IdentityPublic, b"old-public");
        storage.retire_identity();
        assert!(storage.get(StateObject::IdentitySecret).is_none());
        assert!(storage.get(StateObject::IdentityPublic).is_none());
        let saved = std::fs::read(dir.path().join("identity.secret.saved_after_collision")).unwrap();
        assert_eq!(saved, b"old-secret");
    }

    #[test]
    fn peer_cleanup_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path(), None).unwrap();
        let peer = NodeId::new(0x1234567890);
        storage.put(StateObject::Peer(peer), b"hint");
        // Nothing is older than a day
        storage.cleanup_peers(24 * 3600 * 1000);
        assert!(storage.get(StateObject::Peer(peer)).is_some());
        // Everything is older than "no age at all"
        storage.cleanup_peers(-1);
        assert!(storage.get(StateObject::Peer(peer)).is_none());
    }

    #[test]
    fn memory_backend_round_trip() {
        let storage = MemStorage::new();
        storage.put(StateObject::Planet, b"roots");
        assert_eq!(storage.get(StateObject::Planet).unwrap(), b"roots");
        storage.put(StateObject::Planet, b"");
        assert!(storage.get(StateObject::Planet).is_none());
        assert!(storage.auth_token().is_none());

        storage.put(StateObject::IdentitySecret, b"sec");
        storage.retire_identity();
        assert!(storage.get(StateObject::IdentitySecret).is_none());
    }
}
