//! On-disk cluster state
//!
//! Holds the cluster key and the last known peer set so a restarted node can
//! rejoin without seed addresses. The file is replaced atomically: written to
//! a uniquely named temporary sibling, synced, then renamed over the target.
//! Saves through one store and its clones are serialized.

use crate::error::{OverlayError, Result};
use crate::peer::Peer;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Length of a cluster key in bytes
pub const CLUSTER_KEY_LEN: usize = 32;

/// Default cluster name, used as the state file stem
pub const DEFAULT_CLUSTER_NAME: &str = "state";

/// Persisted cluster state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Shared secret gating the membership transport
    #[serde(with = "base64_bytes", default)]
    pub cluster_key: Vec<u8>,

    /// Peers from the most recent snapshot
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl ClusterState {
    /// Settle on a cluster key
    ///
    /// A configured key wins over a stored one. With neither, a fresh random
    /// key is generated. Returns `true` when a key was generated.
    pub fn ensure_cluster_key(&mut self, configured: Option<Vec<u8>>) -> Result<bool> {
        if let Some(key) = configured {
            check_key_len(&key)?;
            self.cluster_key = key;
            return Ok(false);
        }
        if !self.cluster_key.is_empty() {
            check_key_len(&self.cluster_key)?;
            return Ok(false);
        }
        let mut key = vec![0u8; CLUSTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        self.cluster_key = key;
        Ok(true)
    }

    /// Transport addresses of the remembered peers, for rejoining
    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers
            .iter()
            .map(|p| p.transport_addr.to_string())
            .collect()
    }
}

fn check_key_len(key: &[u8]) -> Result<()> {
    if key.len() != CLUSTER_KEY_LEN {
        return Err(OverlayError::InvalidKey(format!(
            "cluster key must be {CLUSTER_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(())
}

/// Reads and writes `<state_dir>/<cluster>.json`
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(state_dir: impl AsRef<Path>, cluster_name: &str) -> Self {
        Self {
            path: state_dir.as_ref().join(format!("{cluster_name}.json")),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored state
    ///
    /// A missing file yields the default state. An unreadable or corrupt
    /// file is logged and also yields the default.
    pub async fn load(&self) -> ClusterState {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No stored cluster state");
                return ClusterState::default();
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to read cluster state, starting fresh"
                );
                return ClusterState::default();
            }
        };

        let mut state: ClusterState = match serde_json::from_slice(&contents) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Corrupt cluster state, starting fresh"
                );
                return ClusterState::default();
            }
        };
        for peer in &mut state.peers {
            peer.decode_meta();
        }
        debug!(path = %self.path.display(), peers = state.peers.len(), "Loaded cluster state");
        state
    }

    /// Atomically replace the stored state
    pub async fn save(&self, state: &ClusterState) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| OverlayError::Config(format!("{} has no parent", self.path.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        let contents = serde_json::to_vec_pretty(state)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(
            ".{file_name}.{}.{:016x}.tmp",
            std::process::id(),
            OsRng.next_u64()
        ));

        let _guard = self.write_lock.lock().await;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let write = async {
            let mut file = options.open(&tmp).await?;
            file.write_all(&contents).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %self.path.display(), peers = state.peers.len(), "Saved cluster state");
        Ok(())
    }
}

/// Serde adapter storing byte vectors as standard base64 strings
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::peer::PeerMeta;

    fn peer(name: &str, addr: &str) -> Peer {
        let meta = codec::encode(
            &PeerMeta {
                overlay_addr: "10.0.0.1".parse().unwrap(),
                public_key: "pk".to_string(),
                routes: vec!["192.168.0.0/24".parse().unwrap()],
            },
            512,
        )
        .unwrap();
        Peer::new(name, addr.parse().unwrap(), meta)
    }

    #[tokio::test]
    async fn test_load_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "state");
        assert_eq!(store.load().await, ClusterState::default());
    }

    #[tokio::test]
    async fn test_save_creates_directory_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/deeper"), "prod");
        let state = ClusterState {
            cluster_key: vec![7u8; CLUSTER_KEY_LEN],
            peers: vec![peer("a", "192.168.1.10"), peer("b", "fd00::2")],
        };

        store.save(&state).await.unwrap();
        assert!(store.path().ends_with("nested/deeper/prod.json"));
        assert_eq!(store.load().await, state);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_save_uses_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "state");
        store.save(&ClusterState::default()).await.unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_save_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "state");
        store.save(&ClusterState::default()).await.unwrap();
        let state = ClusterState {
            cluster_key: vec![1u8; CLUSTER_KEY_LEN],
            peers: vec![peer("a", "192.168.1.10")],
        };
        store.save(&state).await.unwrap();

        assert_eq!(store.load().await, state);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "state");
        let large = ClusterState {
            cluster_key: vec![7u8; CLUSTER_KEY_LEN],
            peers: (0..40)
                .map(|i| peer(&format!("node-{i}"), &format!("192.168.1.{i}")))
                .collect(),
        };
        let small = ClusterState {
            cluster_key: vec![7u8; CLUSTER_KEY_LEN],
            peers: Vec::new(),
        };

        for _ in 0..50 {
            let (a, b) = (store.clone(), store.clone());
            let (large_state, small_state) = (large.clone(), small.clone());
            let first = tokio::spawn(async move { a.save(&large_state).await });
            let second = tokio::spawn(async move { b.save(&small_state).await });
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();

            let stored = store.load().await;
            assert!(stored == large || stored == small, "stored state was mangled");
        }
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_load_corrupt_or_truncated_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "state");
        std::fs::write(store.path(), b"{\"cluster_key\": \"AAAA").unwrap();
        assert_eq!(store.load().await, ClusterState::default());

        std::fs::write(store.path(), b"[1, 2, 3]").unwrap();
        assert_eq!(store.load().await, ClusterState::default());
    }

    #[test]
    fn test_ensure_cluster_key_precedence() {
        let mut state = ClusterState::default();
        assert!(state.ensure_cluster_key(None).unwrap());
        assert_eq!(state.cluster_key.len(), CLUSTER_KEY_LEN);

        let stored = state.cluster_key.clone();
        assert!(!state.ensure_cluster_key(None).unwrap());
        assert_eq!(state.cluster_key, stored);

        let configured = vec![9u8; CLUSTER_KEY_LEN];
        assert!(!state.ensure_cluster_key(Some(configured.clone())).unwrap());
        assert_eq!(state.cluster_key, configured);
    }

    #[test]
    fn test_ensure_cluster_key_rejects_bad_length() {
        let mut state = ClusterState::default();
        assert!(matches!(
            state.ensure_cluster_key(Some(vec![1, 2, 3])),
            Err(OverlayError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_peer_addrs() {
        let state = ClusterState {
            cluster_key: vec![],
            peers: vec![peer("a", "192.168.1.10"), peer("b", "fd00::2")],
        };
        assert_eq!(state.peer_addrs(), vec!["192.168.1.10", "fd00::2"]);
    }
}
