//! On-disk trust store for minion identities.
//!
//! Layout under the store root:
//!
//! ```text
//! master.pem / master.pub          master RSA pair
//! minions/<name>/minion            identity record, JSON
//! minions/<name>/minion.pub        minion public key, PEM
//! minions/<name>/state             canonical state string
//! minions_pre/<name>      -> minions/<name>     (unaccepted)
//! minions_accept/<name>   -> minions/<name>
//! minions_autosign/<name> -> minions/<name>
//! minions_denied/<name>   -> minions/<name>
//! minions_rejected/<name> -> minions/<name>
//! ```
//!
//! For each known minion exactly one symlink exists across the five
//! buckets and matches the `state` file. The `state` file is
//! authoritative: a transition writes the new symlink first, then removes
//! the stale one (logging, not surfacing, removal failures), then
//! rewrites `state` — so a crash between steps is healed by the next
//! restart, which rebuilds the in-memory sets from the buckets.
//!
//! Files are written 0600 and directories 0700.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{symlink, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use drover_core::crypto::RsaPair;
use drover_core::{Error, Minion, MinionKey, MinionState, Result};

const MINIONS_DIR: &str = "minions";

/// Bucket directory for a trust state.
const fn bucket(state: MinionState) -> &'static str {
    match state {
        MinionState::Unaccepted => "minions_pre",
        MinionState::Accepted => "minions_accept",
        MinionState::AutoSign => "minions_autosign",
        MinionState::Denied => "minions_denied",
        MinionState::Rejected => "minions_rejected",
    }
}

/// A trust-state change published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Minion name.
    pub name: String,
    /// New state (the prior state for deletions).
    pub state: MinionState,
    /// True when the record was removed entirely.
    pub deleted: bool,
}

/// Handle returned by [`Keystore::subscribe`], used to unsubscribe.
pub type SubscriberId = u64;

/// Durable registry of minion identities and their trust state.
pub struct Keystore {
    root: PathBuf,
    keys: RsaPair,
    cache: RwLock<HashMap<MinionState, HashSet<String>>>,
    next_sub: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<StoreEvent>>>,
}

impl Keystore {
    /// Opens (or initializes) a store rooted at `root`.
    ///
    /// Loads or generates the master RSA pair, ensures the six
    /// directories exist, and rebuilds the per-state sets by listing each
    /// bucket.
    ///
    /// # Errors
    ///
    /// Returns `internal` on filesystem or key failures.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700))?;

        let keys = RsaPair::load_or_generate(&root, "master")?;

        fs::create_dir_all(root.join(MINIONS_DIR))?;
        for state in MinionState::ALL {
            fs::create_dir_all(root.join(bucket(state)))?;
        }

        let mut cache = HashMap::new();
        for state in MinionState::ALL {
            let mut names = HashSet::new();
            for entry in fs::read_dir(root.join(bucket(state)))? {
                names.insert(entry?.file_name().to_string_lossy().into_owned());
            }
            cache.insert(state, names);
        }

        info!(root = %root.display(), "trust store opened");
        Ok(Self {
            root,
            keys,
            cache: RwLock::new(cache),
            next_sub: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// The master RSA pair.
    #[must_use]
    pub const fn master_keys(&self) -> &RsaPair {
        &self.keys
    }

    /// Registers a subscriber for state-change events.
    #[must_use]
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (id, rx)
    }

    /// Drops a subscriber; its receiver sees the channel close.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn publish(&self, event: StoreEvent) {
        // Collect senders under the lock, send after dropping it so a
        // slow subscriber can never stall a transition.
        let senders: Vec<_> = {
            let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subs.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        let mut dead = Vec::new();
        for (id, tx) in senders {
            if tx.send(event.clone()).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Names currently in `state`.
    #[must_use]
    pub fn list(&self, state: MinionState) -> Vec<String> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = cache
            .get(&state)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Every known name, across all states.
    #[must_use]
    pub fn list_all(&self) -> Vec<String> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = cache.values().flatten().cloned().collect();
        names.sort();
        names
    }

    /// Reads the full key record for `name` from disk.
    ///
    /// # Errors
    ///
    /// Returns `not-found` when the minion is unknown.
    pub fn get(&self, name: &str) -> Result<MinionKey> {
        let minion = self.read_minion(name)?;
        let public_key = fs::read_to_string(self.minion_dir(name).join("minion.pub"))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::not_found(format!("minion {name}")),
                _ => e.into(),
            })?;
        let state = self.state_of(name)?;
        Ok(MinionKey {
            minion,
            public_key,
            state,
        })
    }

    /// Reads the identity record for `name` from disk.
    ///
    /// # Errors
    ///
    /// Returns `not-found` when the minion is unknown.
    pub fn read_minion(&self, name: &str) -> Result<Minion> {
        let path = self.minion_dir(name).join("minion");
        let data = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("minion {name}")),
            _ => e.into(),
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    // ------------------------------------------------------------------
    // First contact
    // ------------------------------------------------------------------

    /// Creates the record for `minion` if missing and always refreshes
    /// its identity JSON. Returns the current trust state.
    ///
    /// New records start in `AutoSign` when `auto_sign` is set, else
    /// `Denied` when `auto_denied` is set, else `Unaccepted`. The master
    /// issues a `uid` when the minion presents none; an existing record's
    /// `uid` and `registry_timestamp` always win over the presented ones.
    ///
    /// # Errors
    ///
    /// Returns `internal` on filesystem failures.
    pub fn upsert(
        &self,
        minion: &mut Minion,
        public_key_pem: &str,
        auto_sign: bool,
        auto_denied: bool,
    ) -> Result<MinionState> {
        let name = minion.name.clone();
        let now = Utc::now().timestamp();

        let state = match self.state_of(&name) {
            Ok(state) => {
                // Known minion: canonical uid/registry time come from disk.
                if let Ok(stored) = self.read_minion(&name) {
                    minion.uid = stored.uid;
                    minion.registry_timestamp = stored.registry_timestamp;
                }
                // Key may have rotated with the record intact.
                write_file(&self.minion_dir(&name).join("minion.pub"), public_key_pem.as_bytes())?;
                state
            }
            Err(ref e) if e.is_not_found() => {
                let state = if auto_sign {
                    MinionState::AutoSign
                } else if auto_denied {
                    MinionState::Denied
                } else {
                    MinionState::Unaccepted
                };

                if minion.uid.is_empty() {
                    minion.uid = uuid::Uuid::new_v4().to_string();
                }
                minion.registry_timestamp = now;

                let dir = self.minion_dir(&name);
                fs::create_dir_all(&dir)?;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
                write_file(&dir.join("minion.pub"), public_key_pem.as_bytes())?;
                self.write_state(&name, state)?;
                self.link(&name, state)?;

                {
                    let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
                    cache.entry(state).or_default().insert(name.clone());
                }
                info!(minion = %name, state = %state, "registered minion");
                state
            }
            Err(e) => return Err(e),
        };

        minion.online_timestamp = now;
        self.update(minion)?;
        Ok(state)
    }

    /// Rewrites the identity JSON for an existing or new record.
    ///
    /// # Errors
    ///
    /// Returns `internal` on filesystem failures.
    pub fn update(&self, minion: &Minion) -> Result<()> {
        let dir = self.minion_dir(&minion.name);
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_vec_pretty(minion)?;
        write_file(&dir.join("minion"), &data)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Moves `name` into `Accepted`.
    ///
    /// Sources: `Unaccepted` always, `Rejected` when `include_rejected`,
    /// `Denied` when `include_denied`.
    ///
    /// # Errors
    ///
    /// Returns `not-found` when `name` is in none of the source states.
    pub fn accept(&self, name: &str, include_rejected: bool, include_denied: bool) -> Result<()> {
        let mut sources = vec![MinionState::Unaccepted];
        if include_rejected {
            sources.push(MinionState::Rejected);
        }
        if include_denied {
            sources.push(MinionState::Denied);
        }
        self.transition(name, &sources, MinionState::Accepted)
    }

    /// Moves `name` into `Rejected`.
    ///
    /// Sources: `Unaccepted` always, `Accepted`/`AutoSign` when
    /// `include_accepted`, `Denied` when `include_denied`.
    ///
    /// # Errors
    ///
    /// Returns `not-found` when `name` is in none of the source states.
    pub fn reject(&self, name: &str, include_accepted: bool, include_denied: bool) -> Result<()> {
        let mut sources = vec![MinionState::Unaccepted];
        if include_accepted {
            sources.push(MinionState::Accepted);
            sources.push(MinionState::AutoSign);
        }
        if include_denied {
            sources.push(MinionState::Denied);
        }
        self.transition(name, &sources, MinionState::Rejected)
    }

    fn transition(&self, name: &str, sources: &[MinionState], to: MinionState) -> Result<()> {
        let from = {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            let Some(from) = sources
                .iter()
                .copied()
                .find(|s| cache.get(s).is_some_and(|set| set.contains(name)))
            else {
                return Err(Error::not_found(format!("minion {name}")));
            };
            if let Some(set) = cache.get_mut(&from) {
                set.remove(name);
            }
            cache.entry(to).or_default().insert(name.to_string());
            from
        };

        // New symlink first; the stale one is best-effort cleanup and the
        // state file settles which bucket is authoritative.
        self.link(name, to)?;
        self.unlink(name, from);
        self.write_state(name, to)?;

        debug!(minion = %name, from = %from, to = %to, "trust transition");
        self.publish(StoreEvent {
            name: name.to_string(),
            state: to,
            deleted: false,
        });
        Ok(())
    }

    /// Deletes `name` entirely: bucket symlink, record directory, and
    /// in-memory entry.
    ///
    /// # Errors
    ///
    /// Returns `not-found` when the minion is unknown.
    pub fn delete(&self, name: &str) -> Result<()> {
        let state = self.state_of(name)?;

        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            if let Some(set) = cache.get_mut(&state) {
                set.remove(name);
            }
        }

        self.unlink(name, state);
        if let Err(e) = fs::remove_dir_all(self.minion_dir(name)) {
            warn!(minion = %name, error = %e, "remove minion directory");
        }

        info!(minion = %name, "deleted minion");
        self.publish(StoreEvent {
            name: name.to_string(),
            state,
            deleted: true,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disk primitives
    // ------------------------------------------------------------------

    fn minion_dir(&self, name: &str) -> PathBuf {
        self.root.join(MINIONS_DIR).join(name)
    }

    /// Reads the canonical `state` file.
    fn state_of(&self, name: &str) -> Result<MinionState> {
        let path = self.minion_dir(name).join("state");
        let data = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("minion {name}")),
            _ => e.into(),
        })?;
        data.parse()
    }

    fn write_state(&self, name: &str, state: MinionState) -> Result<()> {
        write_file(
            &self.minion_dir(name).join("state"),
            state.as_str().as_bytes(),
        )
    }

    fn link(&self, name: &str, state: MinionState) -> Result<()> {
        let source = self.minion_dir(name);
        let link = self.root.join(bucket(state)).join(name);
        if let Ok(existing) = fs::read_link(&link) {
            if existing == source {
                return Ok(());
            }
            let _ = fs::remove_file(&link);
        }
        symlink(&source, &link)?;
        Ok(())
    }

    fn unlink(&self, name: &str, state: MinionState) {
        let link = self.root.join(bucket(state)).join(name);
        if let Err(e) = fs::remove_file(&link) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(link = %link.display(), error = %e, "remove stale bucket symlink");
            }
        }
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minion(name: &str) -> Minion {
        Minion {
            name: name.to_string(),
            hostname: format!("{name}.internal"),
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            ..Minion::default()
        }
    }

    fn open_store(dir: &Path) -> Keystore {
        Keystore::open(dir.join("store")).unwrap()
    }

    #[test]
    fn first_contact_policy_selects_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut m = minion("pre");
        assert_eq!(
            store.upsert(&mut m, "PEM", false, false).unwrap(),
            MinionState::Unaccepted
        );
        let mut m = minion("auto");
        assert_eq!(
            store.upsert(&mut m, "PEM", true, false).unwrap(),
            MinionState::AutoSign
        );
        let mut m = minion("denied");
        assert_eq!(
            store.upsert(&mut m, "PEM", false, true).unwrap(),
            MinionState::Denied
        );
        // auto_sign wins over auto_denied.
        let mut m = minion("both");
        assert_eq!(
            store.upsert(&mut m, "PEM", true, true).unwrap(),
            MinionState::AutoSign
        );

        assert_eq!(store.list(MinionState::Unaccepted), vec!["pre"]);
        assert_eq!(store.list(MinionState::AutoSign), vec!["auto", "both"]);
        assert_eq!(store.list(MinionState::Denied), vec!["denied"]);
    }

    #[test]
    fn upsert_issues_uid_once_and_preserves_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut m = minion("m1");
        store.upsert(&mut m, "PEM", false, false).unwrap();
        let issued = m.uid.clone();
        assert!(!issued.is_empty());
        let registered = m.registry_timestamp;

        // Reattach with a blank uid: the stored one wins.
        let mut again = minion("m1");
        store.upsert(&mut again, "PEM", false, false).unwrap();
        assert_eq!(again.uid, issued);
        assert_eq!(again.registry_timestamp, registered);
    }

    #[test]
    fn accept_moves_symlink_state_file_and_sets() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut m = minion("m1");
        store.upsert(&mut m, "PEM", false, false).unwrap();
        store.accept("m1", false, false).unwrap();

        assert_eq!(store.list(MinionState::Accepted), vec!["m1"]);
        assert!(store.list(MinionState::Unaccepted).is_empty());

        let root = dir.path().join("store");
        assert!(root.join("minions_accept/m1").exists());
        assert!(!root.join("minions_pre/m1").exists());
        assert_eq!(
            fs::read_to_string(root.join("minions/m1/state")).unwrap(),
            "accepted"
        );
    }

    #[test]
    fn accept_needs_inclusion_flags_for_rejected_and_denied() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut m = minion("m1");
        store.upsert(&mut m, "PEM", false, true).unwrap(); // denied
        assert!(store.accept("m1", false, false).unwrap_err().is_not_found());
        store.accept("m1", false, true).unwrap();

        store.reject("m1", true, false).unwrap();
        assert!(store.accept("m1", false, false).unwrap_err().is_not_found());
        store.accept("m1", true, false).unwrap();
        assert_eq!(store.list(MinionState::Accepted), vec!["m1"]);
    }

    #[test]
    fn reject_covers_accepted_and_autosign_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut m = minion("signed");
        store.upsert(&mut m, "PEM", true, false).unwrap();
        assert!(store.reject("signed", false, false).unwrap_err().is_not_found());
        store.reject("signed", true, false).unwrap();
        assert_eq!(store.list(MinionState::Rejected), vec!["signed"]);
    }

    #[test]
    fn accepting_twice_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut m = minion("m1");
        store.upsert(&mut m, "PEM", false, false).unwrap();
        store.accept("m1", false, false).unwrap();
        assert!(store.accept("m1", false, false).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_removes_record_and_bucket_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut m = minion("m1");
        store.upsert(&mut m, "PEM", false, false).unwrap();
        store.delete("m1").unwrap();

        assert!(store.get("m1").unwrap_err().is_not_found());
        assert!(store.list_all().is_empty());
        let root = dir.path().join("store");
        assert!(!root.join("minions/m1").exists());
        assert!(!root.join("minions_pre/m1").exists());
        assert!(store.delete("m1").unwrap_err().is_not_found());
    }

    #[test]
    fn restart_rebuilds_state_sets_from_disk() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = open_store(dir.path());
            for (name, accept) in [("m1", true), ("m2", false), ("m3", true)] {
                let mut m = minion(name);
                store.upsert(&mut m, "PEM", false, false).unwrap();
                if accept {
                    store.accept(name, false, false).unwrap();
                }
            }
            store.reject("m3", true, false).unwrap();
        }

        let store = open_store(dir.path());
        assert_eq!(store.list(MinionState::Accepted), vec!["m1"]);
        assert_eq!(store.list(MinionState::Unaccepted), vec!["m2"]);
        assert_eq!(store.list(MinionState::Rejected), vec!["m3"]);

        let key = store.get("m1").unwrap();
        assert_eq!(key.state, MinionState::Accepted);
        assert_eq!(key.public_key, "PEM");
        assert_eq!(key.minion.name, "m1");
    }

    #[test]
    fn master_pair_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = open_store(dir.path()).master_keys().public_pem().to_string();
        let second = open_store(dir.path()).master_keys().public_pem().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn subscribers_observe_transitions_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let (id, mut rx) = store.subscribe();

        let mut m = minion("m1");
        store.upsert(&mut m, "PEM", false, false).unwrap();
        store.accept("m1", false, false).unwrap();
        store.delete("m1").unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent {
                name: "m1".to_string(),
                state: MinionState::Accepted,
                deleted: false,
            }
        );
        let ev = rx.try_recv().unwrap();
        assert!(ev.deleted);

        store.unsubscribe(id);
        let mut m = minion("m2");
        store.upsert(&mut m, "PEM", false, false).unwrap();
        store.accept("m2", false, false).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn file_and_directory_modes_are_restrictive() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let mut m = minion("m1");
        store.upsert(&mut m, "PEM", false, false).unwrap();

        let root = dir.path().join("store");
        let dir_mode = fs::metadata(root.join("minions/m1"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = fs::metadata(root.join("minions/m1/minion"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
