//! Session Lifecycle
//!
//! The session is a process singleton: `Locked → Unlocked → Locked`.
//! Unlock verifies the passphrase-derived verifier, stretches the master into
//! sub-keys, and discards the master. Crypto operations take the read side of
//! the lock, so an explicit or idle lock waits for in-flight encrypts and
//! decrypts to drain before wiping key material. A watch channel publishes
//! lock epochs so long-running work can cancel when the keys go away.

use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Duration, Utc};
use tokio::sync::watch;

use super::keys::{MasterKey, SubKeys};
use super::primitives::ct_eq;
use crate::error::{CoreError, Result};

/// How a session was unlocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Passphrase-derived. Full read/write.
    Owner,
    /// Derived from combined testament shares. Reads and chat only;
    /// every write except audit-log appends is rejected.
    Heir,
}

struct Unlocked {
    keys: SubKeys,
    mode: SessionMode,
}

/// Process-wide session state
pub struct Session {
    state: RwLock<Option<Unlocked>>,
    /// Unix seconds of the last key use; drives idle auto-lock
    last_activity: AtomicI64,
    idle_timeout: Duration,
    /// Bumps on every lock; receivers treat a change as "cancel now"
    epoch_tx: watch::Sender<u64>,
}

impl Session {
    pub fn new(idle_minutes: i64) -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(None),
            last_activity: AtomicI64::new(0),
            idle_timeout: Duration::minutes(idle_minutes),
            epoch_tx,
        }
    }

    /// Unlock with a master key after matching it against the stored verifier.
    /// The master is consumed, stretched into sub-keys, and wiped on return.
    pub fn unlock(
        &self,
        master: MasterKey,
        stored_verifier: &[u8],
        mode: SessionMode,
    ) -> Result<()> {
        if !ct_eq(&master.verifier(), stored_verifier) {
            return Err(CoreError::BadPassphrase);
        }
        let keys = SubKeys::derive(&master);
        drop(master);

        let mut state = self
            .state
            .write()
            .map_err(|_| CoreError::internal("session lock poisoned"))?;
        *state = Some(Unlocked { keys, mode });
        self.last_activity.store(Utc::now().timestamp(), Ordering::SeqCst);
        Ok(())
    }

    /// Explicit lock. Blocks until in-flight crypto readers drain, then wipes.
    pub fn lock(&self) {
        if let Ok(mut state) = self.state.write() {
            // Dropping Unlocked zeroizes the sub-keys.
            *state = None;
        }
        self.epoch_tx.send_modify(|e| *e += 1);
    }

    /// Lock only if the idle window has elapsed; returns whether it locked.
    /// Run from the scheduler's idle sweep.
    pub fn lock_if_idle(&self) -> bool {
        if !self.is_unlocked() {
            return false;
        }
        let last = self.last_activity.load(Ordering::SeqCst);
        let idle = Utc::now().timestamp() - last;
        if idle >= self.idle_timeout.num_seconds() {
            self.lock();
            return true;
        }
        false
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.read().map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn mode(&self) -> Option<SessionMode> {
        self.state.read().ok().and_then(|s| s.as_ref().map(|u| u.mode))
    }

    /// Run `f` with the sub-keys under the read lock. Touches the activity
    /// stamp. `SessionLocked` when no keys are in memory.
    pub fn with_keys<T>(&self, f: impl FnOnce(&SubKeys) -> Result<T>) -> Result<T> {
        let state = self
            .state
            .read()
            .map_err(|_| CoreError::internal("session lock poisoned"))?;
        let unlocked = state.as_ref().ok_or(CoreError::SessionLocked)?;
        self.last_activity.store(Utc::now().timestamp(), Ordering::SeqCst);
        f(&unlocked.keys)
    }

    /// Reject writes for heir-mode sessions
    pub fn require_writable(&self) -> Result<()> {
        match self.mode() {
            Some(SessionMode::Owner) => Ok(()),
            Some(SessionMode::Heir) => {
                Err(CoreError::Conflict("heir session is read-only".to_string()))
            }
            None => Err(CoreError::SessionLocked),
        }
    }

    /// Subscribe to lock epochs; a change means the keys were wiped
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shield::primitives::KEY_LEN;

    fn master() -> MasterKey {
        MasterKey::from_bytes([42u8; KEY_LEN])
    }

    #[test]
    fn unlock_requires_matching_verifier() {
        let session = Session::new(15);
        let verifier = master().verifier();

        assert!(matches!(
            session.unlock(master(), &[0u8; 32], SessionMode::Owner),
            Err(CoreError::BadPassphrase)
        ));
        assert!(!session.is_unlocked());

        session.unlock(master(), &verifier, SessionMode::Owner).unwrap();
        assert!(session.is_unlocked());
    }

    #[test]
    fn with_keys_after_lock_is_session_locked() {
        let session = Session::new(15);
        let verifier = master().verifier();
        session.unlock(master(), &verifier, SessionMode::Owner).unwrap();

        session.with_keys(|k| {
            assert_eq!(k.kek().len(), KEY_LEN);
            Ok(())
        })
        .unwrap();

        session.lock();
        assert!(matches!(
            session.with_keys(|_| Ok(())),
            Err(CoreError::SessionLocked)
        ));
    }

    #[test]
    fn lock_bumps_epoch() {
        let session = Session::new(15);
        let rx = session.subscribe();
        let before = *rx.borrow();
        session.lock();
        assert_eq!(*rx.borrow(), before + 1);
    }

    #[test]
    fn heir_mode_rejects_writes() {
        let session = Session::new(15);
        let verifier = master().verifier();
        session.unlock(master(), &verifier, SessionMode::Heir).unwrap();
        assert!(matches!(
            session.require_writable(),
            Err(CoreError::Conflict(_))
        ));
        // Reads still work
        assert!(session.with_keys(|_| Ok(())).is_ok());
    }

    #[test]
    fn zero_idle_window_locks_on_sweep() {
        let session = Session::new(0);
        let verifier = master().verifier();
        session.unlock(master(), &verifier, SessionMode::Owner).unwrap();
        assert!(session.lock_if_idle());
        assert!(!session.is_unlocked());
    }
}
