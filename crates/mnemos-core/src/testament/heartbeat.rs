//! Heartbeat
//!
//! Challenge-response liveness plus the time-based escalation ladder:
//! Fresh → Reminded(30) → UrgentReminder(45) → EmergencyContactAlerted(60) →
//! KeyholdersAlerted(75) → InheritanceTriggered(90). The daily tick advances
//! monotonically and dispatches exactly one alert per (level, trigger-day);
//! the unique idempotency key makes it safe to run concurrently across
//! processes. A successful check-in resets the ladder without revoking prior
//! alerts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;

use crate::config::HeartbeatConfig;
use crate::error::{CoreError, Result};
use crate::model::{AlertLevel, HeartbeatAlert, HeartbeatChallenge};
use crate::shield::primitives::{ct_eq, keyed_hash};
use crate::storage::Storage;

/// The status surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    pub last_checkin: Option<DateTime<Utc>>,
    pub days_since: i64,
    pub next_due: DateTime<Utc>,
    pub is_overdue: bool,
    pub current_alert_level: AlertLevel,
    pub alerts: Vec<HeartbeatAlert>,
}

/// Challenge-response liveness and escalation
pub struct HeartbeatService {
    storage: Arc<Storage>,
    config: HeartbeatConfig,
}

impl HeartbeatService {
    pub fn new(storage: Arc<Storage>, config: HeartbeatConfig) -> Self {
        Self { storage, config }
    }

    fn threshold_days(&self, level: AlertLevel) -> i64 {
        match level {
            AlertLevel::Fresh => 0,
            AlertLevel::Reminded => self.config.remind_days,
            AlertLevel::UrgentReminder => self.config.urgent_days,
            AlertLevel::EmergencyContactAlerted => self.config.emergency_contact_days,
            AlertLevel::KeyholdersAlerted => self.config.keyholder_days,
            AlertLevel::InheritanceTriggered => self.config.inheritance_days,
        }
    }

    /// The alert level implied by `days` since the last check-in.
    /// Non-decreasing in `days`.
    pub fn level_for(&self, days: i64) -> AlertLevel {
        let mut current = AlertLevel::Fresh;
        for level in AlertLevel::ESCALATIONS {
            if days >= self.threshold_days(level) {
                current = level;
            }
        }
        current
    }

    /// The ladder anchor: last check-in, or setup time before any check-in.
    /// Before setup there is no owner to escalate for.
    fn anchor(&self) -> Result<Option<DateTime<Utc>>> {
        if let Some(at) = self.storage.last_checkin()? {
            return Ok(Some(at));
        }
        self.storage.setup_created_at()
    }

    /// Issue a random 32-byte challenge with the interval as expiry
    pub fn issue_challenge(&self, now: DateTime<Utc>) -> Result<HeartbeatChallenge> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let challenge = HeartbeatChallenge {
            challenge: hex::encode(bytes),
            issued_at: now,
            expires_at: now + Duration::days(self.config.interval_days),
        };
        self.storage
            .insert_challenge(&challenge.challenge, now, challenge.expires_at)?;
        Ok(challenge)
    }

    /// Verify `response = HMAC(verifier, challenge-bytes)` and record the
    /// check-in. The owner derives the verifier from the passphrase; the
    /// server holds it at rest. The challenge is single-use either way.
    pub fn checkin(
        &self,
        challenge_hex: &str,
        response_hex: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.storage.consume_challenge(challenge_hex, now)?;

        let config = self
            .storage
            .kdf_config()?
            .ok_or_else(|| CoreError::PreconditionFailed("setup not completed".to_string()))?;
        let verifier: [u8; 32] = config
            .verifier
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::internal("stored verifier length"))?;
        let challenge_bytes =
            hex::decode(challenge_hex).map_err(|_| CoreError::BadPassphrase)?;
        let response =
            hex::decode(response_hex.trim()).map_err(|_| CoreError::BadPassphrase)?;

        let expected = keyed_hash(&verifier, &challenge_bytes);
        if !ct_eq(&expected, &response) {
            return Err(CoreError::BadPassphrase);
        }

        self.storage.record_checkin(now)?;
        self.storage.append_audit("heartbeat_checkin", None)?;
        Ok(now + Duration::days(self.config.interval_days))
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<HeartbeatStatus> {
        let last_checkin = self.storage.last_checkin()?;
        let anchor = last_checkin.unwrap_or(now);
        let days_since = (now - anchor).num_days().max(0);
        let next_due = anchor + Duration::days(self.config.interval_days);
        Ok(HeartbeatStatus {
            last_checkin,
            days_since,
            next_due,
            is_overdue: now > next_due,
            current_alert_level: self.level_for(days_since),
            alerts: self.storage.alerts(50)?,
        })
    }

    /// The daily tick. Dispatches one alert per crossed level, keyed by
    /// (level, trigger-day); returns the levels dispatched by THIS tick.
    /// Crossing `InheritanceTriggered` activates heir mode.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<AlertLevel>> {
        let Some(anchor) = self.anchor()? else {
            return Ok(Vec::new());
        };
        let days = (now - anchor).num_days();
        let mut dispatched = Vec::new();

        for level in AlertLevel::ESCALATIONS {
            let threshold = self.threshold_days(level);
            if days < threshold {
                break;
            }
            let trigger_day = (anchor + Duration::days(threshold)).date_naive();
            let key = format!("{}:{}", level.as_str(), trigger_day);
            if self.storage.insert_alert(level, &key, None)? {
                self.dispatch(level)?;
                dispatched.push(level);
            }
        }
        Ok(dispatched)
    }

    fn dispatch(&self, level: AlertLevel) -> Result<()> {
        // Delivery is the notifier's concern; the record is what matters
        tracing::warn!(level = level.as_str(), "heartbeat escalation dispatched");
        self.storage
            .append_audit("heartbeat_alert", Some(level.as_str()))?;
        if level == AlertLevel::InheritanceTriggered {
            self.storage.set_heir_mode(true)?;
            self.storage.append_audit("heir_mode_activated", None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shield::{KdfParams, MasterKey};
    use crate::storage::KdfConfig;

    fn service() -> (tempfile::TempDir, Arc<Storage>, HeartbeatService) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("hb.db"))).unwrap());
        let service = HeartbeatService::new(Arc::clone(&storage), HeartbeatConfig::default());
        (dir, storage, service)
    }

    fn setup_owner(storage: &Storage) -> MasterKey {
        let master = MasterKey::from_bytes([17u8; 32]);
        storage
            .save_kdf_config(&KdfConfig {
                salt: vec![1u8; 32],
                params: KdfParams::default(),
                verifier: master.verifier().to_vec(),
            })
            .unwrap();
        master
    }

    #[test]
    fn level_is_monotonic_in_days() {
        let (_dir, _storage, service) = service();
        let mut prev = AlertLevel::Fresh;
        for days in 0..120 {
            let level = service.level_for(days);
            assert!(level >= prev, "level regressed at day {days}");
            prev = level;
        }
        assert_eq!(service.level_for(29), AlertLevel::Fresh);
        assert_eq!(service.level_for(30), AlertLevel::Reminded);
        assert_eq!(service.level_for(89), AlertLevel::KeyholdersAlerted);
        assert_eq!(service.level_for(90), AlertLevel::InheritanceTriggered);
    }

    #[test]
    fn tick_at_91_days_dispatches_once() {
        let (_dir, storage, service) = service();
        setup_owner(&storage);
        let now = Utc::now();
        storage.record_checkin(now - Duration::days(91)).unwrap();

        let dispatched = service.tick(now).unwrap();
        assert!(dispatched.contains(&AlertLevel::KeyholdersAlerted));
        assert!(dispatched.contains(&AlertLevel::InheritanceTriggered));

        // A second tick the same day records nothing new
        assert!(service.tick(now).unwrap().is_empty());

        let alerts = storage.alerts(50).unwrap();
        let inheritance = alerts
            .iter()
            .filter(|a| a.level == AlertLevel::InheritanceTriggered)
            .count();
        assert_eq!(inheritance, 1);
        assert!(storage.testament_config().unwrap().heir_mode_active);
    }

    #[test]
    fn checkin_resets_without_revoking_alerts() {
        let (_dir, storage, service) = service();
        setup_owner(&storage);
        let now = Utc::now();
        storage.record_checkin(now - Duration::days(46)).unwrap();
        service.tick(now).unwrap();

        let before = storage.alerts(50).unwrap().len();
        assert!(before >= 2);

        storage.record_checkin(now).unwrap();
        let status = service.status(now).unwrap();
        assert_eq!(status.current_alert_level, AlertLevel::Fresh);
        assert!(!status.is_overdue);
        // Prior alerts stay in the audit trail
        assert_eq!(storage.alerts(50).unwrap().len(), before);
    }

    #[test]
    fn checkin_protocol_verifies_hmac() {
        let (_dir, storage, service) = service();
        let master = setup_owner(&storage);
        let now = Utc::now();

        let challenge = service.issue_challenge(now).unwrap();
        let challenge_bytes = hex::decode(&challenge.challenge).unwrap();
        let response = keyed_hash(&master.verifier(), &challenge_bytes);

        let next_due = service
            .checkin(&challenge.challenge, &hex::encode(response), now)
            .unwrap();
        assert_eq!(next_due, now + Duration::days(30));
        assert!(storage.last_checkin().unwrap().is_some());
    }

    #[test]
    fn bad_response_rejected_and_challenge_burned() {
        let (_dir, storage, service) = service();
        setup_owner(&storage);
        let now = Utc::now();
        let challenge = service.issue_challenge(now).unwrap();

        assert!(matches!(
            service.checkin(&challenge.challenge, &"00".repeat(32), now),
            Err(CoreError::BadPassphrase)
        ));
        // Single-use: even a correct retry needs a fresh challenge
        assert!(matches!(
            service.checkin(&challenge.challenge, &"00".repeat(32), now),
            Err(CoreError::Conflict(_))
        ));
    }

    #[test]
    fn expired_challenge_rejected() {
        let (_dir, storage, service) = service();
        setup_owner(&storage);
        let issued = Utc::now() - Duration::days(40);
        let challenge = service.issue_challenge(issued).unwrap();

        assert!(matches!(
            service.checkin(&challenge.challenge, &"00".repeat(32), Utc::now()),
            Err(CoreError::PreconditionFailed(_))
        ));
    }
}
