use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

pub const NONCE_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("challenge not found")]
    NotFound,
    #[error("challenge expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub id: String,
    pub device_id: String,
    pub nonce: [u8; NONCE_LEN],
    pub expires_at: DateTime<Utc>,
}

/// Short-lived, single-use attestation challenges. Consumption removes the
/// entry and checks expiry in the same critical section, so a challenge can
/// never be redeemed twice and never after its TTL even if the sweeper has
/// not run yet.
pub struct ChallengeStore {
    challenges: Mutex<HashMap<String, Challenge>>,
    ttl: Duration,
}

impl ChallengeStore {
    pub fn new(ttl: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            challenges: Mutex::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(60)),
        })
    }

    pub fn create(&self, device_id: &str) -> Challenge {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            nonce,
            expires_at: Utc::now() + self.ttl,
        };

        let mut guard = self.challenges.lock().unwrap();
        guard.insert(challenge.id.clone(), challenge.clone());
        challenge
    }

    pub fn consume(&self, id: &str) -> Result<Challenge, ChallengeError> {
        let mut guard = self.challenges.lock().unwrap();
        let challenge = guard.remove(id).ok_or(ChallengeError::NotFound)?;
        if Utc::now() > challenge.expires_at {
            return Err(ChallengeError::Expired);
        }
        Ok(challenge)
    }

    /// Drop expired entries; called periodically by the sweeper task.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut guard = self.challenges.lock().unwrap();
        guard.retain(|_, c| c.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.challenges.lock().unwrap().len()
    }
}

/// Periodic cleanup of expired challenges. The returned handle is aborted on
/// shutdown.
pub fn spawn_sweeper(store: Arc<ChallengeStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            store.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_is_single_use() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(60));
        let challenge = store.create("device-1234");
        assert_eq!(challenge.device_id, "device-1234");

        let consumed = store.consume(&challenge.id).unwrap();
        assert_eq!(consumed.nonce, challenge.nonce);
        assert_eq!(store.consume(&challenge.id), Err(ChallengeError::NotFound));
    }

    #[test]
    fn expired_challenge_cannot_be_consumed() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(0));
        let challenge = store.create("device-1234");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(store.consume(&challenge.id), Err(ChallengeError::Expired));
        // Consumption removed it even though it had expired.
        assert_eq!(store.consume(&challenge.id), Err(ChallengeError::NotFound));
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(60));
        store.create("device-aaaa");
        let expired = Challenge {
            id: "expired".to_string(),
            device_id: "device-bbbb".to_string(),
            nonce: [0u8; NONCE_LEN],
            expires_at: Utc::now() - Duration::seconds(1),
        };
        store
            .challenges
            .lock()
            .unwrap()
            .insert(expired.id.clone(), expired);

        assert_eq!(store.len(), 2);
        store.sweep();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn nonces_are_unique() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(60));
        let a = store.create("device-1234");
        let b = store.create("device-1234");
        assert_ne!(a.id, b.id);
        assert_ne!(a.nonce, b.nonce);
    }
}
