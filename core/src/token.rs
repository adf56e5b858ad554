//! Calling-platform token cache with refresh-ahead expiry

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::TokenRecord;
use crate::network::TokenMinter;
use crate::storage::LocalStorage;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct TokenCache {
    minter: Arc<dyn TokenMinter>,
    storage: Arc<LocalStorage>,
    clock: Arc<dyn Clock>,
    refresh_buffer: chrono::Duration,
    cached: Mutex<Option<TokenRecord>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenCache {
    pub fn new(
        minter: Arc<dyn TokenMinter>,
        storage: Arc<LocalStorage>,
        clock: Arc<dyn Clock>,
        refresh_buffer: chrono::Duration,
    ) -> Self {
        Self {
            minter,
            storage,
            clock,
            refresh_buffer,
            cached: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Memory first, then durable storage (after a restart).
    fn current(&self) -> Option<TokenRecord> {
        if let Some(record) = self.cached.lock().clone() {
            return Some(record);
        }
        match self.storage.get_token() {
            Ok(Some(record)) => {
                *self.cached.lock() = Some(record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to load stored calling token: {}", e);
                None
            }
        }
    }

    fn fresh(&self) -> Option<String> {
        let now = self.clock.now();
        self.current()
            .filter(|r| r.is_fresh(now, self.refresh_buffer))
            .map(|r| r.token)
    }

    /// True when no token is held or it is inside the refresh buffer.
    pub fn needs_refresh(&self) -> bool {
        self.fresh().is_none()
    }

    pub async fn get_valid_token(&self) -> Result<String> {
        if let Some(token) = self.fresh() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited.
        if let Some(token) = self.fresh() {
            return Ok(token);
        }

        log::debug!("Minting calling token");
        let record = self.minter.mint_token().await.map_err(|e| {
            log::error!("Calling token mint failed: {}", e);
            Error::AuthExpired(e.to_string())
        })?;
        self.persist_token(record.clone())?;
        Ok(record.token)
    }

    pub fn persist_token(&self, record: TokenRecord) -> Result<()> {
        self.storage.save_token(&record)?;
        *self.cached.lock() = Some(record);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        *self.cached.lock() = None;
        self.storage.clear_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingMinter, ManualClock};
    use chrono::Duration;

    fn cache(minter: Arc<CountingMinter>, storage: Arc<LocalStorage>, clock: Arc<ManualClock>) -> TokenCache {
        TokenCache::new(minter, storage, clock, Duration::hours(24))
    }

    #[tokio::test]
    async fn test_token_inside_buffer_is_refreshed() {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let minter = Arc::new(CountingMinter::new(clock.clone(), Duration::days(7)));
        let cache = cache(minter.clone(), storage.clone(), clock.clone());

        cache
            .persist_token(TokenRecord {
                token: "old".into(),
                expires_at: clock.now() + Duration::hours(12),
            })
            .unwrap();
        assert!(cache.needs_refresh());

        let token = cache.get_valid_token().await.unwrap();
        assert_eq!(token, "minted-1");
        assert_eq!(minter.calls(), 1);
        assert_eq!(storage.get_token().unwrap().unwrap().token, "minted-1");
    }

    #[tokio::test]
    async fn test_token_outside_buffer_is_reused() {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let minter = Arc::new(CountingMinter::new(clock.clone(), Duration::days(7)));
        let cache = cache(minter.clone(), storage, clock.clone());

        cache
            .persist_token(TokenRecord {
                token: "cached".into(),
                expires_at: clock.now() + Duration::hours(48),
            })
            .unwrap();

        assert!(!cache.needs_refresh());
        assert_eq!(cache.get_valid_token().await.unwrap(), "cached");
        assert_eq!(minter.calls(), 0);
    }

    #[tokio::test]
    async fn test_stored_token_used_after_restart() {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        storage
            .save_token(&TokenRecord {
                token: "persisted".into(),
                expires_at: clock.now() + Duration::days(3),
            })
            .unwrap();
        let minter = Arc::new(CountingMinter::new(clock.clone(), Duration::days(7)));
        let cache = cache(minter.clone(), storage, clock);

        assert_eq!(cache.get_valid_token().await.unwrap(), "persisted");
        assert_eq!(minter.calls(), 0);
    }

    #[tokio::test]
    async fn test_token_ages_into_buffer() {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let minter = Arc::new(CountingMinter::new(clock.clone(), Duration::hours(48)));
        let cache = cache(minter.clone(), storage, clock.clone());

        assert_eq!(cache.get_valid_token().await.unwrap(), "minted-1");
        clock.advance(Duration::hours(12));
        assert_eq!(cache.get_valid_token().await.unwrap(), "minted-1");
        clock.advance(Duration::hours(13));
        assert!(cache.needs_refresh());
        assert_eq!(cache.get_valid_token().await.unwrap(), "minted-2");
    }

    #[tokio::test]
    async fn test_concurrent_callers_mint_once() {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let minter = Arc::new(CountingMinter::new(clock.clone(), Duration::days(7)));
        let cache = cache(minter.clone(), storage, clock);

        let (a, b) = tokio::join!(cache.get_valid_token(), cache.get_valid_token());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(minter.calls(), 1);
    }

    #[tokio::test]
    async fn test_mint_failure_is_auth_expired() {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let minter = Arc::new(CountingMinter::new(clock.clone(), Duration::days(7)));
        minter.fail_next();
        let cache = cache(minter, storage, clock);

        assert!(matches!(cache.get_valid_token().await, Err(Error::AuthExpired(_))));
    }

    #[tokio::test]
    async fn test_clear_wipes_memory_and_storage() {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let minter = Arc::new(CountingMinter::new(clock.clone(), Duration::days(7)));
        let cache = cache(minter, storage.clone(), clock);

        cache.get_valid_token().await.unwrap();
        cache.clear().unwrap();
        assert!(cache.needs_refresh());
        assert!(storage.get_token().unwrap().is_none());
    }
}
