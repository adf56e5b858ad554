//! Test doubles shared by the unit tests

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::*;
use crate::network::{CallRecordClient, TokenMinter};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            sleeps: Mutex::new(Vec::new()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

pub struct CountingMinter {
    clock: Arc<ManualClock>,
    lifetime: chrono::Duration,
    calls: Mutex<u32>,
    fail_next: Mutex<bool>,
}

impl CountingMinter {
    pub fn new(clock: Arc<ManualClock>, lifetime: chrono::Duration) -> Self {
        Self {
            clock,
            lifetime,
            calls: Mutex::new(0),
            fail_next: Mutex::new(false),
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }
}

#[async_trait]
impl TokenMinter for CountingMinter {
    async fn mint_token(&self) -> Result<TokenRecord> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(Error::Backend("500 Internal Server Error".into()));
        }
        let n = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        Ok(TokenRecord {
            token: format!("minted-{}", n),
            expires_at: self.clock.now() + self.lifetime,
        })
    }
}

/// Record client whose failures are scripted per call.
#[derive(Default)]
pub struct ScriptedRecordClient {
    created: Mutex<Vec<String>>,
    fail_create: Mutex<bool>,
    update_script: Mutex<VecDeque<bool>>,
    attempts: Mutex<Vec<(String, CallStatus)>>,
    delivered: Mutex<Vec<(String, CallStatus)>>,
}

impl ScriptedRecordClient {
    pub fn fail_create(&self) {
        *self.fail_create.lock() = true;
    }

    /// Queue outcomes for the next status writes; `false` fails the write.
    pub fn script_updates(&self, outcomes: &[bool]) {
        self.update_script.lock().extend(outcomes.iter().copied());
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub fn attempts(&self) -> Vec<(String, CallStatus)> {
        self.attempts.lock().clone()
    }

    pub fn delivered(&self) -> Vec<(String, CallStatus)> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl CallRecordClient for ScriptedRecordClient {
    async fn create(&self, receiver_id: &str) -> Result<CallRecord> {
        if *self.fail_create.lock() {
            return Err(Error::Backend("network down".into()));
        }
        let id = {
            let mut created = self.created.lock();
            created.push(receiver_id.to_string());
            format!("c{}", created.len())
        };
        Ok(CallRecord {
            id,
            receiver_id: receiver_id.to_string(),
            status: CallStatus::Initiated,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            failed_at: None,
        })
    }

    async fn update_status(&self, call_id: &str, status: CallStatus, _at: DateTime<Utc>) -> Result<()> {
        self.attempts.lock().push((call_id.to_string(), status));
        tokio::task::yield_now().await;
        let ok = self.update_script.lock().pop_front().unwrap_or(true);
        if !ok {
            return Err(Error::Backend("503 Service Unavailable".into()));
        }
        self.delivered.lock().push((call_id.to_string(), status));
        Ok(())
    }
}
