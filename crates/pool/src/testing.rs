//! Testing utilities for pools
//!
//! [`MockResource`] is a scriptable [`Resource`]: creation, closure and
//! validation can be made to fail at runtime, and every call is counted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::resource::Resource;

/// A connection produced by [`MockResource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConnection {
    /// Creation order, starting at 1
    pub serial: u64,
}

/// Scriptable resource for tests.
#[derive(Debug)]
pub struct MockResource {
    id: String,
    create_delay: Duration,
    validate_delay: Duration,
    serial: AtomicU64,
    create_attempts: AtomicU64,
    fail_create: AtomicBool,
    fail_validation: AtomicBool,
    fail_cleanup: AtomicBool,
    validations: AtomicU64,
    cleanups: AtomicU64,
    closed: Mutex<HashSet<u64>>,
}

impl MockResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            create_delay: Duration::ZERO,
            validate_delay: Duration::ZERO,
            serial: AtomicU64::new(0),
            create_attempts: AtomicU64::new(0),
            fail_create: AtomicBool::new(false),
            fail_validation: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            validations: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
            closed: Mutex::new(HashSet::new()),
        }
    }

    /// Sleep this long inside every `create`.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Sleep this long inside every `validate`.
    pub fn with_validate_delay(mut self, delay: Duration) -> Self {
        self.validate_delay = delay;
        self
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_validation(&self, fail: bool) {
        self.fail_validation.store(fail, Ordering::SeqCst);
    }

    /// Make every `cleanup` fail after counting the attempt.
    pub fn set_fail_cleanup(&self, fail: bool) {
        self.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    /// Make the connection with this serial report itself closed.
    pub fn mark_closed(&self, serial: u64) {
        self.closed.lock().insert(serial);
    }

    pub fn create_attempts(&self) -> u64 {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub fn created_count(&self) -> u64 {
        self.serial.load(Ordering::SeqCst)
    }

    pub fn validation_count(&self) -> u64 {
        self.validations.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> u64 {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl Resource for MockResource {
    type Instance = MockConnection;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&self) -> Result<MockConnection> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::creation(&self.id, "mock creation failed"));
        }
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConnection { serial })
    }

    fn is_closed(&self, instance: &MockConnection) -> bool {
        self.closed.lock().contains(&instance.serial)
    }

    async fn validate(&self, instance: &MockConnection, query: &str) -> Result<()> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if !self.validate_delay.is_zero() {
            tokio::time::sleep(self.validate_delay).await;
        }
        if self.fail_validation.load(Ordering::SeqCst) {
            return Err(Error::validation(
                &self.id,
                instance.serial,
                format!("{query} failed"),
            ));
        }
        Ok(())
    }

    async fn cleanup(&self, instance: MockConnection) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(Error::close(&self.id, instance.serial, "mock close failed"));
        }
        Ok(())
    }
}
