//! Ownership guard
//!
//! Before touching an object that belongs to a shoot, the controller asks the
//! owner watchdog whether this seed still owns the shoot. The answer comes
//! with an [`OwnershipLease`]: a token that fires if ownership is lost
//! mid-operation and a cleanup that unregisters from the watchdog when the
//! lease is dropped.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crx_common::Error;

use crate::cluster::ShootInfo;
use crate::store::ObjectKey;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Registration with the owner watchdog for the duration of one pass
///
/// The cleanup runs exactly once when the lease is dropped, on every exit
/// path including early returns and panics.
pub struct OwnershipLease {
    token: CancellationToken,
    cleanup: Option<Cleanup>,
}

impl OwnershipLease {
    /// Create a lease with a cleanup to run on drop
    pub fn new(token: CancellationToken, cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            token,
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Create a lease with nothing to clean up
    pub fn detached(token: CancellationToken) -> Self {
        Self {
            token,
            cleanup: None,
        }
    }

    /// Token cancelled when ownership is lost
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl fmt::Debug for OwnershipLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipLease")
            .field("cancelled", &self.token.is_cancelled())
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

impl Drop for OwnershipLease {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Answer of an ownership check
#[derive(Debug)]
pub struct OwnerCheck {
    /// Whether this seed owns the shoot
    pub owned: bool,
    /// Registration to hold while working on the object
    pub lease: OwnershipLease,
}

/// Checks shoot ownership and watches it for the duration of an operation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OwnerWatchdog: Send + Sync {
    /// Check ownership of `shoot` in `namespace` and register `key` for
    /// continued watching
    ///
    /// The returned lease's token is derived from `parent`.
    async fn check_and_watch(
        &self,
        parent: &CancellationToken,
        namespace: &str,
        shoot: &str,
        key: &str,
    ) -> Result<OwnerCheck, Error>;
}

/// Watchdog used when owner checks are turned off: always owned
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledWatchdog;

#[async_trait]
impl OwnerWatchdog for DisabledWatchdog {
    async fn check_and_watch(
        &self,
        parent: &CancellationToken,
        _namespace: &str,
        _shoot: &str,
        _key: &str,
    ) -> Result<OwnerCheck, Error> {
        Ok(OwnerCheck {
            owned: true,
            lease: OwnershipLease::detached(parent.child_token()),
        })
    }
}

/// Watchdog registration key of a ContainerRuntime
pub fn watchdog_key(key: &ObjectKey) -> String {
    format!("containerruntime:{}", key)
}

/// Acquire an ownership lease for `key`, failing if another seed owns the shoot
pub async fn guard_ownership(
    watchdog: &dyn OwnerWatchdog,
    parent: &CancellationToken,
    key: &ObjectKey,
    shoot: &ShootInfo,
) -> Result<OwnershipLease, Error> {
    let check = watchdog
        .check_and_watch(parent, &key.namespace, &shoot.name, &watchdog_key(key))
        .await?;

    if !check.owned {
        // Dropping the lease here unregisters the key
        debug!(containerruntime = %key, shoot = %shoot.object_name(), "seed is not the shoot owner");
        return Err(Error::not_owner(shoot.object_name()));
    }
    Ok(check.lease)
}
