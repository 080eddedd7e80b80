//! Owner watchdog manager
//!
//! Keeps one watchdog per seed namespace, shared by every object in that
//! namespace that is currently being worked on. The first registration checks
//! ownership; afterwards a background task re-checks on an interval and
//! cancels every registered token as soon as ownership is lost or cannot be
//! confirmed. The watchdog stops when its last registration is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crx_common::Error;

use crate::owner::{OwnerCheck, OwnerWatchdog, OwnershipLease};

/// Lease in each seed namespace naming the seed that owns the shoot
pub const OWNER_LEASE_NAME: &str = "shoot-owner";

/// Default interval between ownership re-checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Performs a single ownership check
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OwnerChecker: Send + Sync + 'static {
    /// Whether this seed owns `shoot`, whose control plane lives in `namespace`
    async fn check(&self, namespace: &str, shoot: &str) -> Result<bool, Error>;
}

/// Checker comparing the holder of the namespace's owner Lease with this seed
pub struct LeaseOwnerChecker {
    client: Client,
    identity: String,
}

impl LeaseOwnerChecker {
    /// Create a checker for the seed named `identity`
    pub fn new(client: Client, identity: impl Into<String>) -> Self {
        Self {
            client,
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl OwnerChecker for LeaseOwnerChecker {
    async fn check(&self, namespace: &str, shoot: &str) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let lease = api.get_opt(OWNER_LEASE_NAME).await?;
        let holder = lease
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.holder_identity.as_deref());

        // No lease or no holder: nobody has claimed the shoot away from us
        let owned = holder.map_or(true, |h| h == self.identity);
        debug!(namespace, shoot, holder = ?holder, owned, "checked shoot ownership");
        Ok(owned)
    }
}

/// Watchdog settings
#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    /// Interval between ownership re-checks
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

struct NamespaceWatchdog {
    shoot: String,
    owned: bool,
    keys: HashMap<String, CancellationToken>,
    stop: CancellationToken,
}

impl NamespaceWatchdog {
    fn lose_ownership(&mut self) {
        self.owned = false;
        for token in self.keys.values() {
            token.cancel();
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, NamespaceWatchdog>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, NamespaceWatchdog>> {
    // A panic while holding the lock cannot leave the map inconsistent
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`OwnerWatchdog`] implementation sharing one watchdog per namespace
pub struct WatchdogManager<C: OwnerChecker> {
    checker: Arc<C>,
    config: WatchdogConfig,
    registry: Registry,
}

impl<C: OwnerChecker> WatchdogManager<C> {
    /// Create a manager using the given checker
    pub fn new(checker: C, config: WatchdogConfig) -> Self {
        Self {
            checker: Arc::new(checker),
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of namespaces with a running watchdog
    pub fn active_namespaces(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Register `key` with the watchdog of `namespace` if it still owns the shoot
    fn register(
        &self,
        watchdog: &mut NamespaceWatchdog,
        parent: &CancellationToken,
        namespace: &str,
        key: &str,
    ) -> OwnerCheck {
        if !watchdog.owned {
            return not_owned();
        }
        let token = parent.child_token();
        watchdog.keys.insert(key.to_string(), token.clone());
        OwnerCheck {
            owned: true,
            lease: self.lease(token, namespace, key),
        }
    }

    fn lease(&self, token: CancellationToken, namespace: &str, key: &str) -> OwnershipLease {
        let registry = self.registry.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();
        OwnershipLease::new(token, move || unregister(&registry, &namespace, &key))
    }

    fn spawn_rechecks(&self, namespace: String, shoot: String, stop: CancellationToken) {
        let checker = self.checker.clone();
        let registry = self.registry.clone();
        let interval = self.config.interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let result = checker.check(&namespace, &shoot).await;
                let mut watchdogs = lock(&registry);
                let Some(watchdog) = watchdogs.get_mut(&namespace) else {
                    break;
                };
                match result {
                    Ok(true) => watchdog.owned = true,
                    Ok(false) => {
                        if watchdog.owned {
                            warn!(namespace = %namespace, shoot = %shoot, "lost shoot ownership, cancelling operations");
                        }
                        watchdog.lose_ownership();
                    }
                    Err(e) => {
                        warn!(namespace = %namespace, shoot = %shoot, error = %e, "ownership check failed, cancelling operations");
                        watchdog.lose_ownership();
                    }
                }
            }
            debug!(namespace = %namespace, "owner watchdog stopped");
        });
    }
}

fn not_owned() -> OwnerCheck {
    let token = CancellationToken::new();
    token.cancel();
    OwnerCheck {
        owned: false,
        lease: OwnershipLease::detached(token),
    }
}

fn unregister(registry: &Registry, namespace: &str, key: &str) {
    let mut watchdogs = lock(registry);
    let Some(watchdog) = watchdogs.get_mut(namespace) else {
        return;
    };
    watchdog.keys.remove(key);
    if watchdog.keys.is_empty() {
        watchdog.stop.cancel();
        watchdogs.remove(namespace);
        debug!(namespace, "last registration dropped, stopping owner watchdog");
    }
}

#[async_trait]
impl<C: OwnerChecker> OwnerWatchdog for WatchdogManager<C> {
    async fn check_and_watch(
        &self,
        parent: &CancellationToken,
        namespace: &str,
        shoot: &str,
        key: &str,
    ) -> Result<OwnerCheck, Error> {
        {
            let mut watchdogs = lock(&self.registry);
            if let Some(watchdog) = watchdogs.get_mut(namespace) {
                return Ok(self.register(watchdog, parent, namespace, key));
            }
        }

        let owned = self
            .checker
            .check(namespace, shoot)
            .await
            .map_err(|e| Error::owner_check(key, e.to_string()))?;
        if !owned {
            return Ok(not_owned());
        }

        // Another pass may have started the watchdog while we were checking;
        // the key joins it under the same lock so a concurrent last-key drop
        // cannot remove it in between
        let mut watchdogs = lock(&self.registry);
        let watchdog = watchdogs.entry(namespace.to_string()).or_insert_with(|| {
            let stop = CancellationToken::new();
            info!(namespace, shoot, "started owner watchdog");
            self.spawn_rechecks(namespace.to_string(), shoot.to_string(), stop.clone());
            NamespaceWatchdog {
                shoot: shoot.to_string(),
                owned: true,
                keys: HashMap::new(),
                stop,
            }
        });
        Ok(self.register(watchdog, parent, namespace, key))
    }
}

impl<C: OwnerChecker> std::fmt::Debug for WatchdogManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let watchdogs = lock(&self.registry);
        let namespaces: Vec<(&String, &String)> =
            watchdogs.iter().map(|(ns, w)| (ns, &w.shoot)).collect();
        f.debug_struct("WatchdogManager")
            .field("interval", &self.config.interval)
            .field("namespaces", &namespaces)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const FAST: WatchdogConfig = WatchdogConfig {
        interval: Duration::from_millis(10),
    };

    fn manager(checker: MockOwnerChecker) -> WatchdogManager<MockOwnerChecker> {
        WatchdogManager::new(checker, FAST)
    }

    async fn wait_for(token: &CancellationToken) {
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token was not cancelled");
    }

    #[tokio::test]
    async fn first_key_performs_initial_check() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let mut checker = MockOwnerChecker::new();
        checker.expect_check().returning(move |_, _| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
        let manager = WatchdogManager::new(
            checker,
            WatchdogConfig {
                interval: Duration::from_secs(3600),
            },
        );
        let parent = CancellationToken::new();

        let a = manager
            .check_and_watch(&parent, "shoot--dev--demo", "demo", "containerruntime:a")
            .await
            .unwrap();
        let b = manager
            .check_and_watch(&parent, "shoot--dev--demo", "demo", "containerruntime:b")
            .await
            .unwrap();

        assert!(a.owned && b.owned);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_namespaces(), 1);
    }

    #[tokio::test]
    async fn not_owned_does_not_start_a_watchdog() {
        let mut checker = MockOwnerChecker::new();
        checker.expect_check().returning(|_, _| Ok(false));
        let manager = manager(checker);

        let check = manager
            .check_and_watch(&CancellationToken::new(), "ns", "shoot", "key")
            .await
            .unwrap();
        assert!(!check.owned);
        assert!(check.lease.token().is_cancelled());
        assert_eq!(manager.active_namespaces(), 0);
    }

    #[tokio::test]
    async fn initial_check_error_is_an_owner_check_error() {
        let mut checker = MockOwnerChecker::new();
        checker
            .expect_check()
            .returning(|_, _| Err(Error::internal("apiserver unavailable")));

        let err = manager(checker)
            .check_and_watch(&CancellationToken::new(), "ns", "shoot", "containerruntime:ns/a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OwnerCheck { ref key, .. } if key == "containerruntime:ns/a"));
    }

    /// Story: another seed takes over mid-operation and the operation is cancelled
    #[tokio::test]
    async fn story_ownership_loss_cancels_registered_tokens() {
        let owned = Arc::new(AtomicBool::new(true));
        let flag = owned.clone();
        let mut checker = MockOwnerChecker::new();
        checker
            .expect_check()
            .returning(move |_, _| Ok(flag.load(Ordering::SeqCst)));
        let manager = manager(checker);

        let check = manager
            .check_and_watch(&CancellationToken::new(), "ns", "shoot", "key")
            .await
            .unwrap();
        assert!(check.owned);
        assert!(!check.lease.token().is_cancelled());

        owned.store(false, Ordering::SeqCst);
        wait_for(check.lease.token()).await;

        // Later passes are refused while ownership stays lost
        let later = manager
            .check_and_watch(&CancellationToken::new(), "ns", "shoot", "other")
            .await
            .unwrap();
        assert!(!later.owned);
    }

    #[tokio::test]
    async fn recheck_errors_cancel_registered_tokens() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let mut checker = MockOwnerChecker::new();
        checker.expect_check().returning(move |_, _| {
            if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(true)
            } else {
                Err(Error::internal("lease lookup failed"))
            }
        });
        let manager = manager(checker);

        let check = manager
            .check_and_watch(&CancellationToken::new(), "ns", "shoot", "key")
            .await
            .unwrap();
        wait_for(check.lease.token()).await;
    }

    /// Story: the watchdog goes away with the last object that needed it
    #[tokio::test]
    async fn story_watchdog_stops_after_last_key() {
        let mut checker = MockOwnerChecker::new();
        checker.expect_check().returning(|_, _| Ok(true));
        let manager = manager(checker);
        let parent = CancellationToken::new();

        let a = manager
            .check_and_watch(&parent, "ns", "shoot", "a")
            .await
            .unwrap();
        let b = manager
            .check_and_watch(&parent, "ns", "shoot", "b")
            .await
            .unwrap();

        drop(a);
        assert_eq!(manager.active_namespaces(), 1);
        drop(b);
        assert_eq!(manager.active_namespaces(), 0);
    }

    /// Story: passes for one namespace that start and finish concurrently
    /// always get a valid answer and leave no watchdog behind
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_concurrent_passes_share_and_release_the_watchdog() {
        let mut checker = MockOwnerChecker::new();
        checker.expect_check().returning(|_, _| Ok(true));
        let manager = Arc::new(manager(checker));
        let parent = CancellationToken::new();

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let manager = manager.clone();
                let parent = parent.clone();
                tokio::spawn(async move {
                    for round in 0..200 {
                        let key = format!("containerruntime:shoot--dev--demo/w{worker}-{round}");
                        let check = manager
                            .check_and_watch(&parent, "shoot--dev--demo", "demo", &key)
                            .await
                            .unwrap();
                        assert!(check.owned);
                        assert!(!check.lease.token().is_cancelled());
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(manager.active_namespaces(), 0);
    }

    #[tokio::test]
    async fn lease_tokens_follow_the_parent() {
        let mut checker = MockOwnerChecker::new();
        checker.expect_check().returning(|_, _| Ok(true));
        let manager = manager(checker);
        let parent = CancellationToken::new();

        let check = manager
            .check_and_watch(&parent, "ns", "shoot", "key")
            .await
            .unwrap();
        parent.cancel();
        assert!(check.lease.token().is_cancelled());
    }
}
