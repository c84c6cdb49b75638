//! Keyed cache of live player sessions.
//!
//! Entries map credentials to their active session, bounded in size and
//! expired on idleness and absolute age. Relogin goes through
//! [`SessionRegistry::replace`], the single point where a prior sibling
//! session is kicked.

use moka::notification::RemovalCause as MokaCause;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::Credentials;
use crate::event::Event;
use crate::session::PlayerSession;

/// Why an entry left the registry. Governs which side performs cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Idle or absolute TTL elapsed; cleanup runs asynchronously.
    Expired,
    /// Evicted to respect the size bound; cleanup runs asynchronously.
    Size,
    /// Swapped out by [`SessionRegistry::replace`], which already cleaned
    /// the session up; the removal hook must not touch it again.
    Replaced,
    /// Removed via [`SessionRegistry::remove`]; cleanup runs synchronously
    /// on the caller.
    Explicit,
}

impl RemovalCause {
    fn from_moka(cause: MokaCause) -> Self {
        match cause {
            MokaCause::Expired => RemovalCause::Expired,
            MokaCause::Size => RemovalCause::Size,
            MokaCause::Replaced => RemovalCause::Replaced,
            MokaCause::Explicit => RemovalCause::Explicit,
        }
    }
}

pub type RemovalListener = Box<dyn Fn(&Credentials, &Arc<PlayerSession>, RemovalCause) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_entries: u64,
    pub idle_ttl: Duration,
    pub absolute_ttl: Duration,
    /// `None` disables the background maintenance sweep.
    pub sweep_interval: Option<Duration>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            idle_ttl: Duration::from_secs(2 * 60 * 60),
            absolute_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
}

impl RegistryStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

pub struct SessionRegistry {
    cache: Cache<Credentials, Arc<PlayerSession>>,
    counters: Arc<Counters>,
    /// Serializes replace operations so get-then-swap is atomic.
    replace_lock: tokio::sync::Mutex<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    /// Builds the registry and starts its maintenance sweep. Must be called
    /// from within a tokio runtime: expiry-driven cleanup is spawned onto it.
    pub fn new(settings: RegistrySettings) -> Arc<Self> {
        Self::with_removal_listener(settings, None)
    }

    pub fn with_removal_listener(
        settings: RegistrySettings,
        removal_listener: Option<RemovalListener>,
    ) -> Arc<Self> {
        let counters = Arc::new(Counters {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });
        let spawn_handle = tokio::runtime::Handle::try_current().ok();

        let listener_counters = counters.clone();
        let cache = Cache::builder()
            .max_capacity(settings.max_entries)
            .time_to_idle(settings.idle_ttl)
            .time_to_live(settings.absolute_ttl)
            .eviction_listener(move |credentials: Arc<Credentials>, session: Arc<PlayerSession>, cause| {
                let cause = RemovalCause::from_moka(cause);
                if let Some(listener) = &removal_listener {
                    listener(&credentials, &session, cause);
                }
                match cause {
                    RemovalCause::Expired | RemovalCause::Size => {
                        listener_counters.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(session_id = %session.id(), ?cause, "session evicted; cleaning up");
                        match &spawn_handle {
                            Some(handle) => {
                                // Never block the reaper on session teardown.
                                handle.spawn(async move {
                                    cleanup_session(&session).await;
                                });
                            }
                            None => {
                                warn!(
                                    session_id = %session.id(),
                                    "no runtime for async cleanup; session left to expire"
                                );
                            }
                        }
                    }
                    // Replace already cleaned the old session up; a second
                    // close here would race the caller.
                    RemovalCause::Replaced => {
                        debug!(session_id = %session.id(), "entry replaced; no cleanup");
                    }
                    // The explicit path cleans up inline on the caller.
                    RemovalCause::Explicit => {}
                }
            })
            .build();

        let registry = Arc::new(Self {
            cache,
            counters,
            replace_lock: tokio::sync::Mutex::new(()),
            sweeper: Mutex::new(None),
        });

        if let Some(interval) = settings.sweep_interval {
            let cache = registry.cache.clone();
            let sweeper = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    // Surfaces idle expirations even when no traffic touches
                    // the cache.
                    cache.run_pending_tasks();
                }
            });
            *registry
                .sweeper
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sweeper);
        }

        registry
    }

    /// Looks a session up, refreshing the entry's idle timer.
    pub fn get(&self, credentials: &Credentials) -> Option<Arc<PlayerSession>> {
        match self.cache.get(credentials) {
            Some(session) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(session)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, credentials: &Credentials) -> bool {
        self.cache.contains_key(credentials)
    }

    /// Atomically swaps the session registered under `credentials` for
    /// `new_session`, returning the displaced one.
    ///
    /// The displaced session is told to log out while still connected and is
    /// fully cleaned up on this caller before the swap is visible, so two
    /// concurrent logins with equal credentials resolve to exactly one
    /// survivor and no leaked session.
    pub async fn replace(
        &self,
        credentials: Credentials,
        new_session: Arc<PlayerSession>,
    ) -> Option<Arc<PlayerSession>> {
        let _serialized = self.replace_lock.lock().await;
        let old = self.cache.get(&credentials);
        if let Some(old) = &old {
            debug!(
                old_session = %old.id(),
                new_session = %new_session.id(),
                "relogin replaces existing session"
            );
            old.send_to_client(Event::log_out());
            cleanup_session(old).await;
        }
        self.cache.insert(credentials, new_session);
        old
    }

    /// Explicitly removes an entry, cleaning the session up synchronously on
    /// this caller. Returns the removed session.
    pub async fn remove(&self, credentials: &Credentials) -> Option<Arc<PlayerSession>> {
        let removed = self.cache.remove(credentials)?;
        cleanup_session(&removed).await;
        Some(removed)
    }

    /// Runs cache maintenance now (what the background sweep does on its
    /// timer).
    pub fn run_maintenance(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    /// Stops the sweep and closes every remaining session.
    pub async fn close(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        let sessions: Vec<Arc<PlayerSession>> =
            self.cache.iter().map(|(_, session)| session).collect();
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        for session in sessions {
            cleanup_session(&session).await;
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("size", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

/// Closes the session and, through its sender, the underlying connection.
/// Cleanup never fails upwards; problems are logged and swallowed.
async fn cleanup_session(session: &Arc<PlayerSession>) {
    session.close().await;
}
