//! Mutation rate governor.
//!
//! Limits how often a user may call each mutating endpoint: at most
//! `max_mutations` admitted calls per `(user, endpoint)` per fixed window.
//! A window starts with the first admitted call and is reset lazily by the
//! first call after it expires.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateLimitConfig;
use crate::HoardError;

/// A rate-limited vault operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Upload,
    DeleteFile,
    UpdateFile,
    Share,
    CreateFolder,
    UpdateFolder,
    DeleteFolder,
}

impl Endpoint {
    /// Endpoint name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Upload => "upload",
            Endpoint::DeleteFile => "delete_file",
            Endpoint::UpdateFile => "update_file",
            Endpoint::Share => "share",
            Endpoint::CreateFolder => "create_folder",
            Endpoint::UpdateFolder => "update_folder",
            Endpoint::DeleteFolder => "delete_folder",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Call is admitted.
    Allowed,
    /// Call is rejected due to rate limit.
    Denied {
        /// Time until the current window expires.
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Check if the call is admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }

    /// Turn a denial into [`HoardError::RateLimited`].
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::Denied { retry_after } => Err(HoardError::RateLimited { retry_after }),
        }
    }
}

/// Counter for one `(user, endpoint)` window.
#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window limiter keyed by `(user, endpoint)`.
///
/// ```
/// use hoard::config::RateLimitConfig;
/// use hoard::rate_limit::{Endpoint, MutationGovernor};
///
/// let governor = MutationGovernor::new(&RateLimitConfig::default());
/// assert!(governor.allow(1, Endpoint::Upload));
/// assert!(governor.allow(1, Endpoint::Upload));
/// assert!(!governor.allow(1, Endpoint::Upload));
/// assert!(governor.allow(1, Endpoint::Share));
/// ```
#[derive(Debug)]
pub struct MutationGovernor {
    max_mutations: u32,
    window: Duration,
    windows: Mutex<HashMap<(i64, Endpoint), Window>>,
}

impl MutationGovernor {
    /// Create a governor from configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_limits(config.max_mutations, config.window())
    }

    /// Create a governor with explicit limits.
    pub fn with_limits(max_mutations: u32, window: Duration) -> Self {
        Self {
            max_mutations,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and count one call.
    ///
    /// The expiry check, the limit check and the increment happen under one
    /// lock, so concurrent callers can never exceed the limit.
    pub fn check(&self, user_id: i64, endpoint: Endpoint) -> RateLimitResult {
        self.check_at(user_id, endpoint, Instant::now())
    }

    fn check_at(&self, user_id: i64, endpoint: Endpoint, now: Instant) -> RateLimitResult {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry((user_id, endpoint)).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.max_mutations {
            let retry_after = self.window.saturating_sub(elapsed);
            debug!(user_id, %endpoint, ?retry_after, "Mutation rate limited");
            return RateLimitResult::Denied { retry_after };
        }

        window.count += 1;
        RateLimitResult::Allowed
    }

    /// Check and count one call, returning whether it is admitted.
    pub fn allow(&self, user_id: i64, endpoint: Endpoint) -> bool {
        self.check(user_id, endpoint).is_allowed()
    }

    /// Drop windows that have expired.
    ///
    /// Call this periodically to free memory.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|_, w| now.saturating_duration_since(w.started) < self.window);
    }

    /// Number of tracked windows.
    pub fn tracked(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
