//! Per-institution token-bucket rate limiting.
//!
//! Each limiter key (institution type, or an individual institution when
//! configured with its own policy) owns a token bucket: tokens refill
//! continuously at `refill_rate` up to `burst_capacity`, and one token is
//! consumed per admitted fetch. A provider-signaled throttle (HTTP 429)
//! imposes a cooldown that denies every acquisition until it expires,
//! regardless of the local token estimate.
//!
//! Buckets live behind a per-key lock inside a shared map, so acquisitions
//! for unrelated institutions never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::institution::InstitutionType;

/// Token-bucket parameters for one limiter key.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Maximum tokens the bucket can hold.
    pub burst_capacity: f64,
    /// Pause imposed when the provider signals throttling and does not
    /// supply its own `Retry-After`.
    pub cooldown: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            refill_rate: 1.0,
            burst_capacity: 5.0,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl RateLimitPolicy {
    pub fn new(refill_rate: f64, burst_capacity: f64) -> Self {
        Self {
            refill_rate,
            burst_capacity,
            ..Self::default()
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Default policy per institution type. These are configuration inputs:
/// deployments override them wholesale or per key.
#[derive(Debug, Clone)]
pub struct RateLimitProfiles {
    profiles: HashMap<InstitutionType, RateLimitPolicy>,
}

impl Default for RateLimitProfiles {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        // Federal labs tolerate a noticeably higher request rate than
        // universities; international sites get the most conservative profile.
        profiles.insert(
            InstitutionType::FederalLab,
            RateLimitPolicy::new(2.0, 10.0).with_cooldown(Duration::from_secs(30)),
        );
        profiles.insert(
            InstitutionType::UsUniversity,
            RateLimitPolicy::new(1.0, 5.0).with_cooldown(Duration::from_secs(60)),
        );
        profiles.insert(
            InstitutionType::ResearchInstitute,
            RateLimitPolicy::new(1.0, 5.0).with_cooldown(Duration::from_secs(60)),
        );
        profiles.insert(
            InstitutionType::InternationalUniversity,
            RateLimitPolicy::new(0.5, 3.0).with_cooldown(Duration::from_secs(120)),
        );
        Self { profiles }
    }
}

impl RateLimitProfiles {
    pub fn policy_for(&self, institution: InstitutionType) -> RateLimitPolicy {
        self.profiles
            .get(&institution)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&mut self, institution: InstitutionType, policy: RateLimitPolicy) {
        self.profiles.insert(institution, policy);
    }
}

/// Outcome of a token acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    Granted,
    /// No token available; at least one token will have accrued (or the
    /// cooldown will have expired) after `retry_after`.
    Denied { retry_after: Duration },
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquire::Granted)
    }
}

#[derive(Debug)]
struct TokenBucket {
    policy: RateLimitPolicy,
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

impl TokenBucket {
    fn new(policy: RateLimitPolicy) -> Self {
        Self {
            tokens: policy.burst_capacity,
            last_refill: Instant::now(),
            cooldown_until: None,
            policy,
        }
    }

    /// Credit tokens for the time elapsed since the last observation,
    /// clamped to the burst capacity.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * self.policy.refill_rate).min(self.policy.burst_capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, now: Instant) -> Acquire {
        // A server-instructed pause overrides the local token estimate.
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Acquire::Denied {
                    retry_after: until.duration_since(now),
                };
            }
            self.cooldown_until = None;
        }

        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Acquire::Granted
        } else {
            let deficit = 1.0 - self.tokens;
            Acquire::Denied {
                retry_after: Duration::from_secs_f64(deficit / self.policy.refill_rate),
            }
        }
    }
}

/// Token-bucket limiter keyed by institution.
///
/// Safe for concurrent callers sharing a key: the key map is under a
/// read-write lock and each bucket under its own mutex, so unrelated keys
/// never contend and same-key acquisitions are serialized only briefly.
pub struct KeyedRateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    profiles: RateLimitProfiles,
}

impl KeyedRateLimiter {
    pub fn new(profiles: RateLimitProfiles) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            profiles,
        }
    }

    /// Install a per-key policy. An individual institution configured this
    /// way replaces its type default for that key (the override wins, the
    /// limits do not compose).
    pub fn configure_key(&self, key: &str, policy: RateLimitPolicy) {
        let bucket = self.bucket_entry(key, &policy);
        let mut bucket = lock_bucket(&bucket);
        if bucket.policy != policy {
            bucket.policy = policy;
            bucket.tokens = bucket.tokens.min(bucket.policy.burst_capacity);
        }
    }

    /// Acquire one token for `key`. On first use the bucket is created
    /// from the institution type's profile.
    pub fn acquire(&self, key: &str, institution: InstitutionType) -> Acquire {
        let policy = self.profiles.policy_for(institution);
        let bucket = self.bucket_entry(key, &policy);
        let mut bucket = lock_bucket(&bucket);
        bucket.try_acquire(Instant::now())
    }

    /// Impose a provider-instructed pause on `key`. With `pause == None`
    /// the key's configured cooldown period applies.
    pub fn impose_cooldown(&self, key: &str, pause: Option<Duration>) {
        let buckets = self.buckets.read().unwrap_or_else(|p| p.into_inner());
        let Some(bucket) = buckets.get(key).cloned() else {
            return;
        };
        drop(buckets);

        let mut bucket = lock_bucket(&bucket);
        let pause = pause.unwrap_or(bucket.policy.cooldown);
        let until = Instant::now() + pause;
        // Never shorten an already-imposed cooldown.
        if bucket.cooldown_until.is_none_or(|current| until > current) {
            bucket.cooldown_until = Some(until);
            tracing::warn!(key, pause_secs = pause.as_secs(), "Rate limit cooldown imposed");
        }
    }

    /// Current token count for a key, if the bucket exists. Observability only.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let buckets = self.buckets.read().unwrap_or_else(|p| p.into_inner());
        let bucket = buckets.get(key).cloned()?;
        drop(buckets);

        let mut bucket = lock_bucket(&bucket);
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }

    fn bucket_entry(&self, key: &str, policy: &RateLimitPolicy) -> Arc<Mutex<TokenBucket>> {
        {
            let buckets = self.buckets.read().unwrap_or_else(|p| p.into_inner());
            if let Some(bucket) = buckets.get(key) {
                return bucket.clone();
            }
        }
        let mut buckets = self.buckets.write().unwrap_or_else(|p| p.into_inner());
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(policy.clone()))))
            .clone()
    }
}

fn lock_bucket(bucket: &Arc<Mutex<TokenBucket>>) -> std::sync::MutexGuard<'_, TokenBucket> {
    bucket.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned bucket mutex");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(policy: RateLimitPolicy) -> KeyedRateLimiter {
        let limiter = KeyedRateLimiter::new(RateLimitProfiles::default());
        limiter.configure_key("test", policy);
        limiter
    }

    #[test]
    fn burst_is_granted_then_denied() {
        // burst 5, one token per minute: ten rapid acquires -> exactly 5 grants.
        let limiter = limiter_with(RateLimitPolicy::new(1.0 / 60.0, 5.0));

        let mut granted = 0;
        let mut denied = 0;
        for _ in 0..10 {
            match limiter.acquire("test", InstitutionType::UsUniversity) {
                Acquire::Granted => granted += 1,
                Acquire::Denied { retry_after } => {
                    denied += 1;
                    assert!(retry_after > Duration::ZERO);
                }
            }
        }
        assert_eq!(granted, 5);
        assert_eq!(denied, 5);
    }

    #[test]
    fn tokens_never_negative_nor_above_capacity() {
        let limiter = limiter_with(RateLimitPolicy::new(100.0, 3.0));

        for _ in 0..20 {
            let _ = limiter.acquire("test", InstitutionType::UsUniversity);
            let tokens = limiter.tokens("test").unwrap();
            assert!(tokens >= 0.0, "tokens went negative: {tokens}");
            assert!(tokens <= 3.0, "tokens exceeded capacity: {tokens}");
        }
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = limiter_with(RateLimitPolicy::new(50.0, 2.0));

        assert!(limiter.acquire("test", InstitutionType::UsUniversity).is_granted());
        assert!(limiter.acquire("test", InstitutionType::UsUniversity).is_granted());
        assert!(!limiter.acquire("test", InstitutionType::UsUniversity).is_granted());

        // 50 tokens/sec: 100ms is plenty for one token.
        std::thread::sleep(Duration::from_millis(100));
        assert!(limiter.acquire("test", InstitutionType::UsUniversity).is_granted());
    }

    #[test]
    fn cooldown_overrides_available_tokens() {
        let limiter = limiter_with(RateLimitPolicy::new(10.0, 5.0));

        limiter.impose_cooldown("test", Some(Duration::from_secs(300)));
        match limiter.acquire("test", InstitutionType::UsUniversity) {
            Acquire::Denied { retry_after } => {
                assert!(retry_after > Duration::from_secs(290));
            }
            Acquire::Granted => panic!("cooldown must deny regardless of token count"),
        }
    }

    #[test]
    fn cooldown_expires() {
        let limiter = limiter_with(RateLimitPolicy::new(10.0, 5.0));

        limiter.impose_cooldown("test", Some(Duration::from_millis(50)));
        assert!(!limiter.acquire("test", InstitutionType::UsUniversity).is_granted());

        std::thread::sleep(Duration::from_millis(80));
        assert!(limiter.acquire("test", InstitutionType::UsUniversity).is_granted());
    }

    #[test]
    fn cooldown_is_never_shortened() {
        let limiter = limiter_with(RateLimitPolicy::new(10.0, 5.0));

        limiter.impose_cooldown("test", Some(Duration::from_secs(600)));
        limiter.impose_cooldown("test", Some(Duration::from_millis(1)));

        match limiter.acquire("test", InstitutionType::UsUniversity) {
            Acquire::Denied { retry_after } => assert!(retry_after > Duration::from_secs(500)),
            Acquire::Granted => panic!("longer cooldown must stand"),
        }
    }

    #[test]
    fn keys_do_not_share_buckets() {
        let limiter = KeyedRateLimiter::new(RateLimitProfiles::default());
        limiter.configure_key("a", RateLimitPolicy::new(1.0 / 60.0, 1.0));
        limiter.configure_key("b", RateLimitPolicy::new(1.0 / 60.0, 1.0));

        assert!(limiter.acquire("a", InstitutionType::UsUniversity).is_granted());
        assert!(!limiter.acquire("a", InstitutionType::UsUniversity).is_granted());
        assert!(limiter.acquire("b", InstitutionType::UsUniversity).is_granted());
    }

    #[test]
    fn default_profiles_diverge_by_type() {
        let profiles = RateLimitProfiles::default();
        let lab = profiles.policy_for(InstitutionType::FederalLab);
        let intl = profiles.policy_for(InstitutionType::InternationalUniversity);
        assert!(lab.refill_rate > intl.refill_rate);
        assert!(lab.cooldown < intl.cooldown);
    }

    #[test]
    fn concurrent_acquires_never_overdraw() {
        let limiter = Arc::new(limiter_with(RateLimitPolicy::new(1.0 / 60.0, 10.0)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    let mut granted = 0u32;
                    for _ in 0..5 {
                        if limiter.acquire("test", InstitutionType::UsUniversity).is_granted() {
                            granted += 1;
                        }
                    }
                    granted
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 10, "40 concurrent acquires over burst 10 must grant exactly 10");
    }
}
