//! Request descriptors and rate limit keys.

use serde::{Deserialize, Serialize};

use crate::error::{BurstguardError, Result};

/// A key that uniquely identifies one independently-limited resource.
///
/// Two keys are equal when both the API key and the route are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    /// The API key of the caller
    pub api_key: String,
    /// The normalized route being accessed (e.g. `/user/:id`)
    pub route: String,
}

impl RateLimitKey {
    /// Create a new rate limit key.
    pub fn new(api_key: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            route: route.into(),
        }
    }

    /// Convert the key to a string representation.
    ///
    /// This is useful for logging and debugging.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.api_key, self.route)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// The unit of input to every rate limiter operation.
///
/// `epoch_seconds` is supplied by the caller rather than read from the wall
/// clock, so decisions are deterministic for a given sequence of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub api_key: String,
    pub route: String,
    pub epoch_seconds: u64,
}

impl RequestDescriptor {
    /// Create a validated descriptor.
    ///
    /// Rejects empty API keys, empty routes and negative timestamps.
    pub fn new(
        api_key: impl Into<String>,
        route: impl Into<String>,
        epoch_seconds: i64,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let route = route.into();

        if api_key.is_empty() {
            return Err(BurstguardError::EmptyApiKey);
        }
        if route.is_empty() {
            return Err(BurstguardError::EmptyRoute);
        }
        let epoch_seconds = u64::try_from(epoch_seconds)
            .map_err(|_| BurstguardError::NegativeEpoch(epoch_seconds))?;

        Ok(Self {
            api_key,
            route,
            epoch_seconds,
        })
    }

    /// Re-check a descriptor that was built without going through [`RequestDescriptor::new`],
    /// e.g. one deserialized from a trace.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(BurstguardError::EmptyApiKey);
        }
        if self.route.is_empty() {
            return Err(BurstguardError::EmptyRoute);
        }
        Ok(())
    }

    /// The key this request is limited under.
    pub fn key(&self) -> RateLimitKey {
        RateLimitKey::new(self.api_key.clone(), self.route.clone())
    }
}
