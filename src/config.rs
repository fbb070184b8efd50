use std::time::Duration;

/// Engine settings.
///
/// With the `serde` feature this deserializes from any serde format; missing
/// fields fall back to [`EngineConfig::default`] and durations are given in
/// milliseconds:
///
/// ```toml
/// filtered_load = true
/// store_timeout = 2000
/// cache_capacity = 10000
/// invalidation_interval = 1800000
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Load one tenant at a time instead of the full store.
    pub filtered_load: bool,
    /// Default budget for each store call.
    #[cfg_attr(feature = "serde", serde(with = "duration_ms"))]
    pub store_timeout: Duration,
    /// Maximum number of resident tenants; zero means unbounded.
    pub cache_capacity: usize,
    /// Reload a tenant once its cached copy is older than this. Bounds how
    /// long writes made by other engine instances stay invisible.
    #[cfg_attr(feature = "serde", serde(with = "option_duration_ms"))]
    pub invalidation_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            filtered_load: true,
            store_timeout: Duration::from_secs(5),
            cache_capacity: 0,
            invalidation_interval: None,
        }
    }
}

#[cfg(feature = "serde")]
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(millis(value))
    }

    pub(super) fn millis(value: &Duration) -> u64 {
        u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(feature = "serde")]
mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&super::duration_ms::millis(value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|value| value.map(Duration::from_millis))
    }
}
