//! Shared serde helpers for configuration types

/// `Duration` as seconds: an integer, or a float for sub-second values
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "ca_core::config::serde_utils::duration_secs")]
///     termination_grace: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Secs {
        Whole(u64),
        Fractional(f64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Secs::deserialize(deserializer)? {
            Secs::Whole(secs) => Ok(Duration::from_secs(secs)),
            Secs::Fractional(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| D::Error::custom(format!("invalid duration: {} seconds", secs))),
        }
    }
}
