use std::fmt;
use std::fmt::Write;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::Visitor, Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{0} is not a valid listing Source")]
pub struct ParseSourceError(String);

/// Where a listing was collected from.
/// The real-estate website is a single namespace; every chat community is
/// its own namespace keyed by channel id, so external ids never collide
/// across channels.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Source {
    Krisha,
    Community(i64),
}

/// `Source` is persisted and shipped over the broker as a string, e.g.
/// `krisha` or `community:1002345`.
impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Source::Krisha => write!(f, "krisha"),
            Source::Community(channel_id) => write!(f, "community:{}", channel_id),
        }
    }
}

impl FromStr for Source {
    type Err = ParseSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "krisha" {
            return Ok(Source::Krisha);
        }
        if let Some(channel_id) = s.strip_prefix("community:") {
            if let Ok(channel_id) = channel_id.parse::<i64>() {
                return Ok(Source::Community(channel_id));
            }
        }
        Err(ParseSourceError(s.to_owned()))
    }
}

struct SourceVisitor;

impl<'de> Visitor<'de> for SourceVisitor {
    type Value = Source;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of a listing Source")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Source::from_str(s).map_err(|_| {
            serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self)
        })
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(SourceVisitor)
    }
}

impl Serialize for Source {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A listing as returned by a collector, before it has been deduplicated
/// against the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub source: Source,
    pub external_id: String,
    pub url: Option<String>,
    pub price: Option<i64>,
    pub rooms: Option<i32>,
    pub city: Option<String>,
    pub location: Option<String>,
    pub area_sqm: Option<f32>,
    pub raw_text: String,
    pub enrichment: Option<serde_json::Value>,
}

impl RawListing {
    /// Hash of the normalized user-facing fields. Two scrapes of the same
    /// external id with an equal hash are the same listing as far as users
    /// are concerned; url and enrichment do not participate.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.price.unwrap_or(-1).to_le_bytes());
        hasher.update(self.rooms.unwrap_or(-1).to_le_bytes());
        hasher.update(normalize(self.city.as_deref()).as_bytes());
        hasher.update([0]);
        hasher.update(normalize(self.location.as_deref()).as_bytes());
        hasher.update([0]);
        hasher.update(self.raw_text.trim().as_bytes());

        let digest = hasher.finalize();
        digest.iter().fold(String::new(), |mut acc, byte| {
            let _ = write!(acc, "{:02x}", byte);
            acc
        })
    }
}

fn normalize(field: Option<&str>) -> String {
    field.unwrap_or_default().trim().to_lowercase()
}

/// A deduplicated listing row, as stored and as published on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub source: Source,
    pub external_id: String,
    pub url: Option<String>,
    pub price: Option<i64>,
    pub rooms: Option<i32>,
    pub city: Option<String>,
    pub location: Option<String>,
    pub area_sqm: Option<f32>,
    pub raw_text: String,
    pub enrichment: Option<serde_json::Value>,
    pub first_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawListing {
        RawListing {
            source: Source::Krisha,
            external_id: "123".to_owned(),
            url: Some("https://krisha.kz/a/show/123".to_owned()),
            price: Some(150_000),
            rooms: Some(2),
            city: Some("Almaty".to_owned()),
            location: Some("Abay Ave 10".to_owned()),
            area_sqm: Some(45.0),
            raw_text: "2-room apartment".to_owned(),
            enrichment: None,
        }
    }

    #[test]
    fn source_round_trips_through_strings() {
        assert_eq!("krisha".parse::<Source>().unwrap(), Source::Krisha);
        assert_eq!(
            "community:1002345".parse::<Source>().unwrap(),
            Source::Community(1002345)
        );
        assert_eq!(Source::Community(7).to_string(), "community:7");
        assert!("telegram".parse::<Source>().is_err());
        assert!("community:abc".parse::<Source>().is_err());
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(sample().content_hash(), sample().content_hash());
    }

    #[test]
    fn content_hash_ignores_presentation_noise() {
        let mut noisy = sample();
        noisy.city = Some("  almaty ".to_owned());
        noisy.raw_text = "2-room apartment  ".to_owned();
        noisy.url = Some("https://krisha.kz/a/show/123?utm=abc".to_owned());
        assert_eq!(noisy.content_hash(), sample().content_hash());
    }

    #[test]
    fn content_hash_tracks_user_facing_changes() {
        let mut cheaper = sample();
        cheaper.price = Some(140_000);
        assert_ne!(cheaper.content_hash(), sample().content_hash());

        let mut moved = sample();
        moved.location = Some("Dostyk Ave 1".to_owned());
        assert_ne!(moved.content_hash(), sample().content_hash());
    }

    #[test]
    fn unset_fields_do_not_collide_with_empty_strings() {
        let mut unpriced = sample();
        unpriced.price = None;
        let mut zero_priced = sample();
        zero_priced.price = Some(0);
        assert_ne!(unpriced.content_hash(), zero_priced.content_hash());
    }
}
