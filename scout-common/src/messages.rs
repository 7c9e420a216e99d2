use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::listing::Listing;

/// Topic names shared by both services. Broker delivery is at-least-once
/// and unordered, so every consumer of these payloads must stay idempotent.
pub const CREDENTIAL_REQUESTED_TOPIC: &str = "credential.requested";
pub const CREDENTIAL_ANSWERED_TOPIC: &str = "credential.answered";
pub const LISTING_INGESTED_TOPIC: &str = "listing.ingested";

/// Published by the scraper when a collector's login flow needs a one-time
/// code typed by a human. `request_id` is the correlation token the answer
/// must carry back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequested {
    pub request_id: Uuid,
    pub session_id: String,
    pub hint: String,
}

/// Published by the notifier once the administrator replies with a code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialAnswered {
    pub request_id: Uuid,
    pub code: String,
}

/// Published by the scraper for every listing the store reported as new.
/// Carries the full listing record so the matching stage never has to read
/// the scraper's tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingIngested {
    pub listing: Listing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::Source;
    use chrono::TimeZone;

    #[test]
    fn credential_messages_round_trip() {
        let requested = CredentialRequested {
            request_id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            session_id: "session-1".to_owned(),
            hint: "login code for +7 700 000 00 00".to_owned(),
        };
        let json = serde_json::to_string(&requested).unwrap();
        assert_eq!(
            serde_json::from_str::<CredentialRequested>(&json).unwrap(),
            requested
        );

        let answered = CredentialAnswered {
            request_id: requested.request_id,
            code: "4821".to_owned(),
        };
        let json = serde_json::to_string(&answered).unwrap();
        assert_eq!(
            serde_json::from_str::<CredentialAnswered>(&json).unwrap(),
            answered
        );
    }

    #[test]
    fn listing_ingested_serializes_source_as_string() {
        let message = ListingIngested {
            listing: Listing {
                id: 42,
                source: Source::Community(1002345),
                external_id: "987".to_owned(),
                url: None,
                price: Some(90_000),
                rooms: None,
                city: Some("astana".to_owned()),
                location: None,
                area_sqm: None,
                raw_text: "room available".to_owned(),
                enrichment: None,
                first_seen_at: chrono::Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap(),
            },
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["listing"]["source"], "community:1002345");
        assert_eq!(
            serde_json::from_value::<ListingIngested>(value).unwrap(),
            message
        );
    }
}
