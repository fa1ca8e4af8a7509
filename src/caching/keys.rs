//! # Fingerprint and Cache Key Generation
//!
//! Deterministic identities for inbound events and cache lookups. Two
//! deliveries of the same logical event must produce the same fingerprint;
//! distinct events must not collide — SHA-256 over the platform delivery
//! metadata gives both. Cache keys hash the semantically relevant inputs
//! only (normalized text, image bytes, user id), so formatting noise in a
//! message does not defeat the cache.
//!
//! Every key carries its instance prefix, which keeps the cache namespaces
//! disjoint by construction.

use crate::core::types::InboundEvent;
use sha2::{Digest, Sha256};

/// Fingerprint of an inbound delivery, for deduplication
///
/// Derived from event id, platform timestamp, and source channel. Stable
/// across redeliveries of the same event.
pub fn event_fingerprint(event: &InboundEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.event_id.as_bytes());
    hasher.update(event.timestamp.to_be_bytes());
    hasher.update(event.channel.as_bytes());
    format!("evt:{}", hex::encode(hasher.finalize()))
}

/// Cache key for a text-analysis result
///
/// The text is normalized (trimmed, lowercased, inner whitespace collapsed)
/// before hashing so trivially different phrasings of the same message share
/// an entry.
pub fn nlp_key(text: &str) -> String {
    let normalized = normalize_text(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("nlp:{}", hex::encode(hasher.finalize()))
}

/// Cache key for an image-analysis result, from the image content itself
///
/// Identical uploads hash identically regardless of delivery metadata.
pub fn image_key(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("img:{}", hex::encode(hasher.finalize()))
}

/// Cache key for per-user session data
pub fn session_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EventPayload;

    fn text_event(event_id: &str, timestamp: u64, channel: &str) -> InboundEvent {
        InboundEvent::new(
            event_id.to_string(),
            timestamp,
            channel.to_string(),
            EventPayload::Text {
                user_id: "u-1".to_string(),
                text: "hello".to_string(),
            },
        )
    }

    #[test]
    fn test_fingerprint_stable_across_redelivery() {
        let first = text_event("evt-1", 1000, "room-1");
        let redelivered = text_event("evt-1", 1000, "room-1");
        assert_eq!(event_fingerprint(&first), event_fingerprint(&redelivered));
    }

    #[test]
    fn test_fingerprint_distinguishes_events() {
        let a = text_event("evt-1", 1000, "room-1");
        let b = text_event("evt-2", 1000, "room-1");
        let c = text_event("evt-1", 1001, "room-1");
        let d = text_event("evt-1", 1000, "room-2");

        let fp = event_fingerprint(&a);
        assert_ne!(fp, event_fingerprint(&b));
        assert_ne!(fp, event_fingerprint(&c));
        assert_ne!(fp, event_fingerprint(&d));
    }

    #[test]
    fn test_nlp_key_normalization() {
        assert_eq!(nlp_key("How many calories?"), nlp_key("  how   many CALORIES?  "));
        assert_ne!(nlp_key("how many calories?"), nlp_key("how many carbs?"));
    }

    #[test]
    fn test_image_key_is_content_addressed() {
        let a = image_key(&[0xFF, 0xD8, 0xFF, 0x01]);
        let b = image_key(&[0xFF, 0xD8, 0xFF, 0x01]);
        let c = image_key(&[0xFF, 0xD8, 0xFF, 0x02]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_namespaces_are_disjoint() {
        assert!(event_fingerprint(&text_event("e", 1, "c")).starts_with("evt:"));
        assert!(nlp_key("hi").starts_with("nlp:"));
        assert!(image_key(b"hi").starts_with("img:"));
        assert!(session_key("u-9").starts_with("user:"));
    }
}
