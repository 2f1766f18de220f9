//! Tolerant decoding of collaborator response bodies.
//!
//! Upstream services wrap lists in whatever envelope they like: a bare array,
//! `{"data": [...]}`, `{"results": [...]}` or `{"data": {"results": [...]}}`.
//! Everything that can vary is decoded here so call sites deal only in items.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct Results<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Bare(Vec<T>),
    DataResults { data: Results<T> },
    Data { data: Vec<T> },
    Results(Results<T>),
}

impl<T> Envelope<T> {
    pub fn into_items(self) -> Vec<T> {
        match self {
            Envelope::Bare(items) | Envelope::Data { data: items } => items,
            Envelope::DataResults { data } | Envelope::Results(data) => data.results,
        }
    }
}

/// A single object, optionally wrapped in `{"data": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Single<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Single<T> {
    pub fn into_inner(self) -> T {
        match self {
            Single::Wrapped { data } | Single::Bare(data) => data,
        }
    }
}

/// Decodes a list body item by item. Unknown envelopes decode to an empty
/// list; items that fail to decode are skipped with a warning.
pub fn decode_items<T: DeserializeOwned>(source: &str, body: &[u8]) -> Vec<T> {
    let raw: Vec<Value> = match serde_json::from_slice::<Envelope<Value>>(body) {
        Ok(envelope) => envelope.into_items(),
        Err(e) => {
            warn!(source, error = %e, "unrecognised response envelope; treating as empty");
            return Vec::new();
        }
    };

    raw.into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(source, error = %e, item = %item, "skipping malformed item");
                None
            }
        })
        .collect()
}

/// Decodes a single object body, bare or wrapped in `data`.
pub fn decode_single<T: DeserializeOwned>(body: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice::<Single<T>>(body).map(Single::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    #[rstest]
    #[case(r#"[{"id":1},{"id":2}]"#)]
    #[case(r#"{"data":[{"id":1},{"id":2}]}"#)]
    #[case(r#"{"results":[{"id":1},{"id":2}]}"#)]
    #[case(r#"{"data":{"results":[{"id":1},{"id":2}]}}"#)]
    fn unwraps_every_known_envelope(#[case] body: &str) {
        let items: Vec<Item> = decode_items("test", body.as_bytes());
        assert_eq!(items, vec![Item { id: 1 }, Item { id: 2 }]);
    }

    #[rstest]
    #[case("")]
    #[case("null")]
    #[case(r#"{"data":null}"#)]
    #[case(r#"{"message":"no slots"}"#)]
    #[case("<html>502</html>")]
    fn degenerate_bodies_are_empty(#[case] body: &str) {
        let items: Vec<Item> = decode_items("test", body.as_bytes());
        assert!(items.is_empty());
    }

    #[test]
    fn malformed_items_are_skipped_not_fatal() {
        let items: Vec<Item> = decode_items("test", br#"[{"id":1},{"id":"x"},{"id":3}]"#);
        assert_eq!(items, vec![Item { id: 1 }, Item { id: 3 }]);
    }

    #[test]
    fn single_object_may_be_wrapped() {
        let wrapped: Item = decode_single(br#"{"data":{"id":9}}"#).unwrap();
        let bare: Item = decode_single(br#"{"id":9}"#).unwrap();
        assert_eq!(wrapped, bare);
    }
}
