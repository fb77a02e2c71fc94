use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::schema::{BusEventRow, NewBusEvent};

/// A message that can travel over the bus.
///
/// Events are serialized to JSON at publish time and decoded again at
/// dispatch time, so the payload must round-trip through serde. The
/// [`EVENT_NAME`](BusEvent::EVENT_NAME) tag is persisted alongside the
/// payload and is what routes a row to its decoder and handlers.
pub trait BusEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique type tag for this event.
    ///
    /// This MUST be unique for the whole application: it is stored as the
    /// row's `class_name` and used to pick the decoder on the consuming
    /// side. Renaming it strands already-persisted rows of the old name.
    const EVENT_NAME: &'static str;

    /// Opaque 128-bit correlation id carried end-to-end with the event.
    fn user_token(&self) -> Uuid;

    /// First opaque correlation handle, indexed for inspection queries.
    fn search_key1(&self) -> i64;

    /// Second opaque correlation handle, indexed for inspection queries.
    fn search_key2(&self) -> i64;
}

/// Serialize an event into a row ready for insertion.
pub(crate) fn encode<E: BusEvent>(
    event: &E,
    creator_name: &str,
    created_date: DateTime<Utc>,
) -> Result<NewBusEvent, serde_json::Error> {
    let event_json = serde_json::to_string(event)?;
    Ok(NewBusEvent {
        class_name: E::EVENT_NAME.to_owned(),
        event_json,
        user_token: event.user_token(),
        created_date,
        creator_name: creator_name.to_owned(),
        search_key1: event.search_key1(),
        search_key2: event.search_key2(),
    })
}

/// A queue row as returned by the inspection queries.
///
/// Carries the row metadata plus the still-serialized payload; use
/// [`event`](BusEventWithMetadata::event) to decode it as a concrete type.
#[derive(Debug, Clone)]
pub struct BusEventWithMetadata {
    record_id: i64,
    user_token: Uuid,
    created_date: DateTime<Utc>,
    search_key1: i64,
    search_key2: i64,
    event_name: String,
    event_json: String,
}

impl BusEventWithMetadata {
    pub(crate) fn from_row(row: &BusEventRow) -> Self {
        BusEventWithMetadata {
            record_id: row.record_id,
            user_token: row.user_token,
            created_date: row.created_date,
            search_key1: row.search_key1,
            search_key2: row.search_key2,
            event_name: row.class_name.clone(),
            event_json: row.event_json.clone(),
        }
    }

    /// Storage-assigned row identity.
    pub fn record_id(&self) -> i64 {
        self.record_id
    }

    /// Opaque correlation id carried with the event.
    pub fn user_token(&self) -> Uuid {
        self.user_token
    }

    /// When the event was published (UTC).
    pub fn created_date(&self) -> DateTime<Utc> {
        self.created_date
    }

    /// First opaque correlation handle.
    pub fn search_key1(&self) -> i64 {
        self.search_key1
    }

    /// Second opaque correlation handle.
    pub fn search_key2(&self) -> i64 {
        self.search_key2
    }

    /// The event type tag the row carries.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// The serialized payload, as persisted.
    pub fn raw_json(&self) -> &str {
        &self.event_json
    }

    /// Decode the payload as `E`, checking the type tag first.
    pub fn event<E: BusEvent>(&self) -> Result<E, DecodeError> {
        if self.event_name != E::EVENT_NAME {
            return Err(DecodeError::TypeMismatch {
                expected: E::EVENT_NAME,
                actual: self.event_name.clone(),
            });
        }
        Ok(serde_json::from_str(&self.event_json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_ok;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        value: u32,
        token: Uuid,
    }

    impl BusEvent for Ping {
        const EVENT_NAME: &'static str = "test:ping";

        fn user_token(&self) -> Uuid {
            self.token
        }

        fn search_key1(&self) -> i64 {
            1
        }

        fn search_key2(&self) -> i64 {
            2
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong;

    impl BusEvent for Pong {
        const EVENT_NAME: &'static str = "test:pong";

        fn user_token(&self) -> Uuid {
            Uuid::nil()
        }

        fn search_key1(&self) -> i64 {
            0
        }

        fn search_key2(&self) -> i64 {
            0
        }
    }

    #[test]
    fn encode_round_trips_through_the_row() {
        let ping = Ping {
            value: 42,
            token: Uuid::new_v4(),
        };
        let entry = assert_ok!(encode(&ping, "creator", Utc::now()));
        assert_eq!(entry.class_name, "test:ping");
        assert_eq!(entry.user_token, ping.token);
        assert_eq!(entry.search_key1, 1);
        assert_eq!(entry.search_key2, 2);

        let decoded: Ping = assert_ok!(serde_json::from_str(&entry.event_json));
        assert_eq!(decoded, ping);

        // Re-encoding a decoded event yields the same bytes.
        assert_eq!(assert_ok!(serde_json::to_string(&decoded)), entry.event_json);
    }

    #[test]
    fn typed_accessor_checks_the_tag() {
        let ping = Ping {
            value: 7,
            token: Uuid::new_v4(),
        };
        let entry = assert_ok!(encode(&ping, "creator", Utc::now()));
        let row = BusEventRow {
            record_id: 1,
            class_name: entry.class_name,
            event_json: entry.event_json,
            user_token: entry.user_token,
            created_date: entry.created_date,
            creator_name: entry.creator_name,
            processing_owner: None,
            processing_available_date: Some(entry.created_date),
            processing_state: crate::schema::ProcessingState::Available,
            error_count: 0,
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
        };

        let meta = BusEventWithMetadata::from_row(&row);
        assert_eq!(assert_ok!(meta.event::<Ping>()), ping);
        assert!(matches!(
            meta.event::<Pong>(),
            Err(DecodeError::TypeMismatch { .. })
        ));
    }
}
