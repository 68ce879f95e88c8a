use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Caller-chosen alarm identifier. Valid ids are strictly positive.
pub type AlarmId = i32;

/// An alarm as handed in by the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRequest {
    pub id: AlarmId,
    pub title: String,
    pub body: String,
    pub fire_at_millis: i64,
    pub payload: Option<String>,
}

impl AlarmRequest {
    pub fn new(
        id: AlarmId,
        title: impl Into<String>,
        body: impl Into<String>,
        fire_at_millis: i64,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            fire_at_millis,
            payload: None,
        }
    }

    pub fn at(
        id: AlarmId,
        title: impl Into<String>,
        body: impl Into<String>,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self::new(id, title, body, fire_at.timestamp_millis())
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Persisted form of an [`AlarmRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlarmRecord {
    pub id: AlarmId,
    pub title: String,
    pub body: String,
    #[serde(rename = "timestamp")]
    pub fire_at_millis: i64,
    #[serde(
        default,
        serialize_with = "payload_as_string",
        deserialize_with = "empty_payload_as_none"
    )]
    pub payload: Option<String>,
}

impl AlarmRecord {
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.fire_at_millis).single()
    }

    pub fn is_active(&self, now_millis: i64) -> bool {
        self.fire_at_millis > now_millis
    }

    pub fn to_request(&self) -> AlarmRequest {
        AlarmRequest {
            id: self.id,
            title: self.title.clone(),
            body: self.body.clone(),
            fire_at_millis: self.fire_at_millis,
            payload: self.payload.clone(),
        }
    }
}

impl From<AlarmRequest> for AlarmRecord {
    fn from(request: AlarmRequest) -> Self {
        Self {
            id: request.id,
            title: request.title,
            body: request.body,
            fire_at_millis: request.fire_at_millis,
            payload: request.payload,
        }
    }
}

fn payload_as_string<S: Serializer>(payload: &Option<String>, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(payload.as_deref().unwrap_or(""))
}

fn empty_payload_as_none<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let raw: Option<String> = Option::deserialize(de)?;
    Ok(raw.filter(|value| !value.is_empty()))
}

/// Derives a stable, strictly positive alarm id from an external string key.
///
/// FNV-1a over the UTF-8 bytes, folded into 31 bits. Unlike a runtime string
/// hash this gives the same id in every process, so a record written before a
/// reboot can still be found from the original key afterwards.
pub fn alarm_id_for_key(key: &str) -> AlarmId {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let hash = key
        .bytes()
        .fold(OFFSET, |acc, byte| (acc ^ u32::from(byte)).wrapping_mul(PRIME));
    match (hash & 0x7fff_ffff) as AlarmId {
        0 => 1,
        id => id,
    }
}
