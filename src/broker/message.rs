/// A message held by the in-process broker.
///
/// # Fields
///
/// - `id` - Identifier assigned by the publishing session.
/// - `topic` - The name of the topic this message belongs to.
/// - `payload` - Raw message bytes.
/// - `timestamp` - Unix timestamp in milliseconds taken at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

impl Message {
    pub fn new(id: impl Into<String>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
