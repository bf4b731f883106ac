use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::messages;

/// A persisted chat message. The ciphertext is opaque to the server and is
/// stored and forwarded verbatim.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = messages)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub ciphertext: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub channel_id: &'a str,
    pub sender_id: &'a str,
    pub ciphertext: &'a [u8],
    pub timestamp: DateTime<Utc>,
}
