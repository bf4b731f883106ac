use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::sessions;

/// A durable session record created at login and looked up by credential
/// fingerprint during the WebSocket handshake.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sessions)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub token_fingerprint: String,
    pub expires_at: DateTime<Utc>,
}
