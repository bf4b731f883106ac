//! PostgreSQL-backed [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::OptionalExtension;

use cloak_common::id::{prefix, prefixed_ulid};

use crate::db::pool::DbPool;
use crate::db::schema::{channels, messages, server_members, sessions};
use crate::db::store::{Store, StoreError};
use crate::models::message::{Message, NewMessage};
use crate::models::session::SessionRecord;

/// `Store` backed by PostgreSQL through the shared connection pool.
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_session_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.pool.get().await?;
        let record = diesel_async::RunQueryDsl::get_result(
            sessions::table
                .filter(sessions::token_fingerprint.eq(fingerprint))
                .filter(sessions::expires_at.gt(Utc::now()))
                .select(SessionRecord::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(record)
    }

    async fn is_channel_member(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let member = diesel_async::RunQueryDsl::get_result(
            diesel::select(diesel::dsl::exists(
                channels::table
                    .inner_join(
                        server_members::table
                            .on(server_members::server_id.eq(channels::server_id)),
                    )
                    .filter(channels::id.eq(channel_id))
                    .filter(server_members::user_id.eq(user_id)),
            )),
            &mut conn,
        )
        .await?;
        Ok(member)
    }

    async fn insert_message(
        &self,
        channel_id: &str,
        sender_id: &str,
        ciphertext: &[u8],
    ) -> Result<Message, StoreError> {
        let mut conn = self.pool.get().await?;
        let id = prefixed_ulid(prefix::MESSAGE);
        let message = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(messages::table)
                .values(NewMessage {
                    id: &id,
                    channel_id,
                    sender_id,
                    ciphertext,
                    timestamp: Utc::now(),
                })
                .returning(Message::as_returning()),
            &mut conn,
        )
        .await?;
        Ok(message)
    }

    async fn get_messages(
        &self,
        channel_id: &str,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let mut query = messages::table
            .filter(messages::channel_id.eq(channel_id))
            .order(messages::timestamp.desc())
            .limit(limit)
            .select(Message::as_select())
            .into_boxed();
        if let Some(cursor) = before {
            query = query.filter(messages::timestamp.lt(cursor));
        }
        let page = diesel_async::RunQueryDsl::load(query, &mut conn).await?;
        Ok(page)
    }
}
