//! Redis-backed [`KvStore`].
//!
//! Uses a connection manager so reconnects are transparent. Script handles
//! are real SHA1 digests; a flushed script cache surfaces as `NOSCRIPT`,
//! which [`super::ScriptSet`] turns into a reload-and-retry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::{GatewayError, GatewayResult};

use super::KvStore;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `redis://…` and build the shared connection manager.
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url).map_err(|e| GatewayError::Kv(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::Kv(e.to_string()))?;
        Ok(Self { conn })
    }

    fn map_err(e: redis::RedisError) -> GatewayError {
        GatewayError::Kv(e.to_string())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(Self::map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(t) => conn
                .set_ex(key, value, t.as_secs().max(1))
                .await
                .map_err(Self::map_err),
            None => conn.set(key, value).await.map_err(Self::map_err),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.del(key).await.map_err(Self::map_err)?;
        Ok(n > 0)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> GatewayResult<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, delta).await.map_err(Self::map_err)
    }

    async fn hget(&self, key: &str, field: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(Self::map_err)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(Self::map_err)
    }

    async fn hgetall(&self, key: &str) -> GatewayResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(Self::map_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<bool> {
        let mut conn = self.conn.clone();
        conn.expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(Self::map_err)
    }

    async fn script_load(&self, source: &str) -> GatewayResult<String> {
        let mut conn = self.conn.clone();
        redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> GatewayResult<Vec<i64>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len());
        for k in keys {
            cmd.arg(k);
        }
        for a in args {
            cmd.arg(a);
        }
        cmd.query_async(&mut conn).await.map_err(Self::map_err)
    }
}
