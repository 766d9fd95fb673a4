//! Redis metadata index
//!
//! Attribute records are Redis hashes, directory entries are Redis sets.
//! Reading a set with HGETALL (or a hash with SMEMBERS) makes the server
//! answer WRONGTYPE; that reply is turned into a typed lookup result here.

use std::collections::HashMap;

use ::redis::aio::ConnectionManager;
use ::redis::{ErrorKind, RedisError, RedisResult};
use async_trait::async_trait;
use tracing::{debug, info, trace};

use super::{HashLookup, IndexCommand, MetadataIndex, Pipeline, SetLookup};
use crate::error::{FestivusError, Result};
use crate::retry::{retry, RetryPolicy};

/// Redis index over a shared, auto-reconnecting connection
#[derive(Clone)]
pub struct RedisIndex {
    conn: ConnectionManager,
    retry: RetryPolicy,
}

impl RedisIndex {
    /// Connect to the server at `url` (e.g. `redis://localhost:6379/0`)
    pub async fn connect(url: &str, retry_policy: RetryPolicy) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| FestivusError::Config(format!("Invalid index URL {}: {}", url, e)))?;

        let conn = retry(&retry_policy, "connect to redis", || {
            let client = client.clone();
            async move { client.get_connection_manager().await.map_err(map_redis_error) }
        })
        .await?;

        info!("Connected to metadata index at {}", url);
        Ok(Self {
            conn,
            retry: retry_policy,
        })
    }
}

#[async_trait]
impl MetadataIndex for RedisIndex {
    async fn hash_get_all(&self, key: &str) -> Result<HashLookup> {
        trace!("HGETALL {}", key);
        retry(&self.retry, "HGETALL", || {
            let mut conn = self.conn.clone();
            async move {
                let reply: RedisResult<HashMap<String, String>> =
                    ::redis::cmd("HGETALL").arg(key).query_async(&mut conn).await;
                match reply {
                    Ok(fields) if fields.is_empty() => Ok(HashLookup::Absent),
                    Ok(fields) => Ok(HashLookup::Hash(fields)),
                    Err(e) if is_wrong_type(&e) => Ok(HashLookup::Set),
                    Err(e) => Err(map_redis_error(e)),
                }
            }
        })
        .await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        trace!("HSET {} {} {}", key, field, value);
        retry(&self.retry, "HSET", || {
            let mut conn = self.conn.clone();
            async move {
                let reply: RedisResult<i64> = ::redis::cmd("HSET")
                    .arg(key)
                    .arg(field)
                    .arg(value)
                    .query_async(&mut conn)
                    .await;
                reply.map(|_| ()).map_err(|e| map_write_error(key, e))
            }
        })
        .await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        trace!("SADD {} {}", key, member);
        retry(&self.retry, "SADD", || {
            let mut conn = self.conn.clone();
            async move {
                let reply: RedisResult<i64> = ::redis::cmd("SADD")
                    .arg(key)
                    .arg(member)
                    .query_async(&mut conn)
                    .await;
                reply.map(|_| ()).map_err(|e| map_write_error(key, e))
            }
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<SetLookup> {
        trace!("SMEMBERS {}", key);
        retry(&self.retry, "SMEMBERS", || {
            let mut conn = self.conn.clone();
            async move {
                let reply: RedisResult<Vec<String>> =
                    ::redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await;
                match reply {
                    Ok(members) if members.is_empty() => Ok(SetLookup::Absent),
                    Ok(members) => Ok(SetLookup::Members(members)),
                    Err(e) if is_wrong_type(&e) => Ok(SetLookup::Hash),
                    Err(e) => Err(map_redis_error(e)),
                }
            }
        })
        .await
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for command in pipeline.commands() {
            match command {
                IndexCommand::HashSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                }
                IndexCommand::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
            }
        }

        debug!("MULTI/EXEC with {} commands", pipeline.len());
        let pipe = &pipe;
        retry(&self.retry, "pipeline", || {
            let mut conn = self.conn.clone();
            async move {
                let reply: RedisResult<()> = pipe.query_async(&mut conn).await;
                reply.map_err(map_redis_error)
            }
        })
        .await
    }
}

fn is_wrong_type(err: &RedisError) -> bool {
    err.code() == Some("WRONGTYPE")
}

fn map_write_error(key: &str, err: RedisError) -> FestivusError {
    if is_wrong_type(&err) {
        FestivusError::TypeMismatch(key.to_string())
    } else {
        map_redis_error(err)
    }
}

/// Classify a Redis failure; connectivity problems are transient
fn map_redis_error(err: RedisError) -> FestivusError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || matches!(err.kind(), ErrorKind::TryAgain | ErrorKind::BusyLoadingError)
    {
        FestivusError::BackendUnavailable(format!("redis: {}", err))
    } else if err.kind() == ErrorKind::AuthenticationFailed {
        FestivusError::PermissionDenied(format!("redis: {}", err))
    } else {
        FestivusError::Backend(format!("redis: {}", err))
    }
}
