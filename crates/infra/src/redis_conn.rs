//! Shared async Redis connection with reconnect-on-failure.

use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, RedisError};
use tokio::sync::Mutex;

use conduit_stream::TransportError;

/// A lazily-established multiplexed connection.
///
/// Commands share one connection. When a command fails at the connection level
/// the connection is dropped and the next command dials a fresh one.
pub struct RedisConnection {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisConnection {
    pub fn open(redis_url: impl AsRef<str>) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::connection(e.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    /// Current connection, dialling if none is held.
    pub async fn connection(&self) -> Result<MultiplexedConnection, TransportError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the held connection so the next command reconnects.
    pub async fn reset(&self) {
        *self.conn.lock().await = None;
    }

    /// Dial a dedicated connection (for blocking commands such as
    /// `XREADGROUP BLOCK`, which would stall every other user of a shared one).
    pub async fn dedicated(&self) -> Result<MultiplexedConnection, TransportError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)
    }

    pub async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, TransportError> {
        let mut conn = self.connection().await?;
        let result = cmd.query_async(&mut conn).await;
        self.settle(result).await
    }

    pub async fn query_pipe<T: FromRedisValue>(
        &self,
        pipe: &redis::Pipeline,
    ) -> Result<T, TransportError> {
        let mut conn = self.connection().await?;
        let result = pipe.query_async(&mut conn).await;
        self.settle(result).await
    }

    pub async fn invoke<T: FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, TransportError> {
        let mut conn = self.connection().await?;
        let result = invocation.invoke_async(&mut conn).await;
        self.settle(result).await
    }

    async fn settle<T>(&self, result: Result<T, RedisError>) -> Result<T, TransportError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = map_redis_error(e);
                if err.is_connection() {
                    tracing::warn!(error = %err, "redis connection lost, will reconnect");
                    self.reset().await;
                }
                Err(err)
            }
        }
    }
}

/// Classify a Redis error as connection-level or command-level.
pub fn map_redis_error(e: RedisError) -> TransportError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        TransportError::connection(e.to_string())
    } else {
        TransportError::command(e.to_string())
    }
}
