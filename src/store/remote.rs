use super::{CounterStore, Result, StoreError, StoreOp, QUEUE_MAX_LEN};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;

/// Redis backend. `ConnectionManager` reconnects transparently and is cheap to
/// clone, so each call works on its own handle.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Supports both `redis://` and `rediss://` urls.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(conn) => conn?,
            Err(_) => return Err(StoreError::Timeout),
        };
        Ok(Self { conn, timeout })
    }

    /// Run one round-trip under the configured timeout. Failures are counted
    /// per operation so store trouble shows up on the local `/metrics` page.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(StoreError::Redis(e)),
            Err(_) => Err(StoreError::Timeout),
        };
        if result.is_err() {
            metrics::counter!("gateway_store_errors_total", "op" => op).increment(1);
        }
        result
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(key).arg(delta);
        let count: i64 = self
            .run("incr", async move { cmd.query_async(&mut conn).await })
            .await?;

        if count == delta {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("EXPIRE");
            cmd.arg(key).arg(ttl_secs);
            let _: i64 = self
                .run("expire", async move { cmd.query_async(&mut conn).await })
                .await?;
        }
        Ok(count)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        // SET NX EX is a single command: no window between the check and the write.
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl_secs);
        let reply: Option<String> = self
            .run("set_nx", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("get", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        self.run("mget", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        self.run("set", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self
            .run("del", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let n: i64 = self
            .run("exists", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(n > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("TTL");
        cmd.arg(key);
        let secs: i64 = self
            .run("ttl", async move { cmd.query_async(&mut conn).await })
            .await?;
        // -2: missing, -1: no expiry.
        Ok((secs >= 0).then_some(secs as u64))
    }

    async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZINCRBY");
        cmd.arg(key).arg(delta).arg(member);
        self.run("zincrby", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn ztrim_top(&self, key: &str, keep: usize) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZREMRANGEBYRANK");
        cmd.arg(key).arg(0).arg(-(keep as i64) - 1);
        self.run("zremrangebyrank", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn ztop(&self, key: &str, n: usize) -> Result<Vec<(String, f64)>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(key).arg(0).arg(n as i64 - 1).arg("WITHSCORES");
        self.run("zrevrange", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn list_push_trim(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(cap as i64 - 1)
            .ignore();
        self.run("lpush_trim", async move { pipe.query_async(&mut conn).await })
            .await
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.run("lrange", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn enqueue(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(queue)
            .arg("MAXLEN")
            .arg("~")
            .arg(QUEUE_MAX_LEN)
            .arg("*")
            .arg("payload")
            .arg(payload);
        let _id: String = self
            .run("xadd", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        // Round 1: every write in one pipeline. Only INCRBY replies are kept,
        // in the same order as the Incr ops.
        let mut pipe = redis::pipe();
        let mut incrs: Vec<(&str, i64, u64)> = Vec::new();
        for op in &ops {
            match op {
                StoreOp::Incr {
                    key,
                    delta,
                    ttl_secs,
                } => {
                    pipe.cmd("INCRBY").arg(key).arg(*delta);
                    incrs.push((key, *delta, *ttl_secs));
                }
                StoreOp::ZIncr { key, member, delta } => {
                    pipe.cmd("ZINCRBY").arg(key).arg(*delta).arg(member).ignore();
                }
                StoreOp::ZTrimTop { key, keep } => {
                    pipe.cmd("ZREMRANGEBYRANK")
                        .arg(key)
                        .arg(0)
                        .arg(-(*keep as i64) - 1)
                        .ignore();
                }
                StoreOp::Expire { key, ttl_secs } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*ttl_secs).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        let counts: Vec<i64> = self
            .run("pipeline", async move { pipe.query_async(&mut conn).await })
            .await?;

        // Round 2: expiry only for the windows this batch created.
        let mut expire = redis::pipe();
        let mut pending = 0usize;
        for ((key, delta, ttl_secs), count) in incrs.iter().zip(counts.iter()) {
            if *count == *delta {
                expire.cmd("EXPIRE").arg(*key).arg(*ttl_secs).ignore();
                pending += 1;
            }
        }
        if pending > 0 {
            let mut conn = self.conn.clone();
            let _: () = self
                .run("pipeline_expire", async move { expire.query_async(&mut conn).await })
                .await?;
        }
        Ok(())
    }
}
