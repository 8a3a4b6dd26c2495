//! Redis-backed cache

use super::cache::CacheBackend;
use crate::Result;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;
use tracing::info;

/// Store the member, index it, refresh the index TTL, then drop every
/// member below the `cap` highest scores together with its value.
///
/// KEYS[1] index key, KEYS[2] member key
/// ARGV[1] score, ARGV[2] value, ARGV[3] ttl seconds, ARGV[4] cap
const PUSH_BOUNDED_SCRIPT: &str = r#"
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
redis.call('ZADD', KEYS[1], ARGV[1], KEYS[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
local cap = tonumber(ARGV[4])
local size = redis.call('ZCARD', KEYS[1])
if size <= cap then
  return 0
end
local stale = redis.call('ZRANGE', KEYS[1], 0, size - cap - 1)
for _, member in ipairs(stale) do
  redis.call('DEL', member)
end
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, size - cap - 1)
return #stale
"#;

/// Delete a key; when it is an index, delete its members' values too.
///
/// KEYS[1] key
const DELETE_SCRIPT: &str = r#"
local members = {}
if redis.call('TYPE', KEYS[1]).ok == 'zset' then
  members = redis.call('ZRANGE', KEYS[1], 0, -1)
end
local removed = redis.call('DEL', KEYS[1])
for _, member in ipairs(members) do
  redis.call('DEL', member)
end
return removed
"#;

/// Keys examined per SCAN round trip
const SCAN_COUNT: usize = 200;

pub struct RedisCache {
    conn: MultiplexedConnection,
    push_bounded: Script,
    delete_with_members: Script,
}

impl RedisCache {
    /// Connect and verify the server answers PING
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(url = %redact(url), "Connected to Redis");

        Ok(Self {
            conn,
            push_bounded: Script::new(PUSH_BOUNDED_SCRIPT),
            delete_with_members: Script::new(DELETE_SCRIPT),
        })
    }
}

/// Hide the password component of a redis URL
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// MATCH pattern for keys starting with `prefix`, with glob characters escaped
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait::async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.delete_with_members.key(key).invoke_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = scan_pattern(prefix);

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn push_bounded(
        &self,
        index_key: &str,
        member_key: &str,
        score: f64,
        value: Vec<u8>,
        ttl: Duration,
        cap: usize,
    ) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut invocation = self.push_bounded.prepare_invoke();
        invocation
            .key(index_key)
            .key(member_key)
            .arg(score)
            .arg(value)
            .arg(ttl_secs(ttl))
            .arg(cap);

        let evicted: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(evicted.max(0) as usize)
    }

    async fn range(&self, index_key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(index_key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    /// Redis expires keys itself
    async fn purge_expired(&self, _prefix: Option<&str>) -> Result<usize> {
        Ok(0)
    }
}
