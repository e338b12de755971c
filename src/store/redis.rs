//! Redis-backed store (feature `redis`).
//!
//! Uses the synchronous client. Each call opens its own connection so that
//! a thread parked in `BLPOP` never holds a connection another thread needs.

use std::time::Duration;

use redis::Commands;

use super::{End, Store, effective_wait};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// Open a client for `redis_url` (e.g. `redis://localhost:6379/0`).
    /// No connection is made until the first call.
    pub fn open(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    fn conn(&self) -> Result<redis::Connection> {
        Ok(self.client.get_connection()?)
    }

    /// Round-trip a PING, for startup health checks.
    pub fn ping(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query(&mut conn)?;
        Ok(())
    }
}

impl Store for RedisStore {
    fn push(&self, list: &str, value: &str, end: End) -> Result<()> {
        let verb = match end {
            End::Head => "LPUSH",
            End::Tail => "RPUSH",
        };
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd(verb).arg(list).arg(value).query(&mut conn)?;
        Ok(())
    }

    fn pop(&self, list: &str, end: End, wait: Option<Duration>) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        match effective_wait(wait) {
            None => {
                let verb = match end {
                    End::Head => "LPOP",
                    End::Tail => "RPOP",
                };
                Ok(redis::cmd(verb).arg(list).query(&mut conn)?)
            }
            Some(wait) => {
                let verb = match end {
                    End::Head => "BLPOP",
                    End::Tail => "BRPOP",
                };
                let popped: Option<(String, String)> = redis::cmd(verb)
                    .arg(list)
                    .arg(wait.as_secs_f64())
                    .query(&mut conn)?;
                Ok(popped.map(|(_, value)| value))
            }
        }
    }

    fn len(&self, list: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("LLEN").arg(list).query(&mut conn)?)
    }

    fn range(&self, list: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("LRANGE").arg(list).arg(0).arg(-1).query(&mut conn)?)
    }

    fn remove(&self, list: &str, value: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("LREM").arg(list).arg(0).arg(value).query(&mut conn)?)
    }

    fn remove_first(&self, list: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("LREM").arg(list).arg(1).arg(value).query(&mut conn)?;
        Ok(removed > 0)
    }

    fn trim(&self, list: &str, max_len: usize) -> Result<()> {
        let mut conn = self.conn()?;
        if max_len == 0 {
            let _: i64 = redis::cmd("DEL").arg(list).query(&mut conn)?;
            return Ok(());
        }
        let _: () = redis::cmd("LTRIM")
            .arg(list)
            .arg(0)
            .arg(max_len as i64 - 1)
            .query(&mut conn)?;
        Ok(())
    }

    fn map_get(&self, map: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("HGET").arg(map).arg(field).query(&mut conn)?)
    }

    fn map_set(&self, map: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("HSET")
            .arg(map)
            .arg(field)
            .arg(value)
            .query(&mut conn)?;
        Ok(())
    }

    fn map_set_new(&self, map: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("HSETNX")
            .arg(map)
            .arg(field)
            .arg(value)
            .query(&mut conn)?)
    }

    fn map_delete(&self, map: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("HDEL").arg(map).arg(field).query(&mut conn)?;
        Ok(removed > 0)
    }

    fn map_exists(&self, map: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("HEXISTS").arg(map).arg(field).query(&mut conn)?)
    }

    fn map_keys(&self, map: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("HKEYS").arg(map).query(&mut conn)?)
    }

    fn map_take(&self, map: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let (value, _): (Option<String>, i64) = redis::pipe()
            .atomic()
            .cmd("HGET")
            .arg(map)
            .arg(field)
            .cmd("HDEL")
            .arg(map)
            .arg(field)
            .query(&mut conn)?;
        Ok(value)
    }

    fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let added: i64 = redis::cmd("SADD").arg(set).arg(member).query(&mut conn)?;
        Ok(added > 0)
    }

    fn set_remove(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("SREM").arg(set).arg(member).query(&mut conn)?;
        Ok(removed > 0)
    }

    fn set_members(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("SMEMBERS").arg(set).query(&mut conn)?)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("GET").arg(key).query(&mut conn)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = redis::cmd("SET").arg(key).arg(value).query(&mut conn)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("DEL").arg(key).query(&mut conn)?;
        Ok(removed > 0)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let iter: redis::Iter<String> = conn.scan_match(format!("{prefix}*"))?;
        let mut keys: Vec<String> = iter.collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
