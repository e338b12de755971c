//! In-process store.
//!
//! One mutex guards all namespaces; a condvar wakes blocked pops whenever a
//! value is pushed. Good for tests and single-process deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{End, Store, effective_wait};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    maps: HashMap<String, BTreeMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    values: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Condvar,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Store("memory store mutex poisoned".to_string()))
    }
}

fn take_from(inner: &mut Inner, list: &str, end: End) -> Option<String> {
    let seq = inner.lists.get_mut(list)?;
    let value = match end {
        End::Head => seq.pop_front(),
        End::Tail => seq.pop_back(),
    };
    if seq.is_empty() {
        inner.lists.remove(list);
    }
    value
}

impl Store for MemoryStore {
    fn push(&self, list: &str, value: &str, end: End) -> Result<()> {
        let mut inner = self.lock()?;
        let seq = inner.lists.entry(list.to_string()).or_default();
        match end {
            End::Head => seq.push_front(value.to_string()),
            End::Tail => seq.push_back(value.to_string()),
        }
        drop(inner);
        self.pushed.notify_all();
        Ok(())
    }

    fn pop(&self, list: &str, end: End, wait: Option<Duration>) -> Result<Option<String>> {
        let mut inner = self.lock()?;
        let Some(wait) = effective_wait(wait) else {
            return Ok(take_from(&mut inner, list, end));
        };

        let deadline = Instant::now() + wait;
        loop {
            if let Some(value) = take_from(&mut inner, list, end) {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .pushed
                .wait_timeout(inner, deadline - now)
                .map_err(|_| Error::Store("memory store mutex poisoned".to_string()))?;
            inner = guard;
        }
    }

    fn len(&self, list: &str) -> Result<usize> {
        Ok(self.lock()?.lists.get(list).map_or(0, VecDeque::len))
    }

    fn range(&self, list: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .lists
            .get(list)
            .map(|seq| seq.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn remove(&self, list: &str, value: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        let Some(seq) = inner.lists.get_mut(list) else {
            return Ok(0);
        };
        let before = seq.len();
        seq.retain(|v| v != value);
        let removed = before - seq.len();
        if seq.is_empty() {
            inner.lists.remove(list);
        }
        Ok(removed)
    }

    fn remove_first(&self, list: &str, value: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(seq) = inner.lists.get_mut(list) else {
            return Ok(false);
        };
        let Some(pos) = seq.iter().position(|v| v == value) else {
            return Ok(false);
        };
        seq.remove(pos);
        if seq.is_empty() {
            inner.lists.remove(list);
        }
        Ok(true)
    }

    fn trim(&self, list: &str, max_len: usize) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(seq) = inner.lists.get_mut(list) {
            seq.truncate(max_len);
            if seq.is_empty() {
                inner.lists.remove(list);
            }
        }
        Ok(())
    }

    fn map_get(&self, map: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .maps
            .get(map)
            .and_then(|m| m.get(field).cloned()))
    }

    fn map_set(&self, map: &str, field: &str, value: &str) -> Result<()> {
        self.lock()?
            .maps
            .entry(map.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn map_set_new(&self, map: &str, field: &str, value: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        let m = inner.maps.entry(map.to_string()).or_default();
        if m.contains_key(field) {
            return Ok(false);
        }
        m.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    fn map_delete(&self, map: &str, field: &str) -> Result<bool> {
        Ok(self.map_take(map, field)?.is_some())
    }

    fn map_exists(&self, map: &str, field: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .maps
            .get(map)
            .is_some_and(|m| m.contains_key(field)))
    }

    fn map_keys(&self, map: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .maps
            .get(map)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn map_take(&self, map: &str, field: &str) -> Result<Option<String>> {
        let mut inner = self.lock()?;
        let Some(m) = inner.maps.get_mut(map) else {
            return Ok(None);
        };
        let value = m.remove(field);
        if m.is_empty() {
            inner.maps.remove(map);
        }
        Ok(value)
    }

    fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    fn set_remove(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .sets
            .get_mut(set)
            .is_some_and(|s| s.remove(member)))
    }

    fn set_members(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.values.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
