// Copyright 2021-2022 Parity Technologies (UK) Ltd.
// This file is part of tally-pipeline.

// tally-pipeline is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// tally-pipeline is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
// You should have received a copy of the GNU General Public License
// along with tally-pipeline.  If not, see <http://www.gnu.org/licenses/>.

//! Seam over the key-value service holding ephemeral credentials, phase
//! counters, once-only flags and worker locks. Every mutation used for
//! coordination is atomic on the server (`INCR`, `SET NX EX`, `DEL`).

use std::time::Duration;

use redis::Commands;

use crate::error::Result;

pub trait KeyValueStore: Send + Sync {
	fn get(&self, key: &str) -> Result<Option<String>>;
	/// Set a key, optionally with a time-to-live.
	fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
	/// Set a key only if it does not exist. Returns whether this caller won.
	fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
	fn delete(&self, key: &str) -> Result<()>;
	/// Atomic increment; missing keys start at zero.
	fn incr(&self, key: &str) -> Result<i64>;
	fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// Production store. Connections are created per operation; coordination
/// traffic is a handful of commands per multi-second chunk.
pub struct RedisStore {
	client: redis::Client,
}

impl RedisStore {
	pub fn connect(url: &str) -> Result<Self> {
		Ok(Self { client: redis::Client::open(url)? })
	}

	fn conn(&self) -> Result<redis::Connection> {
		Ok(self.client.get_connection()?)
	}
}

impl KeyValueStore for RedisStore {
	fn get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.conn()?.get(key)?)
	}

	fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
		let mut conn = self.conn()?;
		match ttl {
			Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs() as usize)?,
			None => conn.set::<_, _, ()>(key, value)?,
		}
		Ok(())
	}

	fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
		let reply: Option<String> = redis::cmd("SET")
			.arg(key)
			.arg(value)
			.arg("NX")
			.arg("EX")
			.arg(ttl.as_secs())
			.query(&mut self.conn()?)?;
		Ok(reply.is_some())
	}

	fn delete(&self, key: &str) -> Result<()> {
		self.conn()?.del::<_, ()>(key)?;
		Ok(())
	}

	fn incr(&self, key: &str) -> Result<i64> {
		Ok(self.conn()?.incr(key, 1i64)?)
	}

	fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
		self.conn()?.expire::<_, ()>(key, ttl.as_secs() as usize)?;
		Ok(())
	}
}

#[cfg(any(test, feature = "test_components"))]
pub use self::test_store::MemoryStore;

#[cfg(any(test, feature = "test_components"))]
mod test_store {
	use std::time::{Duration, Instant};

	use hashbrown::HashMap;
	use parking_lot::Mutex;

	use super::KeyValueStore;
	use crate::error::Result;

	/// TTL-aware in-memory stand-in for the key-value service.
	#[derive(Default)]
	pub struct MemoryStore {
		entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
	}

	impl MemoryStore {
		pub fn new() -> Self {
			Default::default()
		}

		/// Remaining time-to-live, if the key exists and carries one.
		pub fn ttl(&self, key: &str) -> Option<Duration> {
			let mut entries = self.entries.lock();
			Self::purge(&mut entries, key);
			entries.get(key).and_then(|(_, dl)| dl.map(|dl| dl.saturating_duration_since(Instant::now())))
		}

		fn purge(entries: &mut HashMap<String, (String, Option<Instant>)>, key: &str) {
			if let Some((_, Some(deadline))) = entries.get(key) {
				if *deadline <= Instant::now() {
					entries.remove(key);
				}
			}
		}
	}

	impl KeyValueStore for MemoryStore {
		fn get(&self, key: &str) -> Result<Option<String>> {
			let mut entries = self.entries.lock();
			Self::purge(&mut entries, key);
			Ok(entries.get(key).map(|(v, _)| v.clone()))
		}

		fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
			let deadline = ttl.map(|t| Instant::now() + t);
			self.entries.lock().insert(key.to_string(), (value.to_string(), deadline));
			Ok(())
		}

		fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
			let mut entries = self.entries.lock();
			Self::purge(&mut entries, key);
			if entries.contains_key(key) {
				return Ok(false);
			}
			entries.insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
			Ok(true)
		}

		fn delete(&self, key: &str) -> Result<()> {
			self.entries.lock().remove(key);
			Ok(())
		}

		fn incr(&self, key: &str) -> Result<i64> {
			let mut entries = self.entries.lock();
			Self::purge(&mut entries, key);
			let entry = entries.entry(key.to_string()).or_insert_with(|| ("0".to_string(), None));
			let next = entry.0.parse::<i64>().unwrap_or(0) + 1;
			entry.0 = next.to_string();
			Ok(next)
		}

		fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
			let mut entries = self.entries.lock();
			if let Some(entry) = entries.get_mut(key) {
				entry.1 = Some(Instant::now() + ttl);
			}
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_if_absent_admits_exactly_one_writer() {
		let store = MemoryStore::new();
		assert!(store.set_if_absent("flag", "a", Duration::from_secs(60)).unwrap());
		assert!(!store.set_if_absent("flag", "b", Duration::from_secs(60)).unwrap());
		assert_eq!(store.get("flag").unwrap().as_deref(), Some("a"));
	}

	#[test]
	fn expired_entries_vanish() {
		let store = MemoryStore::new();
		store.set("gone", "1", Some(Duration::from_millis(10))).unwrap();
		std::thread::sleep(Duration::from_millis(30));
		assert_eq!(store.get("gone").unwrap(), None);
		assert!(store.set_if_absent("gone", "2", Duration::from_secs(60)).unwrap());
	}

	#[test]
	fn incr_starts_at_zero_and_counts() {
		let store = MemoryStore::new();
		assert_eq!(store.incr("n").unwrap(), 1);
		assert_eq!(store.incr("n").unwrap(), 2);
		assert_eq!(store.incr("n").unwrap(), 3);
	}
}
