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

//! Time-bounded storage of unwrapped guardian material. Entries live only
//! in the key-value service and are never written to durable storage or
//! logged.

use std::{sync::Arc, time::Duration};

use crate::{error::Result, kv::KeyValueStore, types::ElectionId};

pub const CREDENTIAL_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// Fallback expiry applied when deleting an entry fails outright.
const CLEAR_FALLBACK_TTL: Duration = Duration::from_secs(60);

/// A guardian's unwrapped private material. Carries no `Debug` impl so it
/// cannot end up in log output by accident.
pub struct GuardianCredentials {
	pub private_key: String,
	pub polynomial: String,
}

#[derive(Clone)]
pub struct CredentialStore {
	kv: Arc<dyn KeyValueStore>,
	ttl: Duration,
}

impl CredentialStore {
	pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
		Self { kv, ttl: CREDENTIAL_TTL }
	}

	pub fn with_ttl(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
		Self { kv, ttl }
	}

	fn private_key_key(election_id: ElectionId, guardian_id: &str) -> String {
		format!("guardian:privatekey:{}:{}", election_id, guardian_id)
	}

	fn polynomial_key(election_id: ElectionId, guardian_id: &str) -> String {
		format!("guardian:polynomial:{}:{}", election_id, guardian_id)
	}

	/// Store a guardian's unwrapped material for the credential window.
	pub fn present(&self, election_id: ElectionId, guardian_id: &str, creds: GuardianCredentials) -> Result<()> {
		self.kv.set(&Self::private_key_key(election_id, guardian_id), &creds.private_key, Some(self.ttl))?;
		self.kv.set(&Self::polynomial_key(election_id, guardian_id), &creds.polynomial, Some(self.ttl))?;
		log::info!("credentials presented for guardian {} of election {}", guardian_id, election_id);
		Ok(())
	}

	/// Both entries, or nothing. A half-expired pair counts as absent.
	pub fn fetch(&self, election_id: ElectionId, guardian_id: &str) -> Result<Option<GuardianCredentials>> {
		let private_key = self.kv.get(&Self::private_key_key(election_id, guardian_id))?;
		let polynomial = self.kv.get(&Self::polynomial_key(election_id, guardian_id))?;
		Ok(match (private_key, polynomial) {
			(Some(private_key), Some(polynomial)) => Some(GuardianCredentials { private_key, polynomial }),
			_ => None,
		})
	}

	pub fn has(&self, election_id: ElectionId, guardian_id: &str) -> Result<bool> {
		Ok(self.fetch(election_id, guardian_id)?.is_some())
	}

	/// Delete both entries. If deletion fails the entries are degraded to a
	/// minimal time-to-live so they expire promptly.
	pub fn clear(&self, election_id: ElectionId, guardian_id: &str) -> Result<()> {
		let keys = [Self::private_key_key(election_id, guardian_id), Self::polynomial_key(election_id, guardian_id)];
		for key in &keys {
			if let Err(e) = self.kv.delete(key) {
				log::warn!("failed to delete credential entry, degrading its expiry: {}", e);
				self.kv.expire(key, CLEAR_FALLBACK_TTL)?;
			}
		}
		log::info!("credentials cleared for guardian {} of election {}", guardian_id, election_id);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::MemoryStore;

	fn store(ttl: Duration) -> CredentialStore {
		CredentialStore::with_ttl(Arc::new(MemoryStore::new()), ttl)
	}

	fn creds() -> GuardianCredentials {
		GuardianCredentials { private_key: "pk".into(), polynomial: "poly".into() }
	}

	#[test]
	fn present_then_fetch_roundtrips() {
		let store = store(CREDENTIAL_TTL);
		assert!(!store.has(1, "g1").unwrap());
		store.present(1, "g1", creds()).unwrap();
		let fetched = store.fetch(1, "g1").unwrap().unwrap();
		assert_eq!(fetched.private_key, "pk");
		assert_eq!(fetched.polynomial, "poly");
		assert!(!store.has(1, "g2").unwrap());
		assert!(!store.has(2, "g1").unwrap());
	}

	#[test]
	fn clear_removes_both_entries() {
		let store = store(CREDENTIAL_TTL);
		store.present(1, "g1", creds()).unwrap();
		store.clear(1, "g1").unwrap();
		assert!(!store.has(1, "g1").unwrap());
		assert!(store.fetch(1, "g1").unwrap().is_none());
	}

	#[test]
	fn entries_expire_with_the_ttl() {
		let store = store(Duration::from_millis(20));
		store.present(1, "g1", creds()).unwrap();
		assert!(store.has(1, "g1").unwrap());
		std::thread::sleep(Duration::from_millis(50));
		assert!(!store.has(1, "g1").unwrap());
	}

	#[test]
	fn a_lone_entry_counts_as_absent() {
		let kv = Arc::new(MemoryStore::new());
		let store = CredentialStore::new(kv.clone());
		kv.set("guardian:privatekey:1:g1", "pk", None).unwrap();
		assert!(!store.has(1, "g1").unwrap());
	}
}
