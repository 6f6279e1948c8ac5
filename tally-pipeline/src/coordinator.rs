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

//! Exactly-once phase transitions without a central coordinator.
//!
//! Every worker that completes a chunk increments a shared counter; the
//! worker that observes the completing value races a `SET NX` flag, and the
//! sole winner runs the follow-up action. If two workers finish the last
//! chunk simultaneously both may observe the total, but only one wins the
//! flag.

use std::{sync::Arc, time::Duration};

use crate::{error::Result, kv::KeyValueStore, types::ElectionId};

/// Counters and flags outlive any realistic phase by a wide margin.
pub const PHASE_KEY_TTL: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Clone)]
pub struct PhaseCoordinator {
	kv: Arc<dyn KeyValueStore>,
	/// Advisory display tag written into trigger flags.
	owner: String,
}

impl PhaseCoordinator {
	pub fn new(kv: Arc<dyn KeyValueStore>, owner: impl Into<String>) -> Self {
		Self { kv, owner: owner.into() }
	}

	/// Count one finished partial-decryption chunk for `(election, guardian)`.
	/// Returns `true` iff this caller completed the guardian's phase 1 *and*
	/// won the once-only phase-2 trigger.
	pub fn partial_chunk_completed(&self, election_id: ElectionId, guardian_id: &str, total_chunks: u32) -> Result<bool> {
		let counter = format!("partial_progress:{}:{}", election_id, guardian_id);
		let progress = self.advance(&counter)?;
		log::debug!("partial decryption progress for guardian {}: {}/{}", guardian_id, progress, total_chunks);
		if progress < i64::from(total_chunks) {
			return Ok(false);
		}
		let flag = format!("partial_triggered:{}:{}", election_id, guardian_id);
		self.kv.set_if_absent(&flag, &self.owner, PHASE_KEY_TTL)
	}

	/// Count one finished compensated share for the *compensating* guardian.
	/// `total_shares` is `chunks x absent guardians`, the same numeric space
	/// as the phase-2 job record's total. Returns `true` iff this caller won
	/// the once-only completion trigger for the guardian.
	pub fn compensated_chunk_completed(
		&self,
		election_id: ElectionId,
		compensating_guardian_id: &str,
		total_shares: u32,
	) -> Result<bool> {
		let counter = format!("compensated_progress:{}:{}", election_id, compensating_guardian_id);
		let progress = self.advance(&counter)?;
		log::debug!(
			"compensated decryption progress for guardian {}: {}/{}",
			compensating_guardian_id,
			progress,
			total_shares
		);
		if progress < i64::from(total_shares) {
			return Ok(false);
		}
		let flag = format!("compensated_triggered:{}:{}", election_id, compensating_guardian_id);
		self.kv.set_if_absent(&flag, &self.owner, PHASE_KEY_TTL)
	}

	/// Recovery hook: clearing a trigger flag lets an operator restart a
	/// phase whose winner crashed before enqueuing the follow-up work.
	pub fn reset_phase(&self, election_id: ElectionId, guardian_id: &str) -> Result<()> {
		for prefix in ["partial_progress", "partial_triggered", "compensated_progress", "compensated_triggered"] {
			self.kv.delete(&format!("{}:{}:{}", prefix, election_id, guardian_id))?;
		}
		Ok(())
	}

	fn advance(&self, counter: &str) -> Result<i64> {
		let value = self.kv.incr(counter)?;
		self.kv.expire(counter, PHASE_KEY_TTL)?;
		Ok(value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::MemoryStore;

	fn coordinator() -> PhaseCoordinator {
		PhaseCoordinator::new(Arc::new(MemoryStore::new()), "test-worker")
	}

	#[test]
	fn only_the_completing_chunk_triggers() {
		let coord = coordinator();
		assert!(!coord.partial_chunk_completed(1, "g1", 3).unwrap());
		assert!(!coord.partial_chunk_completed(1, "g1", 3).unwrap());
		assert!(coord.partial_chunk_completed(1, "g1", 3).unwrap());
	}

	#[test]
	fn guardians_count_independently() {
		let coord = coordinator();
		assert!(!coord.partial_chunk_completed(1, "g1", 2).unwrap());
		assert!(!coord.partial_chunk_completed(1, "g2", 2).unwrap());
		assert!(coord.partial_chunk_completed(1, "g1", 2).unwrap());
		assert!(coord.partial_chunk_completed(1, "g2", 2).unwrap());
	}

	#[test]
	fn concurrent_last_chunks_elect_one_winner() {
		let coord = Arc::new(coordinator());
		// 19 of 20 chunks already counted
		for _ in 0..19 {
			coord.partial_chunk_completed(9, "g", 20).unwrap();
		}
		// counter over-runs past the total on both threads; exactly one
		// may win the trigger
		let handles: Vec<_> = (0..2)
			.map(|_| {
				let coord = coord.clone();
				std::thread::spawn(move || coord.partial_chunk_completed(9, "g", 20).unwrap())
			})
			.collect();
		let wins: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		assert_eq!(wins.iter().filter(|w| **w).count(), 1);
	}

	#[test]
	fn compensated_totals_live_in_job_record_space() {
		// 2 chunks x 2 absent guardians = 4 shares, not multiplied again
		let coord = coordinator();
		let mut triggered = 0;
		for _ in 0..4 {
			if coord.compensated_chunk_completed(1, "g1", 4).unwrap() {
				triggered += 1;
			}
		}
		assert_eq!(triggered, 1);
	}

	#[test]
	fn reset_allows_a_fresh_run() {
		let coord = coordinator();
		assert!(coord.partial_chunk_completed(1, "g1", 1).unwrap());
		assert!(!coord.partial_chunk_completed(1, "g1", 1).unwrap());
		coord.reset_phase(1, "g1").unwrap();
		assert!(coord.partial_chunk_completed(1, "g1", 1).unwrap());
	}
}
