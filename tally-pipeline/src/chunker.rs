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

//! Deterministic partition of a ballot set into evenly sized chunks.
//!
//! The input is permuted with an OS-entropy RNG before partitioning so that
//! tally chunks never correlate with submission order.

use std::collections::BTreeMap;

use hashbrown::HashSet;
use rand::{rngs::OsRng, seq::SliceRandom};

pub const DEFAULT_CHUNK_SIZE: usize = 200;

/// Split `ballot_ids` into `ceil(N / chunk_size)` chunks, keyed by 1-based
/// chunk number. The first `N mod num_chunks` chunks carry one ballot more
/// than the rest, so chunk sizes never differ by more than one.
pub fn chunk_ballots(mut ballot_ids: Vec<String>, chunk_size: usize) -> BTreeMap<u32, Vec<String>> {
	let mut chunks = BTreeMap::new();
	if ballot_ids.is_empty() || chunk_size == 0 {
		return chunks;
	}
	ballot_ids.shuffle(&mut OsRng);

	let len = ballot_ids.len();
	let num_chunks = (len + chunk_size - 1) / chunk_size;
	let base = len / num_chunks;
	let extra = len % num_chunks;

	let mut rest = ballot_ids;
	for number in 1..=num_chunks as u32 {
		let take = if (number as usize) <= extra { base + 1 } else { base };
		let tail = rest.split_off(take);
		chunks.insert(number, std::mem::replace(&mut rest, tail));
	}
	chunks
}

/// Check that a partition is a faithful rearrangement of the input:
/// every ballot appears exactly once and nothing was invented or dropped.
pub fn verify_partition(original: &[String], chunks: &BTreeMap<u32, Vec<String>>) -> bool {
	let total: usize = chunks.values().map(Vec::len).sum();
	if total != original.len() {
		return false;
	}
	let seen: HashSet<&str> = chunks.values().flatten().map(String::as_str).collect();
	if seen.len() != total {
		return false;
	}
	original.iter().all(|id| seen.contains(id.as_str()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ballots(n: usize) -> Vec<String> {
		(0..n).map(|i| format!("ballot-{}", i)).collect()
	}

	#[test]
	fn partition_is_a_permutation() {
		for n in [1, 7, 199, 200, 201, 1000, 1001] {
			let input = ballots(n);
			let chunks = chunk_ballots(input.clone(), DEFAULT_CHUNK_SIZE);
			assert!(verify_partition(&input, &chunks), "n = {}", n);
		}
	}

	#[test]
	fn chunk_sizes_differ_by_at_most_one() {
		let chunks = chunk_ballots(ballots(1001), DEFAULT_CHUNK_SIZE);
		assert_eq!(chunks.len(), 6);
		let sizes: Vec<usize> = chunks.values().map(Vec::len).collect();
		let max = *sizes.iter().max().unwrap();
		let min = *sizes.iter().min().unwrap();
		assert!(max - min <= 1);
		// the first N mod num_chunks chunks carry the extra ballot
		assert_eq!(sizes, vec![167, 167, 167, 167, 167, 166]);
	}

	#[test]
	fn chunk_numbers_are_dense_and_one_based() {
		let chunks = chunk_ballots(ballots(450), 200);
		let numbers: Vec<u32> = chunks.keys().copied().collect();
		assert_eq!(numbers, vec![1, 2, 3]);
	}

	#[test]
	fn input_is_actually_shuffled() {
		// 200 ballots in one chunk: the odds of the identity permutation
		// surviving three rounds are negligible.
		let input = ballots(200);
		let shuffled = (0..3).any(|_| {
			let chunks = chunk_ballots(input.clone(), 200);
			chunks[&1] != input
		});
		assert!(shuffled);
	}

	#[test]
	fn verification_catches_duplicates_and_losses() {
		let input = ballots(10);
		let mut chunks = chunk_ballots(input.clone(), 5);
		let stolen = chunks.get_mut(&1).unwrap().pop().unwrap();
		assert!(!verify_partition(&input, &chunks));
		let duplicate = chunks[&2][0].clone();
		chunks.get_mut(&2).unwrap().push(duplicate);
		assert!(!verify_partition(&input, &chunks));
		chunks.get_mut(&1).unwrap().push(stolen);
		assert!(!verify_partition(&input, &chunks));
	}

	#[test]
	fn empty_input_yields_no_chunks() {
		assert!(chunk_ballots(Vec::new(), 200).is_empty());
	}
}
