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

//! In-memory authority over active task-instances and their chunks.
//!
//! The registry is the single writer of chunk and task-instance state.
//! Callers synchronise on per-instance locks; the outer list lock is held
//! only long enough to find an instance.

use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::{
	error::{Error, Result},
	types::{ChunkMessage, ChunkState, JobId, TaskKey, TaskPayload, TaskType},
};

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Hard in-flight cap per task-instance; guarantees interleaving fairness.
pub const MAX_QUEUED_CHUNKS_PER_TASK: usize = 1;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub initial_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self { max_attempts: MAX_RETRY_ATTEMPTS, initial_delay: INITIAL_RETRY_DELAY }
	}
}

impl RetryPolicy {
	/// Backoff before retry number `attempts + 1`: doubles per attempt.
	fn delay_after(&self, attempts: u32) -> Duration {
		self.initial_delay * 2u32.saturating_pow(attempts.saturating_sub(1))
	}
}

/// What became of a reported chunk failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
	/// The chunk returned to `Pending` and becomes publishable again at the
	/// contained instant.
	RetryScheduled(Instant),
	/// Retry budget exhausted, or the failure was not retriable.
	PermanentlyFailed,
}

#[derive(Debug)]
struct Chunk {
	chunk_id: String,
	chunk_number: u32,
	state: ChunkState,
	attempts: u32,
	payload: Vec<u8>,
	last_error: Option<String>,
	permanent: bool,
	retry_after: Option<Instant>,
	created_at: DateTime<Utc>,
	queued_at: Option<DateTime<Utc>>,
	processing_at: Option<DateTime<Utc>>,
	completed_at: Option<DateTime<Utc>>,
}

impl Chunk {
	fn terminal(&self) -> bool {
		match self.state {
			ChunkState::Completed => true,
			ChunkState::Failed => self.permanent,
			_ => false,
		}
	}

	fn in_flight(&self) -> bool {
		matches!(self.state, ChunkState::Queued | ChunkState::Processing)
	}

	fn publishable(&self, now: Instant) -> bool {
		self.state == ChunkState::Pending && self.retry_after.map_or(true, |at| at <= now)
	}
}

struct TaskInstance {
	id: String,
	key: TaskKey,
	job_id: JobId,
	chunks: Vec<Chunk>,
	drained: bool,
}

impl TaskInstance {
	fn in_flight(&self) -> usize {
		self.chunks.iter().filter(|c| c.in_flight()).count()
	}

	fn finished(&self) -> bool {
		if self.drained {
			self.in_flight() == 0
		} else {
			self.chunks.iter().all(Chunk::terminal)
		}
	}

	fn chunk_mut(&mut self, chunk_id: &str) -> Option<&mut Chunk> {
		self.chunks.iter_mut().find(|c| c.chunk_id == chunk_id)
	}
}

/// A chunk handed to the scheduler for publication.
pub struct PublishableChunk {
	pub chunk_id: String,
	pub task_type: TaskType,
	pub payload: Vec<u8>,
}

/// Snapshot of one task-instance's chunk states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
	pub total: usize,
	pub pending: usize,
	pub queued: usize,
	pub processing: usize,
	pub completed: usize,
	pub failed: usize,
}

/// Aggregate counters for periodic diagnostics, indexed by task type.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStats {
	pub active_instances: usize,
	pub completed: [u64; 4],
	pub failed: [u64; 4],
}

pub struct TaskRegistry {
	instances: RwLock<Vec<(String, Arc<Mutex<TaskInstance>>)>>,
	seq: AtomicU64,
	policy: RetryPolicy,
	completed: [AtomicU64; 4],
	failed: [AtomicU64; 4],
}

impl TaskRegistry {
	pub fn new(policy: RetryPolicy) -> Self {
		Self {
			instances: RwLock::new(Vec::new()),
			seq: AtomicU64::new(0),
			policy,
			completed: Default::default(),
			failed: Default::default(),
		}
	}

	/// Create a task-instance with one `Pending` chunk per payload and
	/// return its id. Chunk numbers are 1-based in payload order.
	pub fn register(&self, key: TaskKey, job_id: JobId, payloads: Vec<TaskPayload>) -> Result<String> {
		if payloads.is_empty() {
			return Err(Error::Msg(format!("refusing to register empty {} task", key.task_type)));
		}
		let mut instances = self.instances.write();
		for (_, instance) in instances.iter() {
			let instance = instance.lock();
			if !instance.finished() && instance.key.conflicts_with(&key) {
				return Err(Error::DuplicateTask(instance.id.clone()));
			}
		}

		let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
		let id = key.tag(seq);
		let now = Utc::now();
		let chunks = payloads
			.into_iter()
			.enumerate()
			.map(|(i, task)| {
				let chunk_number = i as u32 + 1;
				let chunk_id = format!("{}/{}", id, chunk_number);
				let message = ChunkMessage {
					task_instance_id: id.clone(),
					chunk_id: chunk_id.clone(),
					chunk_number,
					job_id,
					task,
				};
				let payload = rmp_serde::to_vec(&message)?;
				Ok(Chunk {
					chunk_id,
					chunk_number,
					state: ChunkState::Pending,
					attempts: 0,
					payload,
					last_error: None,
					permanent: false,
					retry_after: None,
					created_at: now,
					queued_at: None,
					processing_at: None,
					completed_at: None,
				})
			})
			.collect::<Result<Vec<_>>>()?;

		log::info!("registered task-instance {} with {} chunks", id, chunks.len());
		let instance = TaskInstance { id: id.clone(), key, job_id, chunks, drained: false };
		instances.push((id.clone(), Arc::new(Mutex::new(instance))));
		Ok(id)
	}

	/// Ids of instances that still have work, in registration order.
	/// Finished instances are pruned on the way.
	pub fn active_tasks(&self) -> Vec<String> {
		let mut instances = self.instances.write();
		instances.retain(|(id, instance)| {
			let done = instance.lock().finished();
			if done {
				log::debug!("task-instance {} finished, removing", id);
			}
			!done
		});
		instances.iter().map(|(id, _)| id.clone()).collect()
	}

	/// The next chunk eligible for publication for `task_id`, respecting the
	/// per-instance in-flight cap and retry backoff. Does not change state;
	/// the scheduler reports the outcome via [`mark_queued`].
	///
	/// [`mark_queued`]: Self::mark_queued
	pub fn next_publishable(&self, task_id: &str) -> Option<PublishableChunk> {
		let instance = self.find(task_id)?;
		let instance = instance.lock();
		if instance.drained || instance.in_flight() >= MAX_QUEUED_CHUNKS_PER_TASK {
			return None;
		}
		let now = Instant::now();
		instance.chunks.iter().find(|c| c.publishable(now)).map(|c| PublishableChunk {
			chunk_id: c.chunk_id.clone(),
			task_type: instance.key.task_type,
			payload: c.payload.clone(),
		})
	}

	pub fn mark_queued(&self, chunk_id: &str) -> Result<()> {
		self.transition(chunk_id, ChunkState::Queued, None)
	}

	/// Record the start of an execution attempt. Returns the attempt number.
	pub fn mark_processing(&self, chunk_id: &str) -> Result<u32> {
		let instance = self.find_by_chunk(chunk_id)?;
		let mut instance = instance.lock();
		let chunk = instance.chunk_mut(chunk_id).ok_or_else(|| Error::UnknownChunk(chunk_id.to_string()))?;
		if chunk.state.rank() >= ChunkState::Processing.rank() {
			return Err(Error::Msg(format!("chunk {} is already {}", chunk_id, chunk.state)));
		}
		chunk.state = ChunkState::Processing;
		chunk.attempts += 1;
		chunk.processing_at = Some(Utc::now());
		Ok(chunk.attempts)
	}

	pub fn mark_completed(&self, chunk_id: &str) -> Result<()> {
		self.transition(chunk_id, ChunkState::Completed, None)
	}

	/// Record a failed attempt. Retriable failures within budget return the
	/// chunk to `Pending` behind an exponential backoff; everything else is
	/// finalized.
	pub fn record_failure(&self, chunk_id: &str, message: &str, retriable: bool) -> Result<FailureDisposition> {
		let instance = self.find_by_chunk(chunk_id)?;
		let mut instance = instance.lock();
		let task_type = instance.key.task_type;
		let chunk = instance.chunk_mut(chunk_id).ok_or_else(|| Error::UnknownChunk(chunk_id.to_string()))?;
		chunk.last_error = Some(message.to_string());

		if retriable && chunk.attempts < self.policy.max_attempts {
			let at = Instant::now() + self.policy.delay_after(chunk.attempts);
			chunk.state = ChunkState::Pending;
			chunk.retry_after = Some(at);
			chunk.queued_at = None;
			chunk.processing_at = None;
			log::warn!(
				"chunk {} failed (attempt {}/{}), retrying in {:?}: {}",
				chunk_id,
				chunk.attempts,
				self.policy.max_attempts,
				self.policy.delay_after(chunk.attempts),
				message
			);
			return Ok(FailureDisposition::RetryScheduled(at));
		}

		chunk.state = ChunkState::Failed;
		chunk.permanent = true;
		chunk.completed_at = Some(Utc::now());
		self.failed[task_type.index()].fetch_add(1, Ordering::Relaxed);
		log::error!("chunk {} permanently failed after {} attempts: {}", chunk_id, chunk.attempts, message);
		Ok(FailureDisposition::PermanentlyFailed)
	}

	pub fn progress(&self, task_id: &str) -> Option<Progress> {
		let instance = self.find(task_id)?;
		let instance = instance.lock();
		let mut progress = Progress { total: instance.chunks.len(), ..Default::default() };
		for chunk in &instance.chunks {
			match chunk.state {
				ChunkState::Pending => progress.pending += 1,
				ChunkState::Queued => progress.queued += 1,
				ChunkState::Processing => progress.processing += 1,
				ChunkState::Completed => progress.completed += 1,
				ChunkState::Failed => progress.failed += 1,
			}
		}
		Some(progress)
	}

	/// Stop publishing chunks for every instance of `job_id`. In-flight
	/// chunks finish; the instances are pruned once they drain.
	pub fn drain_job(&self, job_id: JobId) {
		for (_, instance) in self.instances.read().iter() {
			let mut instance = instance.lock();
			if instance.job_id == job_id && !instance.drained {
				log::info!("draining task-instance {}", instance.id);
				instance.drained = true;
			}
		}
	}

	pub fn stats(&self) -> RegistryStats {
		let mut stats = RegistryStats {
			active_instances: self.instances.read().len(),
			..Default::default()
		};
		for ty in TaskType::ALL {
			stats.completed[ty.index()] = self.completed[ty.index()].load(Ordering::Relaxed);
			stats.failed[ty.index()] = self.failed[ty.index()].load(Ordering::Relaxed);
		}
		stats
	}

	fn transition(&self, chunk_id: &str, state: ChunkState, error: Option<String>) -> Result<()> {
		let instance = self.find_by_chunk(chunk_id)?;
		let mut instance = instance.lock();
		let task_type = instance.key.task_type;
		let chunk = instance.chunk_mut(chunk_id).ok_or_else(|| Error::UnknownChunk(chunk_id.to_string()))?;
		if chunk.state.rank() >= state.rank() {
			return Err(Error::Msg(format!("chunk {} cannot move {} -> {}", chunk_id, chunk.state, state)));
		}
		chunk.state = state;
		chunk.last_error = error;
		match state {
			ChunkState::Queued => chunk.queued_at = Some(Utc::now()),
			ChunkState::Processing => chunk.processing_at = Some(Utc::now()),
			ChunkState::Completed => {
				chunk.completed_at = Some(Utc::now());
				chunk.retry_after = None;
				self.completed[task_type.index()].fetch_add(1, Ordering::Relaxed);
			}
			_ => {}
		}
		Ok(())
	}

	fn find(&self, task_id: &str) -> Option<Arc<Mutex<TaskInstance>>> {
		self.instances.read().iter().find(|(id, _)| id == task_id).map(|(_, i)| i.clone())
	}

	fn find_by_chunk(&self, chunk_id: &str) -> Result<Arc<Mutex<TaskInstance>>> {
		let (task_id, _) = chunk_id.rsplit_once('/').ok_or_else(|| Error::UnknownChunk(chunk_id.to_string()))?;
		self.find(task_id).ok_or_else(|| Error::UnknownTask(task_id.to_string()))
	}
}

impl Default for TaskRegistry {
	fn default() -> Self {
		Self::new(RetryPolicy::default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{TallyCreationTask, TaskPayload};

	fn tally_payloads(n: usize) -> Vec<TaskPayload> {
		(0..n)
			.map(|i| {
				TaskPayload::Tally(TallyCreationTask {
					election_id: 7,
					ballot_ids: vec![format!("b{}", i)],
					manifest: serde_json::json!({}),
					context: serde_json::json!({}),
				})
			})
			.collect()
	}

	fn fast_policy() -> RetryPolicy {
		RetryPolicy { max_attempts: 3, initial_delay: Duration::from_millis(20) }
	}

	#[test]
	fn register_creates_numbered_pending_chunks() {
		let registry = TaskRegistry::default();
		let id = registry.register(TaskKey::tally(7), 1, tally_payloads(3)).unwrap();
		let progress = registry.progress(&id).unwrap();
		assert_eq!(progress, Progress { total: 3, pending: 3, ..Default::default() });
		let chunk = registry.next_publishable(&id).unwrap();
		assert_eq!(chunk.chunk_id, format!("{}/1", id));
		assert_eq!(chunk.task_type, TaskType::Tally);
	}

	#[test]
	fn duplicate_active_tuples_are_rejected() {
		let registry = TaskRegistry::default();
		registry.register(TaskKey::partial(7, "g1"), 1, tally_payloads(2)).unwrap();
		let err = registry.register(TaskKey::partial(7, "g1"), 2, tally_payloads(2)).unwrap_err();
		assert!(matches!(err, Error::DuplicateTask(_)));
		// a different guardian is fine
		registry.register(TaskKey::partial(7, "g2"), 3, tally_payloads(2)).unwrap();
	}

	#[test]
	fn in_flight_cap_holds_at_one() {
		let registry = TaskRegistry::default();
		let id = registry.register(TaskKey::tally(7), 1, tally_payloads(5)).unwrap();
		let first = registry.next_publishable(&id).unwrap();
		registry.mark_queued(&first.chunk_id).unwrap();
		assert!(registry.next_publishable(&id).is_none());
		registry.mark_processing(&first.chunk_id).unwrap();
		assert!(registry.next_publishable(&id).is_none());
		registry.mark_completed(&first.chunk_id).unwrap();
		let second = registry.next_publishable(&id).unwrap();
		assert_eq!(second.chunk_id, format!("{}/2", id));
	}

	#[test]
	fn retry_backoff_doubles_and_then_exhausts() {
		crate::initialize();
		let registry = TaskRegistry::new(fast_policy());
		let id = registry.register(TaskKey::tally(7), 1, tally_payloads(1)).unwrap();
		let chunk_id = format!("{}/1", id);

		for (attempt, expected_delay) in [(1u32, 20u64), (2, 40)] {
			let chunk = registry.next_publishable(&id).unwrap();
			registry.mark_queued(&chunk.chunk_id).unwrap();
			assert_eq!(registry.mark_processing(&chunk.chunk_id).unwrap(), attempt);
			let before = Instant::now();
			match registry.record_failure(&chunk_id, "boom", true).unwrap() {
				FailureDisposition::RetryScheduled(at) => {
					let delay = at.duration_since(before);
					assert!(delay >= Duration::from_millis(expected_delay - 5));
					assert!(delay <= Duration::from_millis(expected_delay + 15));
				}
				other => panic!("expected a retry, got {:?}", other),
			}
			// not publishable until the backoff elapses
			assert!(registry.next_publishable(&id).is_none());
			std::thread::sleep(Duration::from_millis(expected_delay + 10));
			assert!(registry.next_publishable(&id).is_some());
		}

		let chunk = registry.next_publishable(&id).unwrap();
		registry.mark_queued(&chunk.chunk_id).unwrap();
		assert_eq!(registry.mark_processing(&chunk.chunk_id).unwrap(), 3);
		assert_eq!(registry.record_failure(&chunk_id, "boom", true).unwrap(), FailureDisposition::PermanentlyFailed);
		assert!(registry.next_publishable(&id).is_none());
		let progress = registry.progress(&id).unwrap();
		assert_eq!(progress.failed, 1);
		// terminal instance is pruned
		assert!(registry.active_tasks().is_empty());
	}

	#[test]
	fn contract_violations_skip_the_retry_budget() {
		let registry = TaskRegistry::new(fast_policy());
		let id = registry.register(TaskKey::tally(7), 1, tally_payloads(1)).unwrap();
		let chunk = registry.next_publishable(&id).unwrap();
		registry.mark_queued(&chunk.chunk_id).unwrap();
		registry.mark_processing(&chunk.chunk_id).unwrap();
		assert_eq!(
			registry.record_failure(&chunk.chunk_id, "missing field", false).unwrap(),
			FailureDisposition::PermanentlyFailed
		);
	}

	#[test]
	fn drained_instances_stop_publishing_and_prune() {
		let registry = TaskRegistry::default();
		let id = registry.register(TaskKey::tally(7), 42, tally_payloads(3)).unwrap();
		let chunk = registry.next_publishable(&id).unwrap();
		registry.mark_queued(&chunk.chunk_id).unwrap();
		registry.drain_job(42);
		assert!(registry.next_publishable(&id).is_none());
		// the in-flight chunk is still tracked until it lands
		assert_eq!(registry.active_tasks(), vec![id.clone()]);
		registry.mark_processing(&chunk.chunk_id).unwrap();
		registry.mark_completed(&chunk.chunk_id).unwrap();
		assert!(registry.active_tasks().is_empty());
	}

	#[test]
	fn instances_register_in_order() {
		let registry = TaskRegistry::default();
		let a = registry.register(TaskKey::tally(1), 1, tally_payloads(1)).unwrap();
		let b = registry.register(TaskKey::tally(2), 2, tally_payloads(1)).unwrap();
		let c = registry.register(TaskKey::tally(3), 3, tally_payloads(1)).unwrap();
		assert_eq!(registry.active_tasks(), vec![a, b, c]);
	}
}
