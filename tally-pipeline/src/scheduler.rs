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

//! Fair round-robin publication of pending chunks onto the broker.
//!
//! Combined with the registry's in-flight cap of one, rotating the walk
//! start by one instance per tick interleaves publications 1-for-1 across
//! every active task-instance, regardless of their sizes.

use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use crate::{error::Result, registry::TaskRegistry, types::TaskType};

pub const SCHEDULE_TICK: Duration = Duration::from_millis(100);
pub const TARGET_CHUNKS_PER_CYCLE: usize = 8;
pub const DIAG_INTERVAL: Duration = Duration::from_secs(10);

/// Publication seam. The production implementation is the broker handle;
/// tests record publications instead.
pub trait Publish: Send + Sync {
	fn publish(&self, task_type: TaskType, payload: &[u8]) -> Result<()>;
}

pub struct Scheduler {
	registry: Arc<TaskRegistry>,
	sink: Arc<dyn Publish>,
	cursor: usize,
	target_per_cycle: usize,
}

impl Scheduler {
	pub fn new(registry: Arc<TaskRegistry>, sink: Arc<dyn Publish>) -> Self {
		Self { registry, sink, cursor: 0, target_per_cycle: TARGET_CHUNKS_PER_CYCLE }
	}

	pub fn target_per_cycle(mut self, target: usize) -> Self {
		self.target_per_cycle = target;
		self
	}

	/// One scheduling pass. Walks the active instances starting at the
	/// cursor, publishing at most one chunk per instance and at most
	/// `target_per_cycle` chunks overall. Returns the publication count.
	pub fn tick(&mut self) -> usize {
		let tasks = self.registry.active_tasks();
		if tasks.is_empty() {
			self.cursor = 0;
			return 0;
		}
		let start = self.cursor % tasks.len();
		let mut published = 0;

		for offset in 0..tasks.len() {
			if published >= self.target_per_cycle {
				break;
			}
			let task_id = &tasks[(start + offset) % tasks.len()];
			let chunk = match self.registry.next_publishable(task_id) {
				Some(chunk) => chunk,
				None => continue,
			};
			match self.sink.publish(chunk.task_type, &chunk.payload) {
				Ok(()) => {
					if let Err(e) = self.registry.mark_queued(&chunk.chunk_id) {
						log::error!("published chunk could not be marked queued: {}", e);
					}
					published += 1;
				}
				// the chunk stays Pending and is retried next tick
				Err(e) => log::warn!("failed to publish chunk {}: {}", chunk.chunk_id, e),
			}
		}

		self.cursor = (start + 1) % tasks.len();
		published
	}

	/// Drive ticks until the kill channel fires.
	pub async fn run(mut self, kill: flume::Receiver<()>) {
		log::info!("scheduler started, tick {:?}", SCHEDULE_TICK);
		let mut last_diag = Instant::now();
		loop {
			if kill.try_recv().is_ok() {
				log::info!("scheduler shutting down");
				break;
			}
			smol::Timer::after(SCHEDULE_TICK).await;
			let published = self.tick();
			if published > 0 {
				log::trace!("tick published {} chunks", published);
			}
			if last_diag.elapsed() >= DIAG_INTERVAL {
				last_diag = Instant::now();
				let stats = self.registry.stats();
				log::info!(
					"scheduler: {} active instances; completed (tally/partial/compensated/combine) {:?}; failed {:?}",
					stats.active_instances,
					stats.completed,
					stats.failed,
				);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		error::Error,
		registry::RetryPolicy,
		types::{TallyCreationTask, TaskKey, TaskPayload},
	};
	use parking_lot::Mutex;

	#[derive(Default)]
	struct RecordingSink {
		published: Mutex<Vec<String>>,
		fail: Mutex<bool>,
	}

	impl Publish for RecordingSink {
		fn publish(&self, _ty: TaskType, payload: &[u8]) -> Result<()> {
			if *self.fail.lock() {
				return Err(Error::Msg("broker unreachable".into()));
			}
			let msg: crate::types::ChunkMessage = rmp_serde::from_slice(payload).unwrap();
			self.published.lock().push(msg.chunk_id);
			Ok(())
		}
	}

	fn payloads(n: usize) -> Vec<TaskPayload> {
		(0..n)
			.map(|_| {
				TaskPayload::Tally(TallyCreationTask {
					election_id: 1,
					ballot_ids: vec!["b".into()],
					manifest: serde_json::json!({}),
					context: serde_json::json!({}),
				})
			})
			.collect()
	}

	fn complete(registry: &TaskRegistry, chunk_id: &str) {
		registry.mark_processing(chunk_id).unwrap();
		registry.mark_completed(chunk_id).unwrap();
	}

	#[test]
	fn two_instances_interleave_one_for_one() {
		crate::initialize();
		let registry = Arc::new(TaskRegistry::new(RetryPolicy::default()));
		let sink = Arc::new(RecordingSink::default());
		let mut scheduler = Scheduler::new(registry.clone(), sink.clone());

		let a = registry.register(TaskKey::tally(1), 1, payloads(100)).unwrap();
		let b = registry.register(TaskKey::tally(2), 2, payloads(4)).unwrap();

		// run ticks, completing whatever was published, until B drains
		for _ in 0..64 {
			scheduler.tick();
			for chunk_id in sink.published.lock().drain(..) {
				complete(&registry, &chunk_id);
			}
			if registry.progress(&b).map_or(true, |p| p.completed == 4) {
				break;
			}
		}

		let progress_a = registry.progress(&a).unwrap();
		// with the in-flight cap at 1, A cannot have pulled ahead of B by
		// more than one chunk per tick while B was active
		assert!(progress_a.completed <= 6, "a completed {}", progress_a.completed);
		assert!(registry.progress(&b).is_none() || registry.progress(&b).unwrap().completed == 4);
	}

	#[test]
	fn cap_limits_each_instance_to_one_outstanding_chunk() {
		let registry = Arc::new(TaskRegistry::new(RetryPolicy::default()));
		let sink = Arc::new(RecordingSink::default());
		let mut scheduler = Scheduler::new(registry.clone(), sink.clone());

		registry.register(TaskKey::tally(1), 1, payloads(10)).unwrap();
		registry.register(TaskKey::tally(2), 2, payloads(10)).unwrap();

		// without completions, repeated ticks cannot exceed one chunk per
		// instance
		for _ in 0..5 {
			scheduler.tick();
		}
		assert_eq!(sink.published.lock().len(), 2);
	}

	#[test]
	fn failed_publications_leave_chunks_pending() {
		let registry = Arc::new(TaskRegistry::new(RetryPolicy::default()));
		let sink = Arc::new(RecordingSink::default());
		let mut scheduler = Scheduler::new(registry.clone(), sink.clone());

		let id = registry.register(TaskKey::tally(1), 1, payloads(2)).unwrap();
		*sink.fail.lock() = true;
		assert_eq!(scheduler.tick(), 0);
		assert_eq!(registry.progress(&id).unwrap().pending, 2);

		*sink.fail.lock() = false;
		assert_eq!(scheduler.tick(), 1);
		assert_eq!(registry.progress(&id).unwrap().queued, 1);
	}

	#[test]
	fn a_tick_publishes_at_most_the_target() {
		let registry = Arc::new(TaskRegistry::new(RetryPolicy::default()));
		let sink = Arc::new(RecordingSink::default());
		let mut scheduler = Scheduler::new(registry.clone(), sink.clone()).target_per_cycle(3);

		for e in 0..8 {
			registry.register(TaskKey::tally(e), e, payloads(1)).unwrap();
		}
		assert_eq!(scheduler.tick(), 3);
		assert_eq!(scheduler.tick(), 3);
		assert_eq!(scheduler.tick(), 2);
	}
}
