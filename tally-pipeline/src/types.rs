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

//! Core data types shared between the registry, scheduler, broker and
//! workers: task/chunk state machines and the four broker message schemas.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ElectionId = i64;
pub type JobId = i64;

/// One phase of the decryption pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
	Tally,
	PartialDecrypt,
	CompensatedDecrypt,
	Combine,
}

impl TaskType {
	pub const ALL: [TaskType; 4] =
		[TaskType::Tally, TaskType::PartialDecrypt, TaskType::CompensatedDecrypt, TaskType::Combine];

	/// The broker queue (and routing key) this task type is published to.
	pub fn queue(&self) -> &'static str {
		match self {
			TaskType::Tally => "tally.creation",
			TaskType::PartialDecrypt => "partial.decryption",
			TaskType::CompensatedDecrypt => "compensated.decryption",
			TaskType::Combine => "combine.decryption",
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			TaskType::Tally => "tally",
			TaskType::PartialDecrypt => "partial_decryption",
			TaskType::CompensatedDecrypt => "compensated_decryption",
			TaskType::Combine => "combine",
		}
	}

	pub(crate) fn index(&self) -> usize {
		match self {
			TaskType::Tally => 0,
			TaskType::PartialDecrypt => 1,
			TaskType::CompensatedDecrypt => 2,
			TaskType::Combine => 3,
		}
	}
}

impl fmt::Display for TaskType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Lifecycle of one chunk. Transitions are monotonic except
/// `Failed -> Pending`, which the registry applies when scheduling a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
	Pending,
	Queued,
	Processing,
	Completed,
	Failed,
}

impl ChunkState {
	pub(crate) fn rank(&self) -> u8 {
		match self {
			ChunkState::Pending => 0,
			ChunkState::Queued => 1,
			ChunkState::Processing => 2,
			ChunkState::Completed | ChunkState::Failed => 3,
		}
	}
}

impl fmt::Display for ChunkState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let s = match self {
			ChunkState::Pending => "pending",
			ChunkState::Queued => "queued",
			ChunkState::Processing => "processing",
			ChunkState::Completed => "completed",
			ChunkState::Failed => "failed",
		};
		write!(f, "{}", s)
	}
}

/// Durable status of a phase run (`election_jobs.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
	Queued,
	InProgress,
	Completed,
	Failed,
}

impl JobStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobStatus::Queued => "queued",
			JobStatus::InProgress => "in_progress",
			JobStatus::Completed => "completed",
			JobStatus::Failed => "failed",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionKind {
	Partial,
	Compensated,
}

impl DecryptionKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			DecryptionKind::Partial => "partial",
			DecryptionKind::Compensated => "compensated",
		}
	}
}

/// The identifying tuple of a task-instance, minus the monotonic sequence
/// number the registry appends when the instance is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKey {
	pub task_type: TaskType,
	pub election_id: ElectionId,
	pub guardian_id: Option<String>,
	pub source_guardian_id: Option<String>,
	pub target_guardian_id: Option<String>,
}

impl TaskKey {
	pub fn tally(election_id: ElectionId) -> Self {
		Self { task_type: TaskType::Tally, election_id, guardian_id: None, source_guardian_id: None, target_guardian_id: None }
	}

	pub fn partial(election_id: ElectionId, guardian_id: impl Into<String>) -> Self {
		Self {
			task_type: TaskType::PartialDecrypt,
			election_id,
			guardian_id: Some(guardian_id.into()),
			source_guardian_id: None,
			target_guardian_id: None,
		}
	}

	pub fn compensated(
		election_id: ElectionId,
		source_guardian_id: impl Into<String>,
		target_guardian_id: impl Into<String>,
	) -> Self {
		Self {
			task_type: TaskType::CompensatedDecrypt,
			election_id,
			guardian_id: None,
			source_guardian_id: Some(source_guardian_id.into()),
			target_guardian_id: Some(target_guardian_id.into()),
		}
	}

	pub fn combine(election_id: ElectionId) -> Self {
		Self { task_type: TaskType::Combine, election_id, guardian_id: None, source_guardian_id: None, target_guardian_id: None }
	}

	/// The textual tag of a task-instance created from this key.
	/// Tags are compared only for equality.
	pub fn tag(&self, seq: u64) -> String {
		let mut tag = format!("{}:{}", self.task_type, self.election_id);
		if let Some(g) = &self.guardian_id {
			tag.push(':');
			tag.push_str(g);
		}
		if let (Some(s), Some(t)) = (&self.source_guardian_id, &self.target_guardian_id) {
			tag.push(':');
			tag.push_str(s);
			tag.push('>');
			tag.push_str(t);
		}
		tag.push(':');
		tag.push_str(&seq.to_string());
		tag
	}

	/// Whether a new instance of `self` may not coexist with an active
	/// instance of `other`.
	pub fn conflicts_with(&self, other: &TaskKey) -> bool {
		self.task_type == other.task_type
			&& self.election_id == other.election_id
			&& self.guardian_id == other.guardian_id
			&& self.source_guardian_id == other.source_guardian_id
			&& self.target_guardian_id == other.target_guardian_id
	}
}

/// Persistence identity of one tally chunk and everything derived from it.
pub fn election_center_id(election_id: ElectionId, chunk_number: u32) -> String {
	format!("ec_{}_{}", election_id, chunk_number)
}

/// Envelope published to the broker. Describes exactly one chunk and
/// carries every field needed to process it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMessage {
	pub task_instance_id: String,
	pub chunk_id: String,
	pub chunk_number: u32,
	pub job_id: JobId,
	pub task: TaskPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskPayload {
	Tally(TallyCreationTask),
	Partial(PartialDecryptionTask),
	Compensated(CompensatedDecryptionTask),
	Combine(CombineDecryptionTask),
}

impl TaskPayload {
	pub fn task_type(&self) -> TaskType {
		match self {
			TaskPayload::Tally(_) => TaskType::Tally,
			TaskPayload::Partial(_) => TaskType::PartialDecrypt,
			TaskPayload::Compensated(_) => TaskType::CompensatedDecrypt,
			TaskPayload::Combine(_) => TaskType::Combine,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyCreationTask {
	pub election_id: ElectionId,
	pub ballot_ids: Vec<String>,
	/// Election manifest, opaque to the orchestrator.
	pub manifest: Value,
	/// Election public material (joint key, commitments, ...), opaque.
	pub context: Value,
}

/// The guardian's unwrapped private material is deliberately absent here;
/// it is looked up in the credential store at consumption time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialDecryptionTask {
	pub election_id: ElectionId,
	pub guardian_id: String,
	pub election_center_id: String,
	pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensatedDecryptionTask {
	pub election_id: ElectionId,
	pub election_center_id: String,
	pub source_guardian_id: String,
	pub source_sequence_order: i32,
	pub source_public_key: String,
	/// The source guardian's *full* backup bundle. Compensated decryption
	/// looks up the missing guardian's entry inside this bundle, so a
	/// minimal stub is incorrect.
	pub source_key_backup: Value,
	pub source_private_key: String,
	pub source_polynomial: String,
	pub missing_guardian_id: String,
	pub missing_sequence_order: i32,
	pub missing_public_key: String,
	pub missing_key_backup: Value,
	pub quorum: i32,
	/// Total shares of the compensating guardian's phase-2 job
	/// (`chunks x absent guardians`), the numeric space of the
	/// `compensated_progress` counter.
	pub total_shares: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombineDecryptionTask {
	pub election_id: ElectionId,
	pub election_center_id: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn task_tags_encode_the_identifying_tuple() {
		assert_eq!(TaskKey::tally(7).tag(1), "tally:7:1");
		assert_eq!(TaskKey::partial(7, "g1").tag(2), "partial_decryption:7:g1:2");
		assert_eq!(TaskKey::compensated(7, "g1", "g3").tag(3), "compensated_decryption:7:g1>g3:3");
		assert_eq!(TaskKey::combine(7).tag(4), "combine:7:4");
	}

	#[test]
	fn partial_keys_conflict_per_guardian() {
		let a = TaskKey::partial(7, "g1");
		let b = TaskKey::partial(7, "g1");
		let c = TaskKey::partial(7, "g2");
		assert!(a.conflicts_with(&b));
		assert!(!a.conflicts_with(&c));
		assert!(!a.conflicts_with(&TaskKey::tally(7)));
	}

	#[test]
	fn routing_keys_map_one_to_one() {
		let queues: std::collections::HashSet<_> = TaskType::ALL.iter().map(|t| t.queue()).collect();
		assert_eq!(queues.len(), 4);
	}

	#[test]
	fn chunk_messages_roundtrip_messagepack() {
		let msg = ChunkMessage {
			task_instance_id: "tally:7:1".into(),
			chunk_id: "tally:7:1/3".into(),
			chunk_number: 3,
			job_id: 11,
			task: TaskPayload::Tally(TallyCreationTask {
				election_id: 7,
				ballot_ids: vec!["b1".into(), "b2".into()],
				manifest: serde_json::json!({"name": "general"}),
				context: serde_json::json!({"quorum": 2}),
			}),
		};
		let bytes = rmp_serde::to_vec(&msg).unwrap();
		let back: ChunkMessage = rmp_serde::from_slice(&bytes).unwrap();
		assert_eq!(back.chunk_id, msg.chunk_id);
		assert_eq!(back.task.task_type(), TaskType::Tally);
	}
}
