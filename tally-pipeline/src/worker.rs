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

//! Chunk execution. One delivered message is one chunk: take the two-layer
//! idempotency lock, log the attempt, call the crypto service (with no
//! database connection checked out), persist the artifact, report back to
//! the registry and the phase coordinator, release, and yield.
//!
//! Failures never cross the broker boundary; they end up in worker logs,
//! registry state and job records, nowhere else.

use std::{
	any::Any,
	future::Future,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Arc,
	time::Duration,
};

use async_std::task;
use hashbrown::HashSet;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
	coordinator::PhaseCoordinator,
	credentials::CredentialStore,
	crypto::{
		CombineSharesRequest, CompensatedDecryptionRequest, CryptoClient, PartialDecryptionRequest, TallyRequest,
	},
	database::{models::ElectionCenterModel, queries, Database, Insert},
	error::{Error, Result, WorkerError},
	kv::KeyValueStore,
	registry::{FailureDisposition, TaskRegistry},
	types::{
		election_center_id, ChunkMessage, CombineDecryptionTask, CompensatedDecryptionTask, DecryptionKind,
		PartialDecryptionTask, TallyCreationTask, TaskPayload,
	},
};

/// Authority lock in the key-value store; covers the slowest sane RPC.
pub const WORKER_LOCK_TTL: Duration = Duration::from_secs(300);
/// Pause between chunks so per-chunk allocations can be reclaimed and the
/// resident set stays flat across a phase.
pub const YIELD_PAUSE: Duration = Duration::from_millis(100);

const COMPENSATED_ATTEMPTS: u32 = 3;
const COMPENSATED_BACKOFF: Duration = Duration::from_secs(2);

/// Process-local fast path of the two-layer chunk lock.
#[derive(Default)]
pub struct LocalLocks(Mutex<HashSet<String>>);

impl LocalLocks {
	pub fn try_acquire(&self, key: &str) -> bool {
		self.0.lock().insert(key.to_string())
	}

	pub fn release(&self, key: &str) {
		self.0.lock().remove(key);
	}
}

/// Everything a worker thread needs to execute chunks. Shared by all
/// consumers of all four queues within a process.
pub struct WorkerEnvironment {
	pub db: Database,
	pub kv: Arc<dyn KeyValueStore>,
	pub crypto: CryptoClient,
	pub registry: Arc<TaskRegistry>,
	pub coordinator: PhaseCoordinator,
	pub credentials: CredentialStore,
	locks: LocalLocks,
	worker_id: String,
	yield_pause: Duration,
}

impl WorkerEnvironment {
	pub fn new(
		db: Database,
		kv: Arc<dyn KeyValueStore>,
		crypto: CryptoClient,
		registry: Arc<TaskRegistry>,
	) -> Self {
		let worker_id = worker_id();
		Self {
			coordinator: PhaseCoordinator::new(kv.clone(), worker_id.clone()),
			credentials: CredentialStore::new(kv.clone()),
			db,
			kv,
			crypto,
			registry,
			locks: LocalLocks::default(),
			worker_id,
			yield_pause: YIELD_PAUSE,
		}
	}

	pub fn yield_pause(mut self, pause: Duration) -> Self {
		self.yield_pause = pause;
		self
	}

	pub fn worker_id(&self) -> &str {
		&self.worker_id
	}
}

fn worker_id() -> String {
	let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
	format!("{}:{}", host, std::process::id())
}

/// Natural idempotency key of a chunk.
fn lock_key(message: &ChunkMessage) -> String {
	match &message.task {
		TaskPayload::Tally(t) => format!("tally_{}_chunk_{}", t.election_id, message.chunk_number),
		TaskPayload::Partial(t) => format!("partial_{}_{}_chunk_{}", t.election_id, t.guardian_id, message.chunk_number),
		TaskPayload::Compensated(t) => format!(
			"compensated_{}_{}_{}_chunk_{}",
			t.election_id, t.source_guardian_id, t.missing_guardian_id, message.chunk_number
		),
		TaskPayload::Combine(t) => format!("combine_{}_chunk_{}", t.election_id, message.chunk_number),
	}
}

fn block<F, T>(future: F) -> T
where
	F: Future<Output = T>,
{
	task::block_on(future)
}

/// Entry point invoked by the queue consumers. Never propagates an error;
/// the delivery is settled by the caller regardless.
pub fn handle_delivery(env: &Arc<WorkerEnvironment>, message: ChunkMessage) {
	let key = lock_key(&message);
	if !env.locks.try_acquire(&key) {
		log::debug!("chunk {} already executing in this process", message.chunk_id);
		return;
	}

	match env.kv.set_if_absent(&key, &env.worker_id, WORKER_LOCK_TTL) {
		Ok(true) => {}
		Ok(false) => {
			log::debug!("chunk {} locked by another worker", message.chunk_id);
			env.locks.release(&key);
			return;
		}
		Err(e) => {
			log::error!("could not take chunk lock {}: {}", key, e);
			if let Err(e) = env.registry.record_failure(&message.chunk_id, &e.to_string(), true) {
				log::error!("and could not report it either: {}", e);
			}
			env.locks.release(&key);
			return;
		}
	}

	execute(env, &message);

	if let Err(e) = env.kv.delete(&key) {
		// the TTL will reap it
		log::warn!("failed to release chunk lock {}: {}", key, e);
	}
	env.locks.release(&key);
	drop(message);
	std::thread::sleep(env.yield_pause);
}

fn execute(env: &Arc<WorkerEnvironment>, message: &ChunkMessage) {
	let attempt = match env.registry.mark_processing(&message.chunk_id) {
		Ok(attempt) => attempt,
		// redelivered after the chunk settled; nothing to do
		Err(e) => {
			log::debug!("skipping chunk {}: {}", message.chunk_id, e);
			return;
		}
	};
	log::info!("executing chunk {} (attempt {})", message.chunk_id, attempt);

	let outcome = catch_unwind(AssertUnwindSafe(|| match &message.task {
		TaskPayload::Tally(task) => run_tally(env, message, task),
		TaskPayload::Partial(task) => run_partial(env, message, task),
		TaskPayload::Compensated(task) => run_compensated(env, message, task),
		TaskPayload::Combine(task) => run_combine(env, message, task),
	}))
	.unwrap_or_else(|panic| Err(WorkerError::Transient(extract_panic_info(&panic))));

	match outcome {
		Ok(()) => {
			if let Err(e) = env.registry.mark_completed(&message.chunk_id) {
				log::error!("completed chunk could not be recorded: {}", e);
			}
		}
		Err(err) => {
			let disposition = env
				.registry
				.record_failure(&message.chunk_id, &err.to_string(), err.retriable())
				.unwrap_or(FailureDisposition::PermanentlyFailed);
			if disposition == FailureDisposition::PermanentlyFailed {
				let reason = err.to_string();
				let settled: Result<()> = block(async {
					let mut conn = env.db.conn().await?;
					queries::increment_failed(&mut *conn, message.job_id).await?;
					queries::mark_job_failed(&mut *conn, message.job_id, &reason).await?;
					Ok(())
				});
				if let Err(e) = settled {
					log::error!("could not record permanent failure of {}: {}", message.chunk_id, e);
				}
			}
		}
	}
}

fn run_tally(env: &Arc<WorkerEnvironment>, message: &ChunkMessage, task: &TallyCreationTask) -> Result<(), WorkerError> {
	let ec_id = election_center_id(task.election_id, message.chunk_number);
	let log_id = block(async {
		let mut conn = env.db.conn().await?;
		queries::insert_tally_log(&mut *conn, task.election_id, &ec_id, message.chunk_number as i32).await
	})
	.map_err(WorkerError::from)?;

	let outcome = (|| {
		let ballots = block(async {
			let mut conn = env.db.conn().await?;
			queries::encrypted_ballots(&mut *conn, task.election_id, &task.ballot_ids).await
		})?;
		if ballots.len() != task.ballot_ids.len() {
			return Err(WorkerError::Permanent(format!(
				"chunk references {} ballots but only {} exist",
				task.ballot_ids.len(),
				ballots.len()
			)));
		}

		// no connection is held across this call
		let response = env.crypto.create_encrypted_tally(&TallyRequest {
			election_id: task.election_id,
			chunk_number: message.chunk_number,
			manifest: task.manifest.clone(),
			context: task.context.clone(),
			encrypted_ballots: ballots,
		})?;

		block(async {
			let mut conn = env.db.conn().await?;
			ElectionCenterModel {
				election_center_id: ec_id.clone(),
				election_id: task.election_id,
				chunk_number: message.chunk_number as i32,
				encrypted_tally: Some(response.encrypted_tally),
				election_result: None,
			}
			.insert(&mut conn)
			.await?;
			let (processed, total) = queries::increment_processed(&mut *conn, message.job_id).await?;
			if processed >= total {
				queries::mark_job_completed(&mut *conn, message.job_id).await?;
				log::info!("encrypted tally for election {} complete ({} chunks)", task.election_id, total);
			}
			Ok::<_, Error>(())
		})?;
		Ok(())
	})();

	finish_log(env, LogKind::Tally, log_id, &outcome);
	outcome
}

fn run_partial(
	env: &Arc<WorkerEnvironment>,
	message: &ChunkMessage,
	task: &PartialDecryptionTask,
) -> Result<(), WorkerError> {
	let creds = env
		.credentials
		.fetch(task.election_id, &task.guardian_id)
		.map_err(WorkerError::from)?
		.ok_or_else(|| WorkerError::CredentialsMissing {
			election_id: task.election_id,
			guardian_id: task.guardian_id.clone(),
		})?;

	let log_id = block(async {
		let mut conn = env.db.conn().await?;
		queries::insert_decryption_log(
			&mut *conn,
			task.election_id,
			&task.election_center_id,
			message.chunk_number as i32,
			&task.guardian_id,
			&task.guardian_id,
			DecryptionKind::Partial,
		)
		.await
	})
	.map_err(WorkerError::from)?;

	let outcome = (|| {
		let (election, center, guardian) = block(async {
			let mut conn = env.db.conn().await?;
			let election = queries::election(&mut *conn, task.election_id).await?;
			let center = queries::election_center(&mut *conn, &task.election_center_id).await?;
			let guardian = queries::guardian(&mut *conn, task.election_id, &task.guardian_id).await?;
			Ok::<_, Error>((election, center, guardian))
		})?;
		let encrypted_tally = center
			.encrypted_tally
			.ok_or_else(|| WorkerError::Permanent(format!("{} holds no encrypted tally", task.election_center_id)))?;

		let response = env.crypto.create_partial_decryption(&PartialDecryptionRequest {
			election_id: task.election_id,
			guardian_id: task.guardian_id.clone(),
			sequence_order: guardian.sequence_order,
			guardian_public_key: guardian.guardian_public_key,
			private_key: creds.private_key,
			polynomial: creds.polynomial,
			encrypted_tally,
			manifest: election.manifest,
			context: election.context,
			quorum: election.quorum,
		})?;

		block(async {
			let mut conn = env.db.conn().await?;
			crate::database::models::DecryptionModel {
				election_center_id: task.election_center_id.clone(),
				guardian_id: task.guardian_id.clone(),
				partial_tally_share: response.partial_tally_share,
				ballot_shares: Some(response.ballot_shares),
				guardian_decryption_key: response.guardian_decryption_key,
			}
			.insert(&mut conn)
			.await?;
			let (processed, total) = queries::increment_processed(&mut *conn, message.job_id).await?;
			if processed >= total {
				queries::mark_job_completed(&mut *conn, message.job_id).await?;
			}
			Ok::<_, Error>(())
		})?;
		Ok(())
	})();

	finish_log(env, LogKind::Decryption, log_id, &outcome);

	if outcome.is_ok() {
		match env.coordinator.partial_chunk_completed(task.election_id, &task.guardian_id, task.total_chunks) {
			Ok(true) => {
				log::info!(
					"guardian {} finished partial decryption of election {}, queueing compensation",
					task.guardian_id,
					task.election_id
				);
				let queued = block(crate::pipeline::queue_compensated_phase(
					&env.db,
					&env.credentials,
					&env.registry,
					task.election_id,
					&task.guardian_id,
					Some(env.worker_id()),
				));
				if let Err(e) = queued {
					log::error!(
						"phase-2 trigger won but enqueue failed; operator must reset the phase for guardian {}: {}",
						task.guardian_id,
						e
					);
				}
			}
			Ok(false) => {}
			// the chunk itself succeeded; losing the counter is an
			// operational incident, not a chunk failure
			Err(e) => log::error!("phase coordination failed for chunk {}: {}", message.chunk_id, e),
		}
	}
	outcome
}

fn run_compensated(
	env: &Arc<WorkerEnvironment>,
	message: &ChunkMessage,
	task: &CompensatedDecryptionTask,
) -> Result<(), WorkerError> {
	if backup_entry(&task.source_key_backup, &task.missing_guardian_id).is_none() {
		return Err(WorkerError::MissingBackup {
			holder: task.source_guardian_id.clone(),
			target: task.missing_guardian_id.clone(),
		});
	}

	let log_id = block(async {
		let mut conn = env.db.conn().await?;
		queries::insert_decryption_log(
			&mut *conn,
			task.election_id,
			&task.election_center_id,
			message.chunk_number as i32,
			&task.missing_guardian_id,
			&task.source_guardian_id,
			DecryptionKind::Compensated,
		)
		.await
	})
	.map_err(WorkerError::from)?;

	let outcome = (|| {
		let (election, center) = block(async {
			let mut conn = env.db.conn().await?;
			let election = queries::election(&mut *conn, task.election_id).await?;
			let center = queries::election_center(&mut *conn, &task.election_center_id).await?;
			Ok::<_, Error>((election, center))
		})?;
		let encrypted_tally = center
			.encrypted_tally
			.ok_or_else(|| WorkerError::Permanent(format!("{} holds no encrypted tally", task.election_center_id)))?;

		let request = CompensatedDecryptionRequest {
			election_id: task.election_id,
			source_guardian_id: task.source_guardian_id.clone(),
			source_sequence_order: task.source_sequence_order,
			source_public_key: task.source_public_key.clone(),
			source_key_backup: task.source_key_backup.clone(),
			source_private_key: task.source_private_key.clone(),
			source_polynomial: task.source_polynomial.clone(),
			missing_guardian_id: task.missing_guardian_id.clone(),
			missing_sequence_order: task.missing_sequence_order,
			missing_public_key: task.missing_public_key.clone(),
			missing_key_backup: task.missing_key_backup.clone(),
			encrypted_tally,
			manifest: election.manifest,
			context: election.context,
			quorum: task.quorum,
		};

		// compensated decryption owns its retry budget; exhaustion is final
		let mut attempt = 0;
		let response = loop {
			attempt += 1;
			match env.crypto.create_compensated_decryption(&request) {
				Ok(response) => break response,
				Err(e) if attempt < COMPENSATED_ATTEMPTS => {
					log::warn!(
						"compensated decryption attempt {}/{} for {} failed: {}",
						attempt,
						COMPENSATED_ATTEMPTS,
						task.election_center_id,
						e
					);
					std::thread::sleep(COMPENSATED_BACKOFF * attempt);
				}
				Err(e) => {
					return Err(WorkerError::Permanent(format!(
						"compensated decryption failed after {} attempts: {}",
						attempt, e
					)))
				}
			}
		};

		block(async {
			let mut conn = env.db.conn().await?;
			crate::database::models::CompensatedDecryptionModel {
				election_center_id: task.election_center_id.clone(),
				compensating_guardian_id: task.source_guardian_id.clone(),
				missing_guardian_id: task.missing_guardian_id.clone(),
				compensated_tally_share: response.compensated_tally_share,
				compensated_ballot_share: Some(response.compensated_ballot_share),
			}
			.insert(&mut conn)
			.await?;
			let (processed, total) = queries::increment_processed(&mut *conn, message.job_id).await?;
			if processed >= total {
				queries::mark_job_completed(&mut *conn, message.job_id).await?;
			}
			Ok::<_, Error>(())
		})?;
		Ok(())
	})();

	finish_log(env, LogKind::Decryption, log_id, &outcome);

	if outcome.is_ok() {
		match env.coordinator.compensated_chunk_completed(task.election_id, &task.source_guardian_id, task.total_shares) {
			Ok(true) => {
				log::info!(
					"guardian {} finished all compensated shares for election {}",
					task.source_guardian_id,
					task.election_id
				);
				let finished: Result<()> = block(async {
					env.credentials.clear(task.election_id, &task.source_guardian_id)?;
					let mut conn = env.db.conn().await?;
					queries::set_guardian_decrypted(&mut *conn, task.election_id, &task.source_guardian_id).await?;
					Ok(())
				});
				if let Err(e) = finished {
					log::error!("could not finish guardian {}: {}", task.source_guardian_id, e);
				}
			}
			Ok(false) => {}
			Err(e) => log::error!("phase coordination failed for chunk {}: {}", message.chunk_id, e),
		}
	}
	outcome
}

fn run_combine(
	env: &Arc<WorkerEnvironment>,
	message: &ChunkMessage,
	task: &CombineDecryptionTask,
) -> Result<(), WorkerError> {
	let log_id = block(async {
		let mut conn = env.db.conn().await?;
		queries::insert_combine_log(&mut *conn, task.election_id, &task.election_center_id, message.chunk_number as i32)
			.await
	})
	.map_err(WorkerError::from)?;

	let outcome = (|| {
		let (election, center, partial, compensated) = block(async {
			let mut conn = env.db.conn().await?;
			let election = queries::election(&mut *conn, task.election_id).await?;
			let center = queries::election_center(&mut *conn, &task.election_center_id).await?;
			let partial = queries::partial_shares(&mut *conn, &task.election_center_id).await?;
			let compensated = queries::compensated_shares(&mut *conn, &task.election_center_id).await?;
			Ok::<_, Error>((election, center, partial, compensated))
		})?;
		let encrypted_tally = center
			.encrypted_tally
			.ok_or_else(|| WorkerError::Permanent(format!("{} holds no encrypted tally", task.election_center_id)))?;

		let covered: hashbrown::HashSet<&str> = partial
			.iter()
			.map(|p| p.guardian_id.as_str())
			.chain(compensated.iter().map(|c| c.missing_guardian_id.as_str()))
			.collect();
		if covered.len() < election.number_of_guardians as usize {
			return Err(WorkerError::Permanent(format!(
				"{} has shares for {} of {} guardians",
				task.election_center_id,
				covered.len(),
				election.number_of_guardians
			)));
		}

		let response = env.crypto.combine_decryption_shares(&CombineSharesRequest {
			election_id: task.election_id,
			encrypted_tally,
			partial_shares: partial.iter().map(share_json).collect(),
			compensated_shares: compensated.iter().map(compensated_share_json).collect(),
			manifest: election.manifest,
			context: election.context,
			quorum: election.quorum,
		})?;

		block(async {
			let mut conn = env.db.conn().await?;
			queries::set_election_result(&mut *conn, &task.election_center_id, &response.results).await?;
			let (processed, total) = queries::increment_processed(&mut *conn, message.job_id).await?;
			if processed >= total {
				queries::mark_job_completed(&mut *conn, message.job_id).await?;
				log::info!("combine phase for election {} complete", task.election_id);
			}
			Ok::<_, Error>(())
		})?;
		Ok(())
	})();

	finish_log(env, LogKind::Combine, log_id, &outcome);
	outcome
}

fn share_json(share: &crate::database::models::DecryptionModel) -> Value {
	serde_json::json!({
		"guardian_id": share.guardian_id,
		"partial_tally_share": share.partial_tally_share,
		"ballot_shares": share.ballot_shares,
		"guardian_decryption_key": share.guardian_decryption_key,
	})
}

fn compensated_share_json(share: &crate::database::models::CompensatedDecryptionModel) -> Value {
	serde_json::json!({
		"compensating_guardian_id": share.compensating_guardian_id,
		"missing_guardian_id": share.missing_guardian_id,
		"compensated_tally_share": share.compensated_tally_share,
		"compensated_ballot_share": share.compensated_ballot_share,
	})
}

/// Which worker-log table a row lives in.
enum LogKind {
	Tally,
	Decryption,
	Combine,
}

fn finish_log(env: &Arc<WorkerEnvironment>, kind: LogKind, log_id: i64, outcome: &Result<(), WorkerError>) {
	let error = outcome.as_ref().err().map(|e| e.to_string());
	let completed = outcome.is_ok();
	let written: Result<u64> = block(async {
		let mut conn = env.db.conn().await?;
		match kind {
			LogKind::Tally => queries::finish_tally_log(&mut *conn, log_id, completed, error.as_deref()).await,
			LogKind::Decryption => queries::finish_decryption_log(&mut *conn, log_id, completed, error.as_deref()).await,
			LogKind::Combine => queries::finish_combine_log(&mut *conn, log_id, completed, error.as_deref()).await,
		}
	});
	if let Err(e) = written {
		log::error!("could not finalize worker log row {}: {}", log_id, e);
	}
}

fn backup_entry<'a>(bundle: &'a Value, guardian_id: &str) -> Option<&'a Value> {
	bundle.get("backups").and_then(|b| b.get(guardian_id)).or_else(|| bundle.get(guardian_id))
}

fn extract_panic_info(info: &(dyn Any + Send + 'static)) -> String {
	if let Some(x) = info.downcast_ref::<&'static str>() {
		format!("chunk execution panicked: {}", x)
	} else if let Some(x) = info.downcast_ref::<String>() {
		format!("chunk execution panicked: {}", x)
	} else {
		"chunk execution panicked".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn local_locks_admit_one_holder() {
		let locks = LocalLocks::default();
		assert!(locks.try_acquire("tally_1_chunk_1"));
		assert!(!locks.try_acquire("tally_1_chunk_1"));
		assert!(locks.try_acquire("tally_1_chunk_2"));
		locks.release("tally_1_chunk_1");
		assert!(locks.try_acquire("tally_1_chunk_1"));
	}

	#[test]
	fn lock_keys_are_the_chunks_natural_keys() {
		let msg = ChunkMessage {
			task_instance_id: "tally:3:1".into(),
			chunk_id: "tally:3:1/2".into(),
			chunk_number: 2,
			job_id: 1,
			task: TaskPayload::Tally(TallyCreationTask {
				election_id: 3,
				ballot_ids: vec![],
				manifest: serde_json::json!({}),
				context: serde_json::json!({}),
			}),
		};
		assert_eq!(lock_key(&msg), "tally_3_chunk_2");
	}

	#[test]
	fn backup_lookup_understands_both_bundle_shapes() {
		let nested = serde_json::json!({ "backups": { "g2": { "coordinate": "x" } } });
		let flat = serde_json::json!({ "g2": { "coordinate": "x" } });
		assert!(backup_entry(&nested, "g2").is_some());
		assert!(backup_entry(&flat, "g2").is_some());
		assert!(backup_entry(&nested, "g3").is_none());
	}

	#[test]
	fn transient_and_permanent_failures_classify() {
		assert!(WorkerError::Transient("timeout".into()).retriable());
		assert!(WorkerError::CredentialsMissing { election_id: 1, guardian_id: "g".into() }.retriable());
		assert!(!WorkerError::Permanent("bad payload".into()).retriable());
		assert!(!WorkerError::MissingBackup { holder: "g1".into(), target: "g2".into() }.retriable());
	}
}
