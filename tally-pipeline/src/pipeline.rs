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

//! Wiring and operator surface. `PipelineBuilder` assembles the database,
//! key-value store, broker, registry, scheduler thread and worker pools;
//! the resulting [`Pipeline`] exposes the phase entry points that compute
//! chunk sets and register task-instances.

use std::sync::{atomic::AtomicBool, Arc};

use async_std::task;
use serde::Deserialize;
use serde_json::Value;

use crate::{
	broker::{BrokerHandle, WorkerPool},
	chunker,
	coordinator::PhaseCoordinator,
	credentials::{CredentialStore, GuardianCredentials},
	crypto::{CryptoClient, CryptoConfig},
	database::{self, models::JobRecord, queries, Database, DatabaseConfig},
	error::{Error, Result},
	kv::{KeyValueStore, RedisStore},
	registry::TaskRegistry,
	scheduler::{Publish, Scheduler},
	types::{
		CombineDecryptionTask, CompensatedDecryptionTask, ElectionId, JobId, PartialDecryptionTask, TallyCreationTask,
		TaskKey, TaskPayload, TaskType,
	},
	worker::{self, WorkerEnvironment},
};

fn default_amqp_addr() -> String {
	"amqp://localhost:5672".to_string()
}

fn default_redis_url() -> String {
	"redis://127.0.0.1:6379".to_string()
}

fn default_workers_per_queue() -> usize {
	std::cmp::min(num_cpus::get(), 4)
}

const fn default_prefetch() -> u16 {
	1
}

const fn default_chunk_size() -> usize {
	chunker::DEFAULT_CHUNK_SIZE
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ControlConfig {
	/// Number of consumer threads per queue.
	#[serde(default = "default_workers_per_queue")]
	pub workers_per_queue: usize,
	/// Unacknowledged deliveries per consumer.
	#[serde(default = "default_prefetch")]
	pub prefetch: u16,
	/// Target ballots per tally chunk.
	#[serde(default = "default_chunk_size")]
	pub chunk_size: usize,
}

impl Default for ControlConfig {
	fn default() -> Self {
		Self {
			workers_per_queue: default_workers_per_queue(),
			prefetch: default_prefetch(),
			chunk_size: default_chunk_size(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
	#[serde(default = "default_amqp_addr")]
	pub amqp_addr: String,
	#[serde(default = "default_redis_url")]
	pub redis_url: String,
	pub database: DatabaseConfig,
	#[serde(default)]
	pub crypto: CryptoConfig,
	#[serde(default)]
	pub control: ControlConfig,
}

pub struct PipelineBuilder {
	config: PipelineConfig,
}

impl PipelineBuilder {
	pub fn new(config: PipelineConfig) -> Self {
		Self { config }
	}

	pub fn chunk_size(mut self, size: usize) -> Self {
		self.config.control.chunk_size = size;
		self
	}

	pub fn workers_per_queue(mut self, workers: usize) -> Self {
		self.config.control.workers_per_queue = workers;
		self
	}

	/// Connect everything and start the scheduler and the worker pools.
	pub fn build(self) -> Result<Pipeline> {
		let config = self.config;
		task::block_on(database::migrate(&config.database.url))?;
		let db = task::block_on(Database::new(&config.database.url))?;
		let kv: Arc<dyn KeyValueStore> = Arc::new(RedisStore::connect(&config.redis_url)?);
		let registry = Arc::new(TaskRegistry::default());
		let broker = Arc::new(BrokerHandle::connect(&config.amqp_addr)?);
		let crypto = CryptoClient::new(config.crypto.clone());

		let env = Arc::new(WorkerEnvironment::new(db.clone(), kv.clone(), crypto, registry.clone()));
		let shutdown = Arc::new(AtomicBool::new(false));
		let handler: Arc<dyn Fn(crate::types::ChunkMessage) + Send + Sync> = {
			let env = env.clone();
			Arc::new(move |message| worker::handle_delivery(&env, message))
		};
		let worker_pools = TaskType::ALL
			.iter()
			.map(|ty| {
				WorkerPool::spawn(
					&broker,
					*ty,
					config.control.workers_per_queue,
					config.control.prefetch,
					handler.clone(),
					shutdown.clone(),
				)
			})
			.collect::<Result<Vec<_>>>()?;

		let (scheduler_kill, kill_rx) = flume::bounded(1);
		let sink: Arc<dyn Publish> = broker.clone();
		let scheduler = Scheduler::new(registry.clone(), sink);
		let scheduler_handle = jod_thread::spawn(move || smol::block_on(scheduler.run(kill_rx)));

		Ok(Pipeline {
			credentials: CredentialStore::new(kv.clone()),
			coordinator: PhaseCoordinator::new(kv, "operator"),
			config,
			db,
			registry,
			broker,
			worker_pools,
			scheduler_kill,
			scheduler_handle: Some(scheduler_handle),
		})
	}
}

/// A running orchestrator instance.
pub struct Pipeline {
	config: PipelineConfig,
	db: Database,
	registry: Arc<TaskRegistry>,
	credentials: CredentialStore,
	coordinator: PhaseCoordinator,
	broker: Arc<BrokerHandle>,
	worker_pools: Vec<WorkerPool>,
	scheduler_kill: flume::Sender<()>,
	scheduler_handle: Option<jod_thread::JoinHandle<()>>,
}

/// Election results are all-or-nothing: until every election center holds a
/// plaintext, readers observe `InProgress`.
#[derive(Debug)]
pub enum ResultsProgress {
	InProgress,
	Ready(Vec<(String, Value)>),
}

impl Pipeline {
	pub fn builder(config: PipelineConfig) -> PipelineBuilder {
		PipelineBuilder::new(config)
	}

	pub fn registry(&self) -> &Arc<TaskRegistry> {
		&self.registry
	}

	/// Chunk an election's ballots and register the tally phase.
	pub async fn start_tally(&self, election_id: ElectionId, created_by: Option<&str>) -> Result<JobId> {
		let mut conn = self.db.conn().await?;
		let election = queries::election(&mut *conn, election_id).await?;
		let ballots = queries::ballot_ids(&mut *conn, election_id).await?;
		if ballots.is_empty() {
			return Err(Error::Msg(format!("election {} has no ballots to tally", election_id)));
		}
		let chunks = chunker::chunk_ballots(ballots, self.config.control.chunk_size);
		let job_id = queries::insert_job(&mut *conn, election_id, "tally", chunks.len() as i32, created_by).await?;
		drop(conn);

		let payloads = chunks
			.into_values()
			.map(|ballot_ids| {
				TaskPayload::Tally(TallyCreationTask {
					election_id,
					ballot_ids,
					manifest: election.manifest.clone(),
					context: election.context.clone(),
				})
			})
			.collect();
		self.registry.register(TaskKey::tally(election_id), job_id, payloads)?;
		log::info!("tally phase registered for election {} as job {}", election_id, job_id);
		Ok(job_id)
	}

	/// Register phase 1 for one guardian: a partial-decryption chunk per
	/// election center. Requires the guardian's credentials and a finished
	/// tally.
	pub async fn start_partial_decryption(
		&self,
		election_id: ElectionId,
		guardian_id: &str,
		created_by: Option<&str>,
	) -> Result<JobId> {
		if !self.credentials.has(election_id, guardian_id)? {
			return Err(Error::MissingCredentials { election_id, guardian_id: guardian_id.to_string() });
		}
		let mut conn = self.db.conn().await?;
		queries::guardian(&mut *conn, election_id, guardian_id).await?;
		let centers = queries::election_centers(&mut *conn, election_id).await?;
		if centers.is_empty() || centers.iter().any(|c| c.encrypted_tally.is_none()) {
			return Err(Error::Msg(format!("election {} has no finished tally", election_id)));
		}
		let total = centers.len() as u32;
		let job_id =
			queries::insert_job(&mut *conn, election_id, "partial_decryption", centers.len() as i32, created_by).await?;
		drop(conn);

		let payloads = centers
			.into_iter()
			.map(|center| {
				TaskPayload::Partial(PartialDecryptionTask {
					election_id,
					guardian_id: guardian_id.to_string(),
					election_center_id: center.election_center_id,
					total_chunks: total,
				})
			})
			.collect();
		self.registry.register(TaskKey::partial(election_id, guardian_id), job_id, payloads)?;
		log::info!("partial decryption registered for guardian {} of election {} as job {}", guardian_id, election_id, job_id);
		Ok(job_id)
	}

	/// Phase 2 entry point, normally driven by the once-only trigger when a
	/// guardian finishes phase 1. Exposed for operator recovery.
	pub async fn start_compensated_phase(
		&self,
		election_id: ElectionId,
		source_guardian_id: &str,
		created_by: Option<&str>,
	) -> Result<Option<JobId>> {
		queue_compensated_phase(&self.db, &self.credentials, &self.registry, election_id, source_guardian_id, created_by)
			.await
	}

	/// Register the combine phase: one chunk per election center, once every
	/// center is covered for every guardian.
	pub async fn start_combine(&self, election_id: ElectionId, created_by: Option<&str>) -> Result<JobId> {
		let mut conn = self.db.conn().await?;
		let election = queries::election(&mut *conn, election_id).await?;
		let centers = queries::election_centers(&mut *conn, election_id).await?;
		if centers.is_empty() || centers.iter().any(|c| c.encrypted_tally.is_none()) {
			return Err(Error::Msg(format!("election {} has no finished tally", election_id)));
		}
		let coverage = queries::share_coverage(&mut *conn, election_id).await?;
		if let Some((center, covered)) =
			coverage.iter().find(|(_, covered)| *covered < i64::from(election.number_of_guardians))
		{
			return Err(Error::Msg(format!(
				"{} is covered for {} of {} guardians; decryption is incomplete",
				center, covered, election.number_of_guardians
			)));
		}
		let job_id = queries::insert_job(&mut *conn, election_id, "combine", centers.len() as i32, created_by).await?;
		drop(conn);

		let payloads = centers
			.into_iter()
			.map(|center| {
				TaskPayload::Combine(CombineDecryptionTask { election_id, election_center_id: center.election_center_id })
			})
			.collect();
		self.registry.register(TaskKey::combine(election_id), job_id, payloads)?;
		log::info!("combine phase registered for election {} as job {}", election_id, job_id);
		Ok(job_id)
	}

	/// Operator drain: the job record goes `failed` and the scheduler stops
	/// publishing its chunks; whatever is in flight completes.
	pub async fn abandon_job(&self, job_id: JobId, reason: &str) -> Result<()> {
		let mut conn = self.db.conn().await?;
		queries::mark_job_failed(&mut *conn, job_id, reason).await?;
		drop(conn);
		self.registry.drain_job(job_id);
		log::warn!("job {} abandoned: {}", job_id, reason);
		Ok(())
	}

	pub async fn job_status(&self, job_id: JobId) -> Result<JobRecord> {
		let mut conn = self.db.conn().await?;
		queries::job(&mut *conn, job_id).await
	}

	/// Per-chunk plaintexts, only once the whole election has them.
	pub async fn election_results(&self, election_id: ElectionId) -> Result<ResultsProgress> {
		let mut conn = self.db.conn().await?;
		Ok(match queries::election_results(&mut *conn, election_id).await? {
			Some(results) => ResultsProgress::Ready(results),
			None => ResultsProgress::InProgress,
		})
	}

	pub fn present_credentials(
		&self,
		election_id: ElectionId,
		guardian_id: &str,
		credentials: GuardianCredentials,
	) -> Result<()> {
		self.credentials.present(election_id, guardian_id, credentials)
	}

	pub fn clear_credentials(&self, election_id: ElectionId, guardian_id: &str) -> Result<()> {
		self.credentials.clear(election_id, guardian_id)
	}

	/// Clear a guardian's phase counters and trigger flags so an operator
	/// can restart a phase whose trigger winner crashed.
	pub fn reset_phase(&self, election_id: ElectionId, guardian_id: &str) -> Result<()> {
		self.coordinator.reset_phase(election_id, guardian_id)
	}

	/// Stop publishing, drain the consumers and close the broker.
	pub fn shutdown(mut self) -> Result<()> {
		log::info!("pipeline shutting down");
		let _ = self.scheduler_kill.send(());
		for pool in &self.worker_pools {
			pool.join();
		}
		// scheduler thread joins on drop
		self.scheduler_handle.take();
		self.broker.close()?;
		Ok(())
	}
}

/// Queue compensated decryption on behalf of `source_guardian_id` for every
/// absent guardian. Absence means no credentials in the store at trigger
/// time. With nobody absent there is nothing to reconstruct: the guardian
/// is finished on the spot (credentials cleared, `decrypted_or_not` set).
pub async fn queue_compensated_phase(
	db: &Database,
	credentials: &CredentialStore,
	registry: &TaskRegistry,
	election_id: ElectionId,
	source_guardian_id: &str,
	created_by: Option<&str>,
) -> Result<Option<JobId>> {
	let creds = credentials.fetch(election_id, source_guardian_id)?.ok_or_else(|| Error::MissingCredentials {
		election_id,
		guardian_id: source_guardian_id.to_string(),
	})?;

	let mut conn = db.conn().await?;
	let guardians = queries::guardians(&mut *conn, election_id).await?;
	let mut absent = Vec::new();
	for guardian in guardians.into_iter().filter(|g| g.guardian_id != source_guardian_id) {
		if !credentials.has(election_id, &guardian.guardian_id)? {
			absent.push(guardian);
		}
	}

	if absent.is_empty() {
		log::info!("no guardian is absent from election {}; finishing {}", election_id, source_guardian_id);
		credentials.clear(election_id, source_guardian_id)?;
		queries::set_guardian_decrypted(&mut *conn, election_id, source_guardian_id).await?;
		return Ok(None);
	}

	let election = queries::election(&mut *conn, election_id).await?;
	let source = queries::guardian(&mut *conn, election_id, source_guardian_id).await?;
	let source_backup = source
		.key_backup
		.ok_or_else(|| Error::Msg(format!("guardian {} has no key backup bundle", source_guardian_id)))?;
	let centers = queries::election_centers(&mut *conn, election_id).await?;
	if centers.is_empty() || centers.iter().any(|c| c.encrypted_tally.is_none()) {
		return Err(Error::Msg(format!("election {} has no finished tally", election_id)));
	}

	let total_shares = (centers.len() * absent.len()) as u32;
	let job_id =
		queries::insert_job(&mut *conn, election_id, "compensated_decryption", total_shares as i32, created_by).await?;
	drop(conn);

	for missing in &absent {
		let missing_backup = missing
			.key_backup
			.clone()
			.ok_or_else(|| Error::Msg(format!("guardian {} has no key backup bundle", missing.guardian_id)))?;
		let payloads = centers
			.iter()
			.map(|center| {
				TaskPayload::Compensated(CompensatedDecryptionTask {
					election_id,
					election_center_id: center.election_center_id.clone(),
					source_guardian_id: source_guardian_id.to_string(),
					source_sequence_order: source.sequence_order,
					source_public_key: source.guardian_public_key.clone(),
					source_key_backup: source_backup.clone(),
					source_private_key: creds.private_key.clone(),
					source_polynomial: creds.polynomial.clone(),
					missing_guardian_id: missing.guardian_id.clone(),
					missing_sequence_order: missing.sequence_order,
					missing_public_key: missing.guardian_public_key.clone(),
					missing_key_backup: missing_backup.clone(),
					quorum: election.quorum,
					total_shares,
				})
			})
			.collect();
		registry.register(TaskKey::compensated(election_id, source_guardian_id, &missing.guardian_id), job_id, payloads)?;
	}
	log::info!(
		"compensated decryption registered: {} reconstructing {} absent guardian(s) over {} chunks (job {})",
		source_guardian_id,
		absent.len(),
		centers.len(),
		job_id
	);
	Ok(Some(job_id))
}
