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

//! Durable, fair, chunked orchestration of an election's cryptographic
//! pipeline: tally creation, per-guardian partial decryption, compensated
//! decryption for absent guardians, and the final combination into
//! plaintext results. Work is cut into chunks, published round-robin onto
//! a durable broker, executed by worker pools against an external crypto
//! service, and coordinated through atomic key-value counters so phase
//! transitions fire exactly once with no central coordinator.

#![forbid(unsafe_code)]

mod broker;
pub mod chunker;
mod coordinator;
mod credentials;
pub mod crypto;
pub mod database;
mod error;
mod kv;
mod logger;
mod pipeline;
mod registry;
mod scheduler;
pub mod types;
mod worker;

pub use self::broker::BrokerHandle;
pub use self::coordinator::PhaseCoordinator;
pub use self::credentials::{CredentialStore, GuardianCredentials, CREDENTIAL_TTL};
pub use self::database::{queries, Database, DatabaseConfig};
pub use self::error::{CryptoError, Error, Result, WorkerError};
pub use self::kv::{KeyValueStore, RedisStore};
pub use self::logger::init as init_logger;
pub use self::pipeline::{
	queue_compensated_phase, ControlConfig, Pipeline, PipelineBuilder, PipelineConfig, ResultsProgress,
};
pub use self::registry::{FailureDisposition, Progress, RetryPolicy, TaskRegistry};
pub use self::scheduler::{Publish, Scheduler};
pub use self::worker::WorkerEnvironment;

#[cfg(any(test, feature = "test_components"))]
pub use self::kv::MemoryStore;

#[cfg(test)]
pub use test::initialize;

#[cfg(test)]
mod test {
	use std::sync::Once;

	static INIT: Once = Once::new();
	/// Guard that should be called at the beginning of every test.
	pub fn initialize() {
		INIT.call_once(|| {
			let _ = pretty_env_logger::try_init();
		});
	}
}
