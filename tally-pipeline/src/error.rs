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

use std::{env, io};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Tally Pipeline Error Enum
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Env(#[from] env::VarError),

	// encoding error
	#[error(transparent)]
	Serialization(#[from] serde_json::Error),
	#[error("Error encoding chunk message {0}")]
	MsgEncode(#[from] rmp_serde::encode::Error),
	#[error("Error decoding chunk message {0}")]
	MsgDecode(#[from] rmp_serde::decode::Error),

	// database error
	#[error("sqlx error: {0}")]
	Sql(#[from] sqlx::Error),
	#[error("migration error: {0}")]
	Migration(#[from] sqlx::migrate::MigrateError),

	// broker error
	#[error("broker error: {0}")]
	Broker(#[from] lapin::Error),

	// key-value store error
	#[error("key-value store error: {0}")]
	Kv(#[from] redis::RedisError),

	// crypto service error
	#[error(transparent)]
	Crypto(#[from] CryptoError),

	/// An active task-instance with the same tuple already exists.
	#[error("duplicate task: {0}")]
	DuplicateTask(String),
	#[error("unknown task-instance: {0}")]
	UnknownTask(String),
	#[error("unknown chunk: {0}")]
	UnknownChunk(String),
	#[error("credentials not present for guardian {guardian_id} of election {election_id}")]
	MissingCredentials { election_id: i64, guardian_id: String },

	#[error("Sending on a disconnected channel")]
	Channel,

	#[error("{0}")]
	Msg(String),
}

/// Errors speaking to the external cryptographic service.
/// Both variants are retriable by contract.
#[derive(Debug, Error)]
pub enum CryptoError {
	#[error("crypto service returned status {code}: {body}")]
	Status { code: u16, body: String },
	#[error("crypto service transport error: {0}")]
	Transport(String),
	#[error("could not decode crypto service response: {0}")]
	Decode(String),
}

/// Classified failure of one chunk execution. The classification decides
/// whether the registry schedules a retry or finalizes the chunk.
#[derive(Debug, Error)]
pub enum WorkerError {
	#[error("{0}")]
	Transient(String),
	#[error("{0}")]
	Permanent(String),
	#[error("credentials missing for guardian {guardian_id} of election {election_id}")]
	CredentialsMissing { election_id: i64, guardian_id: String },
	#[error("guardian {holder} holds no key backup for guardian {target}")]
	MissingBackup { holder: String, target: String },
}

impl WorkerError {
	pub fn retriable(&self) -> bool {
		matches!(self, WorkerError::Transient(_) | WorkerError::CredentialsMissing { .. })
	}
}

impl From<CryptoError> for WorkerError {
	fn from(e: CryptoError) -> Self {
		WorkerError::Transient(e.to_string())
	}
}

impl From<sqlx::Error> for WorkerError {
	fn from(e: sqlx::Error) -> Self {
		WorkerError::Transient(format!("database error: {}", e))
	}
}

impl From<Error> for WorkerError {
	fn from(e: Error) -> Self {
		match e {
			Error::Crypto(c) => c.into(),
			Error::Sql(s) => s.into(),
			Error::Kv(k) => WorkerError::Transient(format!("key-value store error: {}", k)),
			other => WorkerError::Permanent(other.to_string()),
		}
	}
}

impl From<String> for Error {
	fn from(err: String) -> Error {
		Error::Msg(err)
	}
}

impl<T> From<flume::SendError<T>> for Error {
	fn from(_: flume::SendError<T>) -> Self {
		Self::Channel
	}
}
