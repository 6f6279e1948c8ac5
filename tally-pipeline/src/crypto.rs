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

//! Client for the external cryptographic service. The four RPCs are a
//! function of their inputs; field-by-field semantics of the large payloads
//! are opaque here. Calls block and are made from worker threads only,
//! never while a database transaction or pooled connection is held.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::CryptoError;

fn default_heavy_timeout() -> u64 {
	600
}

fn default_light_timeout() -> u64 {
	30
}

fn default_crypto_url() -> String {
	"http://localhost:5000".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct CryptoConfig {
	#[serde(default = "default_crypto_url")]
	pub url: String,
	/// Read timeout in seconds for the heavy RPCs.
	#[serde(default = "default_heavy_timeout")]
	pub heavy_timeout_secs: u64,
	/// Read timeout in seconds for light calls (health probes and the like).
	#[serde(default = "default_light_timeout")]
	pub light_timeout_secs: u64,
}

impl Default for CryptoConfig {
	fn default() -> Self {
		Self {
			url: default_crypto_url(),
			heavy_timeout_secs: default_heavy_timeout(),
			light_timeout_secs: default_light_timeout(),
		}
	}
}

#[derive(Clone)]
pub struct CryptoClient {
	agent: ureq::Agent,
	config: CryptoConfig,
}

impl CryptoClient {
	pub fn new(config: CryptoConfig) -> Self {
		Self { agent: ureq::AgentBuilder::new().build(), config }
	}

	pub fn create_encrypted_tally(&self, request: &TallyRequest) -> Result<TallyResponse, CryptoError> {
		self.post("create_encrypted_tally", request)
	}

	pub fn create_partial_decryption(
		&self,
		request: &PartialDecryptionRequest,
	) -> Result<PartialDecryptionResponse, CryptoError> {
		self.post("create_partial_decryption", request)
	}

	pub fn create_compensated_decryption(
		&self,
		request: &CompensatedDecryptionRequest,
	) -> Result<CompensatedDecryptionResponse, CryptoError> {
		self.post("create_compensated_decryption", request)
	}

	pub fn combine_decryption_shares(&self, request: &CombineSharesRequest) -> Result<CombineSharesResponse, CryptoError> {
		self.post("combine_decryption_shares", request)
	}

	/// Cheap liveness probe, bounded by the light timeout.
	pub fn health(&self) -> Result<(), CryptoError> {
		let url = format!("{}/health", self.config.url.trim_end_matches('/'));
		self.agent
			.get(&url)
			.timeout(Duration::from_secs(self.config.light_timeout_secs))
			.call()
			.map_err(classify)?;
		Ok(())
	}

	fn post<T: Serialize, R: DeserializeOwned>(&self, rpc: &str, body: &T) -> Result<R, CryptoError> {
		let url = format!("{}/{}", self.config.url.trim_end_matches('/'), rpc);
		let response = self
			.agent
			.post(&url)
			.timeout(Duration::from_secs(self.config.heavy_timeout_secs))
			.send_json(body)
			.map_err(classify)?;
		response.into_json().map_err(|e| CryptoError::Decode(e.to_string()))
	}
}

fn classify(e: ureq::Error) -> CryptoError {
	match e {
		ureq::Error::Status(code, response) => {
			let body = response.into_string().unwrap_or_default();
			CryptoError::Status { code, body }
		}
		ureq::Error::Transport(t) => CryptoError::Transport(t.to_string()),
	}
}

#[derive(Debug, Serialize)]
pub struct TallyRequest {
	pub election_id: i64,
	pub chunk_number: u32,
	pub manifest: Value,
	pub context: Value,
	pub encrypted_ballots: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct TallyResponse {
	pub encrypted_tally: Value,
}

#[derive(Serialize)]
pub struct PartialDecryptionRequest {
	pub election_id: i64,
	pub guardian_id: String,
	pub sequence_order: i32,
	pub guardian_public_key: String,
	pub private_key: String,
	pub polynomial: String,
	pub encrypted_tally: Value,
	pub manifest: Value,
	pub context: Value,
	pub quorum: i32,
}

#[derive(Debug, Deserialize)]
pub struct PartialDecryptionResponse {
	pub partial_tally_share: Value,
	#[serde(default)]
	pub ballot_shares: Value,
	#[serde(default)]
	pub guardian_decryption_key: Option<String>,
}

#[derive(Serialize)]
pub struct CompensatedDecryptionRequest {
	pub election_id: i64,
	pub source_guardian_id: String,
	pub source_sequence_order: i32,
	pub source_public_key: String,
	pub source_key_backup: Value,
	pub source_private_key: String,
	pub source_polynomial: String,
	pub missing_guardian_id: String,
	pub missing_sequence_order: i32,
	pub missing_public_key: String,
	pub missing_key_backup: Value,
	pub encrypted_tally: Value,
	pub manifest: Value,
	pub context: Value,
	pub quorum: i32,
}

#[derive(Debug, Deserialize)]
pub struct CompensatedDecryptionResponse {
	pub compensated_tally_share: Value,
	#[serde(default)]
	pub compensated_ballot_share: Value,
}

#[derive(Debug, Serialize)]
pub struct CombineSharesRequest {
	pub election_id: i64,
	pub encrypted_tally: Value,
	pub partial_shares: Vec<Value>,
	pub compensated_shares: Vec<Value>,
	pub manifest: Value,
	pub context: Value,
	pub quorum: i32,
}

#[derive(Debug, Deserialize)]
pub struct CombineSharesResponse {
	pub results: Value,
}
