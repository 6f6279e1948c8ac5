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

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

use super::{DbConn, DbReturn, Insert};

#[derive(Debug, Clone, FromRow)]
pub struct ElectionModel {
	pub election_id: i64,
	pub manifest: Value,
	pub context: Value,
	pub joint_public_key: Option<String>,
	pub number_of_guardians: i32,
	pub quorum: i32,
	pub status: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct GuardianModel {
	pub guardian_id: String,
	pub election_id: i64,
	pub sequence_order: i32,
	pub guardian_public_key: String,
	/// Wrapped private-key backup bundle (opaque). Contains backup entries
	/// for every other guardian of the election.
	pub key_backup: Option<Value>,
	/// Wrapped polynomial (opaque).
	pub polynomial_backup: Option<Value>,
	pub decrypted_or_not: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct ElectionCenterModel {
	pub election_center_id: String,
	pub election_id: i64,
	pub chunk_number: i32,
	pub encrypted_tally: Option<Value>,
	pub election_result: Option<Value>,
}

/// A guardian's partial share for one election center.
#[derive(Debug, Clone, FromRow)]
pub struct DecryptionModel {
	pub election_center_id: String,
	pub guardian_id: String,
	pub partial_tally_share: Value,
	pub ballot_shares: Option<Value>,
	pub guardian_decryption_key: Option<String>,
}

/// A reconstructed share for an absent guardian.
#[derive(Debug, Clone, FromRow)]
pub struct CompensatedDecryptionModel {
	pub election_center_id: String,
	pub compensating_guardian_id: String,
	pub missing_guardian_id: String,
	pub compensated_tally_share: Value,
	pub compensated_ballot_share: Option<Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
	pub job_id: i64,
	pub election_id: i64,
	pub operation_type: String,
	pub status: String,
	pub total_chunks: i32,
	pub processed_chunks: i32,
	pub failed_chunks: i32,
	pub created_by: Option<String>,
	pub started_at: Option<DateTime<Utc>>,
	pub completed_at: Option<DateTime<Utc>>,
	pub error_message: Option<String>,
	pub metadata: Option<Value>,
}

#[async_trait::async_trait]
impl Insert for ElectionCenterModel {
	async fn insert(mut self, conn: &mut DbConn) -> DbReturn {
		log::debug!("storing encrypted tally for {}", self.election_center_id);
		sqlx::query(
			r#"
			INSERT INTO election_center (election_center_id, election_id, chunk_number, encrypted_tally)
			VALUES ($1, $2, $3, $4)
			ON CONFLICT (election_center_id) DO NOTHING
			"#,
		)
		.bind(&self.election_center_id)
		.bind(self.election_id)
		.bind(self.chunk_number)
		.bind(&self.encrypted_tally)
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
	}
}

#[async_trait::async_trait]
impl Insert for DecryptionModel {
	async fn insert(mut self, conn: &mut DbConn) -> DbReturn {
		log::debug!("storing partial share of {} for {}", self.guardian_id, self.election_center_id);
		sqlx::query(
			r#"
			INSERT INTO decryptions (election_center_id, guardian_id, partial_tally_share, ballot_shares, guardian_decryption_key)
			VALUES ($1, $2, $3, $4, $5)
			ON CONFLICT (election_center_id, guardian_id) DO NOTHING
			"#,
		)
		.bind(&self.election_center_id)
		.bind(&self.guardian_id)
		.bind(&self.partial_tally_share)
		.bind(&self.ballot_shares)
		.bind(&self.guardian_decryption_key)
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
	}
}

#[async_trait::async_trait]
impl Insert for CompensatedDecryptionModel {
	async fn insert(mut self, conn: &mut DbConn) -> DbReturn {
		log::debug!(
			"storing compensated share by {} for missing {} on {}",
			self.compensating_guardian_id,
			self.missing_guardian_id,
			self.election_center_id
		);
		sqlx::query(
			r#"
			INSERT INTO compensated_decryptions
				(election_center_id, compensating_guardian_id, missing_guardian_id, compensated_tally_share, compensated_ballot_share)
			VALUES ($1, $2, $3, $4, $5)
			ON CONFLICT (election_center_id, compensating_guardian_id, missing_guardian_id) DO NOTHING
			"#,
		)
		.bind(&self.election_center_id)
		.bind(&self.compensating_guardian_id)
		.bind(&self.missing_guardian_id)
		.bind(&self.compensated_tally_share)
		.bind(&self.compensated_ballot_share)
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
	}
}
