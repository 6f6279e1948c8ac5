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

//! Common SQL queries on the orchestrator database abstracted into rust
//! functions. Job-counter updates are single-statement numeric adds so
//! concurrent workers never lose increments.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgConnection;

use crate::{
	database::models::{CompensatedDecryptionModel, DecryptionModel, ElectionCenterModel, ElectionModel, GuardianModel, JobRecord},
	error::Result,
	types::{DecryptionKind, JobStatus},
};

pub async fn election(conn: &mut PgConnection, election_id: i64) -> Result<ElectionModel> {
	sqlx::query_as::<_, ElectionModel>(
		"SELECT election_id, manifest, context, joint_public_key, number_of_guardians, quorum, status
		FROM elections WHERE election_id = $1",
	)
	.bind(election_id)
	.fetch_one(conn)
	.await
	.map_err(Into::into)
}

pub async fn guardian(conn: &mut PgConnection, election_id: i64, guardian_id: &str) -> Result<GuardianModel> {
	sqlx::query_as::<_, GuardianModel>(
		"SELECT guardian_id, election_id, sequence_order, guardian_public_key, key_backup, polynomial_backup, decrypted_or_not
		FROM guardians WHERE election_id = $1 AND guardian_id = $2",
	)
	.bind(election_id)
	.bind(guardian_id)
	.fetch_one(conn)
	.await
	.map_err(Into::into)
}

/// All guardians of an election, in sequence order.
pub async fn guardians(conn: &mut PgConnection, election_id: i64) -> Result<Vec<GuardianModel>> {
	sqlx::query_as::<_, GuardianModel>(
		"SELECT guardian_id, election_id, sequence_order, guardian_public_key, key_backup, polynomial_backup, decrypted_or_not
		FROM guardians WHERE election_id = $1 ORDER BY sequence_order",
	)
	.bind(election_id)
	.fetch_all(conn)
	.await
	.map_err(Into::into)
}

pub async fn set_guardian_decrypted(conn: &mut PgConnection, election_id: i64, guardian_id: &str) -> Result<u64> {
	sqlx::query("UPDATE guardians SET decrypted_or_not = TRUE WHERE election_id = $1 AND guardian_id = $2")
		.bind(election_id)
		.bind(guardian_id)
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
}

/// Every ballot id cast in an election, in submission order. The chunker
/// permutes them before partitioning.
pub async fn ballot_ids(conn: &mut PgConnection, election_id: i64) -> Result<Vec<String>> {
	let rows: Vec<(String,)> =
		sqlx::query_as("SELECT ballot_id FROM encrypted_ballots WHERE election_id = $1 ORDER BY submitted_at")
			.bind(election_id)
			.fetch_all(conn)
			.await?;
	Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn encrypted_ballots(conn: &mut PgConnection, election_id: i64, ballot_ids: &[String]) -> Result<Vec<Value>> {
	let rows: Vec<(Value,)> =
		sqlx::query_as("SELECT cipher_text FROM encrypted_ballots WHERE election_id = $1 AND ballot_id = ANY($2)")
			.bind(election_id)
			.bind(ballot_ids)
			.fetch_all(conn)
			.await?;
	Ok(rows.into_iter().map(|(c,)| c).collect())
}

pub async fn election_center(conn: &mut PgConnection, election_center_id: &str) -> Result<ElectionCenterModel> {
	sqlx::query_as::<_, ElectionCenterModel>(
		"SELECT election_center_id, election_id, chunk_number, encrypted_tally, election_result
		FROM election_center WHERE election_center_id = $1",
	)
	.bind(election_center_id)
	.fetch_one(conn)
	.await
	.map_err(Into::into)
}

pub async fn election_centers(conn: &mut PgConnection, election_id: i64) -> Result<Vec<ElectionCenterModel>> {
	sqlx::query_as::<_, ElectionCenterModel>(
		"SELECT election_center_id, election_id, chunk_number, encrypted_tally, election_result
		FROM election_center WHERE election_id = $1 ORDER BY chunk_number",
	)
	.bind(election_id)
	.fetch_all(conn)
	.await
	.map_err(Into::into)
}

/// Write a chunk's final plaintext. A populated row is never overwritten.
pub async fn set_election_result(conn: &mut PgConnection, election_center_id: &str, result: &Value) -> Result<u64> {
	sqlx::query("UPDATE election_center SET election_result = $2 WHERE election_center_id = $1 AND election_result IS NULL")
		.bind(election_center_id)
		.bind(result)
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
}

pub async fn partial_shares(conn: &mut PgConnection, election_center_id: &str) -> Result<Vec<DecryptionModel>> {
	sqlx::query_as::<_, DecryptionModel>(
		"SELECT election_center_id, guardian_id, partial_tally_share, ballot_shares, guardian_decryption_key
		FROM decryptions WHERE election_center_id = $1 ORDER BY guardian_id",
	)
	.bind(election_center_id)
	.fetch_all(conn)
	.await
	.map_err(Into::into)
}

pub async fn compensated_shares(
	conn: &mut PgConnection,
	election_center_id: &str,
) -> Result<Vec<CompensatedDecryptionModel>> {
	sqlx::query_as::<_, CompensatedDecryptionModel>(
		"SELECT election_center_id, compensating_guardian_id, missing_guardian_id, compensated_tally_share, compensated_ballot_share
		FROM compensated_decryptions WHERE election_center_id = $1 ORDER BY missing_guardian_id, compensating_guardian_id",
	)
	.bind(election_center_id)
	.fetch_all(conn)
	.await
	.map_err(Into::into)
}

/// How many distinct guardians each election center is covered for, via a
/// partial share or a reconstructed one.
pub async fn share_coverage(conn: &mut PgConnection, election_id: i64) -> Result<Vec<(String, i64)>> {
	sqlx::query_as::<_, (String, i64)>(
		"SELECT ec.election_center_id,
			(SELECT COUNT(*) FROM decryptions d WHERE d.election_center_id = ec.election_center_id)
			+ (SELECT COUNT(DISTINCT c.missing_guardian_id) FROM compensated_decryptions c
				WHERE c.election_center_id = ec.election_center_id)
		FROM election_center ec WHERE ec.election_id = $1 ORDER BY ec.chunk_number",
	)
	.bind(election_id)
	.fetch_all(conn)
	.await
	.map_err(Into::into)
}

/// Per-chunk plaintexts, but only once the whole election has them.
/// Any unfinished row means callers observe "in progress".
pub async fn election_results(conn: &mut PgConnection, election_id: i64) -> Result<Option<Vec<(String, Value)>>> {
	let rows: Vec<(String, Option<Value>)> = sqlx::query_as(
		"SELECT election_center_id, election_result FROM election_center WHERE election_id = $1 ORDER BY chunk_number",
	)
	.bind(election_id)
	.fetch_all(conn)
	.await?;
	if rows.is_empty() || rows.iter().any(|(_, r)| r.is_none()) {
		return Ok(None);
	}
	Ok(Some(rows.into_iter().map(|(id, r)| (id, r.expect("checked above; qed"))).collect()))
}

pub async fn insert_job(
	conn: &mut PgConnection,
	election_id: i64,
	operation_type: &str,
	total_chunks: i32,
	created_by: Option<&str>,
) -> Result<i64> {
	let (job_id,): (i64,) = sqlx::query_as(
		"INSERT INTO election_jobs (election_id, operation_type, status, total_chunks, created_by, started_at)
		VALUES ($1, $2, $3, $4, $5, $6) RETURNING job_id",
	)
	.bind(election_id)
	.bind(operation_type)
	.bind(JobStatus::Queued.as_str())
	.bind(total_chunks)
	.bind(created_by)
	.bind(Utc::now())
	.fetch_one(conn)
	.await?;
	Ok(job_id)
}

pub async fn job(conn: &mut PgConnection, job_id: i64) -> Result<JobRecord> {
	sqlx::query_as::<_, JobRecord>(
		"SELECT job_id, election_id, operation_type, status, total_chunks, processed_chunks, failed_chunks,
			created_by, started_at, completed_at, error_message, metadata
		FROM election_jobs WHERE job_id = $1",
	)
	.bind(job_id)
	.fetch_one(conn)
	.await
	.map_err(Into::into)
}

/// Atomic `processed_chunks` add. Returns `(processed, total)` after the
/// increment so the caller can detect the completing chunk.
pub async fn increment_processed(conn: &mut PgConnection, job_id: i64) -> Result<(i32, i32)> {
	sqlx::query_as::<_, (i32, i32)>(
		"UPDATE election_jobs
		SET processed_chunks = processed_chunks + 1,
			status = CASE WHEN status = 'queued' THEN 'in_progress' ELSE status END
		WHERE job_id = $1
		RETURNING processed_chunks, total_chunks",
	)
	.bind(job_id)
	.fetch_one(conn)
	.await
	.map_err(Into::into)
}

pub async fn increment_failed(conn: &mut PgConnection, job_id: i64) -> Result<u64> {
	sqlx::query(
		"UPDATE election_jobs
		SET failed_chunks = failed_chunks + 1,
			status = CASE WHEN status = 'queued' THEN 'in_progress' ELSE status END
		WHERE job_id = $1",
	)
	.bind(job_id)
	.execute(conn)
	.await
	.map(|d| d.rows_affected())
	.map_err(Into::into)
}

/// Idempotent terminal write; only a fully processed job can complete.
pub async fn mark_job_completed(conn: &mut PgConnection, job_id: i64) -> Result<u64> {
	sqlx::query(
		"UPDATE election_jobs SET status = $2, completed_at = $3
		WHERE job_id = $1 AND processed_chunks = total_chunks AND status <> $2",
	)
	.bind(job_id)
	.bind(JobStatus::Completed.as_str())
	.bind(Utc::now())
	.execute(conn)
	.await
	.map(|d| d.rows_affected())
	.map_err(Into::into)
}

pub async fn mark_job_failed(conn: &mut PgConnection, job_id: i64, error: &str) -> Result<u64> {
	sqlx::query("UPDATE election_jobs SET status = $2, error_message = $3, completed_at = $4 WHERE job_id = $1")
		.bind(job_id)
		.bind(JobStatus::Failed.as_str())
		.bind(error)
		.bind(Utc::now())
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
}

pub async fn insert_tally_log(
	conn: &mut PgConnection,
	election_id: i64,
	election_center_id: &str,
	chunk_number: i32,
) -> Result<i64> {
	let (id,): (i64,) = sqlx::query_as(
		"INSERT INTO tally_worker_log (election_id, election_center_id, chunk_number, start_time, status)
		VALUES ($1, $2, $3, $4, 'in_progress') RETURNING id",
	)
	.bind(election_id)
	.bind(election_center_id)
	.bind(chunk_number)
	.bind(Utc::now())
	.fetch_one(conn)
	.await?;
	Ok(id)
}

pub async fn finish_tally_log(conn: &mut PgConnection, id: i64, completed: bool, error: Option<&str>) -> Result<u64> {
	sqlx::query("UPDATE tally_worker_log SET status = $2, end_time = $3, error_message = $4 WHERE id = $1")
		.bind(id)
		.bind(if completed { "completed" } else { "failed" })
		.bind(Utc::now())
		.bind(error)
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_decryption_log(
	conn: &mut PgConnection,
	election_id: i64,
	election_center_id: &str,
	chunk_number: i32,
	guardian_id: &str,
	decrypting_guardian_id: &str,
	kind: DecryptionKind,
) -> Result<i64> {
	let (id,): (i64,) = sqlx::query_as(
		"INSERT INTO decryption_worker_log
			(election_id, election_center_id, chunk_number, guardian_id, decrypting_guardian_id, decryption_type, start_time, status)
		VALUES ($1, $2, $3, $4, $5, $6, $7, 'in_progress') RETURNING id",
	)
	.bind(election_id)
	.bind(election_center_id)
	.bind(chunk_number)
	.bind(guardian_id)
	.bind(decrypting_guardian_id)
	.bind(kind.as_str())
	.bind(Utc::now())
	.fetch_one(conn)
	.await?;
	Ok(id)
}

pub async fn finish_decryption_log(conn: &mut PgConnection, id: i64, completed: bool, error: Option<&str>) -> Result<u64> {
	sqlx::query("UPDATE decryption_worker_log SET status = $2, end_time = $3, error_message = $4 WHERE id = $1")
		.bind(id)
		.bind(if completed { "completed" } else { "failed" })
		.bind(Utc::now())
		.bind(error)
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
}

pub async fn insert_combine_log(
	conn: &mut PgConnection,
	election_id: i64,
	election_center_id: &str,
	chunk_number: i32,
) -> Result<i64> {
	let (id,): (i64,) = sqlx::query_as(
		"INSERT INTO combine_worker_log (election_id, election_center_id, chunk_number, start_time, status)
		VALUES ($1, $2, $3, $4, 'in_progress') RETURNING id",
	)
	.bind(election_id)
	.bind(election_center_id)
	.bind(chunk_number)
	.bind(Utc::now())
	.fetch_one(conn)
	.await?;
	Ok(id)
}

pub async fn finish_combine_log(conn: &mut PgConnection, id: i64, completed: bool, error: Option<&str>) -> Result<u64> {
	sqlx::query("UPDATE combine_worker_log SET status = $2, end_time = $3, error_message = $4 WHERE id = $1")
		.bind(id)
		.bind(if completed { "completed" } else { "failed" })
		.bind(Utc::now())
		.bind(error)
		.execute(conn)
		.await
		.map(|d| d.rows_affected())
		.map_err(Into::into)
}
