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

//! IO for the PostgreSQL database backing the orchestrator: guardian and
//! election rows, per-chunk artifacts, job records and worker logs.
//!
//! The pool is deliberately small and strict: connections are validated at
//! acquire time and recycled early. Long-running crypto RPCs happen with no
//! connection checked out.

pub mod models;
pub mod queries;

use std::{fmt, time::Duration};

use serde::Deserialize;
use sqlx::{
	pool::PoolConnection,
	postgres::{PgConnection, PgPool, PgPoolOptions, Postgres},
	Connection,
};

use crate::error::Result;

/// Run all the migrations.
pub async fn migrate<T: AsRef<str>>(url: T) -> Result<()> {
	let mut conn = PgConnection::connect(url.as_ref()).await?;
	sqlx::migrate!("./src/migrations/").run(&mut conn).await?;
	Ok(())
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DatabaseConfig {
	/// PostgreSQL url.
	pub url: String,
}

impl fmt::Display for DatabaseConfig {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.url)
	}
}

#[derive(Clone)]
pub struct Database {
	/// pool of database connections
	pool: PgPool,
}

impl Database {
	/// Connect to the database
	pub async fn new(url: &str) -> Result<Self> {
		let pool = PgPoolOptions::new()
			.min_connections(4)
			.max_connections(28)
			.idle_timeout(Duration::from_secs(60))
			.max_lifetime(Duration::from_secs(30 * 60))
			.test_before_acquire(true)
			.connect(url)
			.await?;
		Ok(Self { pool })
	}

	/// Start the database with a pre-defined pool
	pub fn with_pool(pool: PgPool) -> Self {
		Self { pool }
	}

	pub async fn insert(&self, data: impl Insert) -> Result<u64> {
		let mut conn = self.pool.acquire().await?;
		let res = data.insert(&mut conn).await?;
		Ok(res)
	}

	pub async fn conn(&self) -> Result<DbConn> {
		self.pool.acquire().await.map_err(Into::into)
	}

	pub fn pool(&self) -> &sqlx::PgPool {
		&self.pool
	}
}

pub type DbReturn = Result<u64>;
pub type DbConn = PoolConnection<Postgres>;

/// One row-producing write per model. Artifact inserts are idempotent
/// (`ON CONFLICT DO NOTHING`) so a redelivered chunk can never produce a
/// second row; the returned count tells the caller whether anything landed.
#[async_trait::async_trait]
pub trait Insert: Send + Sized {
	async fn insert(mut self, conn: &mut DbConn) -> DbReturn;
}
