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

//! RabbitMQ plumbing: one durable direct exchange, four durable queues
//! bound 1-to-1 by routing key, and per-queue consumer threadpools.
//! Each consumer thread owns its channel and runs with prefetch 1; one
//! message is in flight per consumer at any time.

use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_amqp::*;
use async_std::{future::timeout, task};
use futures::StreamExt;
use lapin::{
	options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
	types::FieldTable,
	Channel, Connection, ConnectionProperties, ExchangeKind,
};
use threadpool::ThreadPool;

use crate::{
	error::{Error, Result},
	scheduler::Publish,
	types::{ChunkMessage, TaskType},
};

pub const EXCHANGE: &str = "tally.pipeline";
/// How long a consumer waits on its stream before re-checking shutdown.
const CONSUME_POLL: Duration = Duration::from_millis(250);

/// Owns the broker connection and a publishing channel. Declares the
/// exchange and all four queues up front so publication never races
/// topology creation.
pub struct BrokerHandle {
	conn: Connection,
	channel: Channel,
}

impl BrokerHandle {
	pub fn connect(addr: &str) -> Result<Self> {
		let conn = Connection::connect(addr, ConnectionProperties::default().with_async_std()).wait()?;
		let channel = conn.create_channel().wait()?;
		channel
			.exchange_declare(
				EXCHANGE,
				ExchangeKind::Direct,
				ExchangeDeclareOptions { durable: true, ..Default::default() },
				FieldTable::default(),
			)
			.wait()?;
		for ty in TaskType::ALL {
			let queue = ty.queue();
			channel
				.queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
				.wait()?;
			channel.queue_bind(queue, EXCHANGE, queue, QueueBindOptions::default(), FieldTable::default()).wait()?;
		}
		log::info!("broker topology declared on {}", addr);
		Ok(Self { conn, channel })
	}

	pub fn connection(&self) -> &Connection {
		&self.conn
	}

	pub fn close(&self) -> Result<()> {
		self.conn.close(0, "shutdown").wait()?;
		Ok(())
	}
}

impl Publish for BrokerHandle {
	fn publish(&self, task_type: TaskType, payload: &[u8]) -> Result<()> {
		self.channel
			.basic_publish(EXCHANGE, task_type.queue(), BasicPublishOptions::default(), payload.to_vec(), Default::default())
			.wait()?;
		Ok(())
	}
}

/// Consumer threadpool for one queue. Threads live until the shutdown flag
/// flips; the pool joins on [`WorkerPool::join`].
pub struct WorkerPool {
	pool: ThreadPool,
	shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
	/// Spawn `threads` consumers on `queue`, each delivering decoded chunk
	/// messages to `handler`. The handler owns all failure handling;
	/// deliveries are always settled here (no broker-level requeue, so a
	/// poison message cannot cycle).
	pub fn spawn(
		broker: &BrokerHandle,
		task_type: TaskType,
		threads: usize,
		prefetch: u16,
		handler: Arc<dyn Fn(ChunkMessage) + Send + Sync>,
		shutdown: Arc<AtomicBool>,
	) -> Result<Self> {
		let queue = task_type.queue();
		let pool = ThreadPool::with_name(format!("worker-{}", queue), threads);
		for _ in 0..threads {
			let channel = broker.conn.create_channel().wait()?;
			let handler = handler.clone();
			let shutdown = shutdown.clone();
			pool.execute(move || {
				if let Err(e) = consume_loop(channel, queue, prefetch, &*handler, &shutdown) {
					log::error!("consumer on {} exited: {}", queue, e);
				}
			});
		}
		log::info!("{} consumers listening on {} (prefetch {})", threads, queue, prefetch);
		Ok(Self { pool, shutdown })
	}

	pub fn join(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		self.pool.join();
	}

	pub fn active_count(&self) -> usize {
		self.pool.active_count()
	}
}

fn consume_loop(
	channel: Channel,
	queue: &str,
	prefetch: u16,
	handler: &(dyn Fn(ChunkMessage) + Send + Sync),
	shutdown: &AtomicBool,
) -> Result<()> {
	channel.basic_qos(prefetch, BasicQosOptions::default()).wait()?;
	let mut consumer =
		channel.basic_consume(queue, "", BasicConsumeOptions::default(), FieldTable::default()).wait()?;

	while !shutdown.load(Ordering::SeqCst) {
		let delivery = match task::block_on(timeout(CONSUME_POLL, consumer.next())) {
			Err(_) => continue,
			Ok(None) => break,
			Ok(Some(next)) => next.map(|(_, d)| d).map_err(Error::from)?,
		};

		match rmp_serde::from_slice::<ChunkMessage>(&delivery.data) {
			Ok(message) => handler(message),
			Err(e) => log::error!("dropping undecodable message on {}: {}", queue, e),
		}
		// settle unconditionally; retries are the registry's business
		task::block_on(delivery.acker.ack(BasicAckOptions::default()))?;
	}
	Ok(())
}
