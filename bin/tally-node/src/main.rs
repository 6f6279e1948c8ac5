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

mod cli_opts;
mod config;

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use anyhow::Result;

use tally_pipeline::Pipeline;

pub fn main() -> Result<()> {
	let config = config::Config::new()?;
	tally_pipeline::init_logger(config.cli().log_level, log::LevelFilter::Debug, config.log_file())?;

	let pipeline = Pipeline::builder(config.pipeline().clone()).build()?;
	log::info!("tally-node up; scheduler and workers running");

	let running = Arc::new(AtomicBool::new(true));
	let r = running.clone();
	ctrlc::set_handler(move || {
		r.store(false, Ordering::SeqCst);
	})
	.expect("Error setting Ctrl-C handler");
	while running.load(Ordering::SeqCst) {
		std::thread::sleep(std::time::Duration::from_millis(100));
	}

	pipeline.shutdown()?;
	Ok(())
}
