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

//! logging
//!
//! Timestamps are UTC, like every time the orchestrator persists.

use std::{cmp, io, path::PathBuf};

use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Dependencies whose chatter would drown the pipeline's own logs, with the
/// loudest level they are ever allowed.
const NOISY_DEPS: &[(&str, LevelFilter)] = &[
	("sqlx", LevelFilter::Error),
	("lapin", LevelFilter::Warn),
	("pinky_swear", LevelFilter::Error),
	("polling", LevelFilter::Warn),
	("async_io", LevelFilter::Warn),
];

pub fn init(std: LevelFilter, file: LevelFilter, log_path: Option<PathBuf>) -> io::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Cyan)
		.debug(Color::BrightBlack)
		.trace(Color::BrightBlue);

	let stdout = quiet_deps(fern::Dispatch::new(), std)
		.level_for("tally_pipeline", std)
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:>5} {}  {}",
				chrono::Utc::now().format("%H:%M:%S"),
				colors.color(record.level()),
				record.target(),
				message,
			))
		})
		.chain(std::io::stdout());

	let mut root = fern::Dispatch::new().chain(stdout);

	if let Some(path) = log_path {
		let to_file = quiet_deps(fern::Dispatch::new(), file)
			.level_for("tally_pipeline", file)
			.format(|out, message, record| {
				let origin = match (record.file(), record.line()) {
					(Some(file), Some(line)) => format!("{}:{}", file, line),
					_ => record.target().to_string(),
				};
				out.finish(format_args!(
					"{} {} [{}] {}",
					chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
					record.level(),
					origin,
					message,
				))
			})
			.chain(fern::log_file(path)?);
		root = root.chain(to_file);
	}

	root.apply().map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;
	Ok(())
}

/// Open a dispatcher at `level`, with every noisy dependency capped at the
/// quieter of `level` and its entry in [`NOISY_DEPS`].
fn quiet_deps(dispatch: fern::Dispatch, level: LevelFilter) -> fern::Dispatch {
	NOISY_DEPS
		.iter()
		.fold(dispatch.level(level), |d, (target, cap)| d.level_for(*target, cmp::min(*cap, level)))
}
