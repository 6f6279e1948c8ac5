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

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use tally_pipeline::PipelineConfig;

use crate::cli_opts::CliOpts;

#[derive(Debug, Clone, Deserialize)]
struct TomlConfig {
	#[serde(flatten)]
	pipeline: PipelineConfig,
	log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
	cli: CliOpts,
	pipeline: PipelineConfig,
	log_file: Option<PathBuf>,
}

impl Config {
	pub fn new() -> Result<Self> {
		let cli = CliOpts::parse();
		let file = cli.file.clone().context("tally-node requires a configuration file (--config)")?;
		let toml_conf = Self::parse_file(file.as_path())?;
		Ok(Self { cli, pipeline: toml_conf.pipeline, log_file: toml_conf.log_file })
	}

	fn parse_file(path: &Path) -> Result<TomlConfig> {
		let toml_str = std::fs::read_to_string(path)?;
		Ok(toml::from_str(toml_str.as_str())?)
	}

	pub fn cli(&self) -> &CliOpts {
		&self.cli
	}

	pub fn pipeline(&self) -> &PipelineConfig {
		&self.pipeline
	}

	pub fn log_file(&self) -> Option<PathBuf> {
		self.log_file.clone()
	}
}
