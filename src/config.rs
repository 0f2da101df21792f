// Copyright 2026 Cram Contributors.
// This file is part of Cram.

// Cram is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Cram is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Cram.  If not, see <http://www.gnu.org/licenses/>.

// Launch-time knobs, read once from the environment (spec §6).

use std::path::PathBuf;

const FILE_VAR: &str = "CRAM_FILE";
const OUTPUT_VAR: &str = "CRAM_OUTPUT";
const BUFFER_SIZE_VAR: &str = "CRAM_BUFFER_SIZE";

use crate::container::DEFAULT_BUFFER_SIZE;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputMode {
	/// Streams untouched.
	System,
	/// Every rank redirected to the null device.
	None,
	/// Only each sub-job's local rank 0 gets real files; the rest go to
	/// the null device. Default.
	Rank0,
	/// Every rank gets its own pair of files.
	All,
}

impl OutputMode {
	fn parse(s: &str) -> Option<OutputMode> {
		match s.to_ascii_uppercase().as_str() {
			"SYSTEM" => Some(OutputMode::System),
			"NONE" => Some(OutputMode::None),
			"RANK0" => Some(OutputMode::Rank0),
			"ALL" => Some(OutputMode::All),
			_ => None,
		}
	}
}

#[derive(Clone, Debug)]
pub struct Config {
	/// `None` means `CRAM_FILE` was unset: partitioning is disabled and the
	/// shim is a no-op. `Some` does not imply the path is readable — that is
	/// discovered (and is fatal if it fails) when the container is opened.
	pub file: Option<PathBuf>,
	pub output: OutputMode,
	pub buffer_size: usize,
}

impl Config {
	pub fn from_env() -> Config {
		let file = std::env::var_os(FILE_VAR).map(PathBuf::from);

		let output = match std::env::var(OUTPUT_VAR) {
			Ok(v) => OutputMode::parse(&v).unwrap_or_else(|| {
				log::warn!("{}={:?} is not a recognized output mode, falling back to RANK0", OUTPUT_VAR, v);
				OutputMode::Rank0
			}),
			Err(_) => OutputMode::Rank0,
		};

		let buffer_size = match std::env::var(BUFFER_SIZE_VAR) {
			Ok(v) => match v.parse::<usize>() {
				Ok(n) if n > 0 => n,
				_ => {
					log::warn!(
						"{}={:?} is not a positive integer, falling back to {} bytes",
						BUFFER_SIZE_VAR,
						v,
						DEFAULT_BUFFER_SIZE
					);
					DEFAULT_BUFFER_SIZE
				}
			},
			Err(_) => DEFAULT_BUFFER_SIZE,
		};

		Config { file, output, buffer_size }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_output_mode_falls_back_to_rank0() {
		assert_eq!(OutputMode::parse("bogus"), None);
		assert_eq!(OutputMode::parse("all"), Some(OutputMode::All));
		assert_eq!(OutputMode::parse("SYSTEM"), Some(OutputMode::System));
	}
}
