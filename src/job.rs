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

// The job descriptor data model (spec §3).

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// A raw byte string: length-prefixed on the wire, not guaranteed to be valid
/// UTF-8, never nul-terminated. Working directories, argv entries and
/// environment keys/values are all `RawString`s rather than `String` because
/// the wire format makes no encoding promise about them.
#[derive(Clone, Eq, PartialEq, Hash, Default)]
pub struct RawString(pub Vec<u8>);

impl RawString {
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

impl From<&str> for RawString {
	fn from(s: &str) -> RawString {
		RawString(s.as_bytes().to_vec())
	}
}

impl From<String> for RawString {
	fn from(s: String) -> RawString {
		RawString(s.into_bytes())
	}
}

impl From<Vec<u8>> for RawString {
	fn from(v: Vec<u8>) -> RawString {
		RawString(v)
	}
}

impl AsRef<[u8]> for RawString {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl Ord for RawString {
	fn cmp(&self, other: &Self) -> Ordering {
		self.0.cmp(&other.0)
	}
}

impl PartialOrd for RawString {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Debug for RawString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", String::from_utf8_lossy(&self.0))
	}
}

impl fmt::Display for RawString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", String::from_utf8_lossy(&self.0))
	}
}

/// The sentinel `args[0]` a packed job may carry instead of a real executable
/// path, telling per-process setup to substitute the launcher's own
/// `argv[0]` in its place (spec §4.5 step 2).
pub const ARGV0_SENTINEL: &str = "<exe>";

/// One packed job: `(num_procs, working_dir, args, env)` as described in
/// spec §3. `env` is kept sorted by key for the whole lifetime of the
/// descriptor so the codec's merge-based delta logic stays linear.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobDescriptor {
	pub num_procs: u32,
	pub working_dir: RawString,
	pub args: Vec<RawString>,
	pub env: Vec<(RawString, RawString)>,
}

impl JobDescriptor {
	/// Builds a descriptor, sorting (and validating the uniqueness of) the
	/// environment. `args` must not be empty; `num_procs` must be at least 1.
	pub fn new(
		num_procs: u32,
		working_dir: RawString,
		args: Vec<RawString>,
		mut env: Vec<(RawString, RawString)>,
	) -> Result<JobDescriptor> {
		if num_procs == 0 || args.is_empty() {
			return Err(Error::InvalidRecord);
		}
		env.sort_by(|a, b| a.0.cmp(&b.0));
		if env.windows(2).any(|w| w[0].0 == w[1].0) {
			return Err(Error::InvalidRecord);
		}
		Ok(JobDescriptor { num_procs, working_dir, args, env })
	}

	pub fn env_keys(&self) -> impl Iterator<Item = &RawString> {
		self.env.iter().map(|(k, _)| k)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_zero_procs() {
		let env = vec![];
		let args = vec![RawString::from("app")];
		assert!(JobDescriptor::new(0, RawString::from("/tmp"), args, env).is_err());
	}

	#[test]
	fn rejects_empty_args() {
		assert!(JobDescriptor::new(1, RawString::from("/tmp"), vec![], vec![]).is_err());
	}

	#[test]
	fn rejects_duplicate_env_keys() {
		let args = vec![RawString::from("app")];
		let env = vec![
			(RawString::from("A"), RawString::from("1")),
			(RawString::from("A"), RawString::from("2")),
		];
		assert!(JobDescriptor::new(1, RawString::from("/tmp"), args, env).is_err());
	}

	#[test]
	fn sorts_env_on_construction() {
		let args = vec![RawString::from("app")];
		let env = vec![
			(RawString::from("B"), RawString::from("2")),
			(RawString::from("A"), RawString::from("1")),
		];
		let job = JobDescriptor::new(1, RawString::from("/tmp"), args, env).unwrap();
		assert_eq!(job.env[0].0, RawString::from("A"));
		assert_eq!(job.env[1].0, RawString::from("B"));
	}
}
