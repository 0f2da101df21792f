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

// Container header and sequential reader (spec §4.1, §4.2).
//
// The packer's command-line surface and its policy for which environment
// variables to preserve are out of scope (spec §4.3); `write_container`
// below only implements the byte-level contract a writer must emit, so that
// tests and the demo binary can produce conformant fixtures without a real
// packer tool.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::codec::{self, peek_num_procs};
use crate::error::{Error, Result};
use crate::job::JobDescriptor;

pub const MAGIC: u32 = 0x6372_616d;
pub const CURRENT_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 20;
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
	pub magic: u32,
	pub version: u32,
	pub num_jobs: u32,
	pub total_procs: u32,
	pub max_job_size: u32,
}

impl Header {
	pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
		let mut out = [0u8; HEADER_LEN];
		out[0..4].copy_from_slice(&self.magic.to_be_bytes());
		out[4..8].copy_from_slice(&self.version.to_be_bytes());
		out[8..12].copy_from_slice(&self.num_jobs.to_be_bytes());
		out[12..16].copy_from_slice(&self.total_procs.to_be_bytes());
		out[16..20].copy_from_slice(&self.max_job_size.to_be_bytes());
		out
	}

	pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Header> {
		let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
		if magic != MAGIC {
			return Err(Error::BadMagic(magic));
		}
		let header = Header {
			magic,
			version: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
			num_jobs: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
			total_procs: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
			max_job_size: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
		};
		if header.version < 1 {
			return Err(Error::BadMagic(magic));
		}
		Ok(header)
	}
}

/// Sequential reader over a container file, opened once on the root rank
/// (spec §4.4 step 1) and never retried on failure.
pub struct ContainerReader {
	reader: BufReader<File>,
	header: Header,
	jobs_read: u32,
}

impl ContainerReader {
	pub fn open(path: &Path) -> Result<ContainerReader> {
		Self::open_with_buffer(path, DEFAULT_BUFFER_SIZE)
	}

	pub fn open_with_buffer(path: &Path, buffer_size: usize) -> Result<ContainerReader> {
		let file = File::open(path)?;
		let mut reader = BufReader::with_capacity(buffer_size, file);
		let mut header_buf = [0u8; HEADER_LEN];
		reader.read_exact(&mut header_buf).map_err(|_| Error::TruncatedRecord)?;
		let header = Header::parse(&header_buf)?;
		Ok(ContainerReader { reader, header, jobs_read: 0 })
	}

	pub fn header(&self) -> &Header {
		&self.header
	}

	pub fn has_more(&self) -> bool {
		self.jobs_read < self.header.num_jobs
	}

	/// Reads exactly one record into `buf`, growing it to the record's
	/// length (never beyond `max_job_size`). Returns the number of bytes
	/// read and the job's `num_procs`, peeked from the record's first field.
	pub fn next_into(&mut self, buf: &mut Vec<u8>) -> Result<(usize, u32)> {
		if !self.has_more() {
			return Err(Error::TruncatedRecord);
		}
		let mut len_buf = [0u8; 4];
		self.reader.read_exact(&mut len_buf).map_err(|_| Error::TruncatedRecord)?;
		let len = u32::from_be_bytes(len_buf) as usize;
		if len as u32 > self.header.max_job_size {
			return Err(Error::TruncatedRecord);
		}
		buf.clear();
		buf.resize(len, 0);
		self.reader.read_exact(buf).map_err(|_| Error::TruncatedRecord)?;
		let num_procs = peek_num_procs(buf)?;
		self.jobs_read += 1;
		Ok((len, num_procs))
	}

	/// Releases the underlying file handle. Dropping the reader does the
	/// same; this exists so call sites can make the release point explicit.
	pub fn close(self) {
		drop(self)
	}
}

/// Writes a conformant container to `path`: record 0 full, every later
/// record delta-encoded against job 0, sorted key lists throughout, and a
/// header whose `max_job_size`/`total_procs` match the records that follow
/// (spec §4.1, §4.3). Test/demo fixture helper, not the packer CLI.
pub fn write_container(path: &Path, jobs: &[JobDescriptor]) -> Result<()> {
	let mut records = Vec::with_capacity(jobs.len());
	if let Some(base) = jobs.first() {
		records.push(codec::encode_full(base));
		for job in &jobs[1..] {
			records.push(codec::encode_delta(job, base));
		}
	}

	let total_procs: u32 = jobs.iter().map(|j| j.num_procs).sum();
	let max_job_size = records.iter().map(|r| r.len() as u32).max().unwrap_or(0);
	let header =
		Header { magic: MAGIC, version: CURRENT_VERSION, num_jobs: jobs.len() as u32, total_procs, max_job_size };

	let mut file = File::create(path)?;
	file.write_all(&header.to_bytes())?;
	for record in &records {
		file.write_all(&(record.len() as u32).to_be_bytes())?;
		file.write_all(record)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::{JobDescriptor, RawString};
	use tempfile::NamedTempFile;

	fn job(num_procs: u32, dir: &str, env: &[(&str, &str)]) -> JobDescriptor {
		let env = env
			.iter()
			.map(|(k, v)| (RawString::from(*k), RawString::from(*v)))
			.collect::<Vec<_>>();
		JobDescriptor::new(num_procs, RawString::from(dir), vec![RawString::from("app")], env).unwrap()
	}

	#[test]
	fn header_round_trips_and_reader_iterates_all_jobs() {
		let jobs = vec![
			job(2, "/a", &[("X", "p"), ("Y", "q")]),
			job(3, "/b", &[("Y", "r"), ("Z", "s")]),
		];
		let tmp = NamedTempFile::new().unwrap();
		write_container(tmp.path(), &jobs).unwrap();

		let mut reader = ContainerReader::open(tmp.path()).unwrap();
		assert_eq!(reader.header().num_jobs, 2);
		assert_eq!(reader.header().total_procs, 5);

		let mut buf = Vec::new();
		let (_, n0) = reader.next_into(&mut buf).unwrap();
		assert_eq!(n0, 2);
		let base = crate::codec::decode_base(&buf).unwrap();

		let (_, n1) = reader.next_into(&mut buf).unwrap();
		assert_eq!(n1, 3);
		let other = crate::codec::decode_delta(&buf, &base).unwrap();
		assert_eq!(other, jobs[1]);
		assert!(!reader.has_more());
	}

	#[test]
	fn bad_magic_is_rejected() {
		let tmp = NamedTempFile::new().unwrap();
		std::fs::write(tmp.path(), [0u8; HEADER_LEN]).unwrap();
		assert!(matches!(ContainerReader::open(tmp.path()), Err(Error::BadMagic(0))));
	}
}
