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

// Error types shared by the codec, container and partitioner.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong reading a container or running the launch-time
/// partitioner. Format errors, capacity errors and I/O errors are all fatal to
/// the allocation (see spec §7); there is no variant for a recoverable error
/// because the codec and container never retry.
#[derive(Debug)]
pub enum Error {
	/// Header magic did not match `0x6372616d`.
	BadMagic(u32),
	/// A record's advertised byte length exceeded `max_job_size`, or fewer
	/// bytes were available than the record prefix promised.
	TruncatedRecord,
	/// A string length field ran past the remaining bytes of the record.
	InvalidRecord,
	/// Record 0 carried a non-empty `subtracted` list, meaning it claims to
	/// be a delta against a base that does not exist.
	NoBaseForDelta,
	/// `total_procs` in the container exceeds the allocation size.
	Capacity { total_procs: u32, allocation_size: i32 },
	/// Underlying I/O failure opening or reading the container file.
	Io(io::Error),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::BadMagic(got) => write!(f, "bad container magic: 0x{:08x}", got),
			Error::TruncatedRecord => write!(f, "truncated job record"),
			Error::InvalidRecord => write!(f, "invalid job record: string length overruns record"),
			Error::NoBaseForDelta => write!(f, "delta record with no base environment supplied"),
			Error::Capacity { total_procs, allocation_size } => write!(
				f,
				"container requests {} processes but the allocation has only {}",
				total_procs, allocation_size
			),
			Error::Io(e) => write!(f, "i/o error: {}", e),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(e)
	}
}
