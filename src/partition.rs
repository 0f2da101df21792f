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

// The launch-time partitioner (spec §4.4): the collective protocol that
// hands each rank exactly the job record it owns and a communicator split
// for its sub-job, without an O(N·record_size) all-to-all.

use std::path::Path;

use crate::codec;
use crate::comm::Comm;
use crate::container::ContainerReader;
use crate::error::{Error, Result};
use crate::job::JobDescriptor;

/// Point-to-point message tags: a job id fits in one `i32`, the record that
/// follows it (when the id is non-negative) is the second message.
const TAG_JOB_ID: i32 = 0;
const TAG_RECORD: i32 = 1;

/// Root drains its send-request array whenever outstanding requests reach
/// this many peers, each holding two requests (job id + record), bounding
/// root memory pressure on very large allocations (spec §4.4).
const CONCURRENCY_WINDOW_PEERS: usize = 512;

const CONTROL_LEN: usize = 13;
const REASON_OK: u8 = 0;
const REASON_FORMAT_OR_IO: u8 = 1;
const REASON_CAPACITY: u8 = 2;

/// What the partitioner decided for the calling rank.
pub enum PartitionResult<L> {
	/// `CRAM_FILE` was unset: the partitioner never ran a single collective
	/// operation. Callers should leave the global world untouched.
	Disabled,
	/// This rank's index is `>= total_procs`: it has no job, has already
	/// reached the barrier, and should finalize and exit 0.
	Inactive,
	/// This rank owns `job` under `job_id`, and `local_world` is its
	/// communicator split for that sub-job.
	Active { job_id: u32, job: JobDescriptor, local_world: L },
}

/// Runs the full collective protocol of spec §4.4 on `comm`. `container_path`
/// is `None` when `CRAM_FILE` is unset (§6): the partitioner is skipped
/// entirely and every rank gets [`PartitionResult::Disabled`] without
/// calling into `comm` at all.
///
/// Every rank in `comm` must call this exactly once, in the same order
/// relative to any other collective operation on `comm` (spec §5).
pub fn partition<C: Comm>(
	comm: &C,
	container_path: Option<&Path>,
	buffer_size: usize,
) -> Result<PartitionResult<C::Local>> {
	let Some(path) = container_path else {
		return Ok(PartitionResult::Disabled);
	};

	let root = 0;
	let rank = comm.rank();
	let n = comm.size();

	// Step 1+2: root opens and validates the container, then broadcasts a
	// fixed-size control message carrying either an abort signal or the
	// header fields every rank needs (`max_job_size` in particular, so
	// every rank can size its record buffer before the next broadcast).
	let mut reader_slot: Option<ContainerReader> = None;
	let mut control = [0u8; CONTROL_LEN];
	if rank == root {
		match open_and_validate(path, buffer_size, n) {
			Ok(reader) => {
				control[0] = REASON_OK;
				control[1..5].copy_from_slice(&reader.header().total_procs.to_be_bytes());
				control[5..9].copy_from_slice(&reader.header().max_job_size.to_be_bytes());
				control[9..13].copy_from_slice(&reader.header().num_jobs.to_be_bytes());
				reader_slot = Some(reader);
			}
			Err(Error::Capacity { total_procs, allocation_size }) => {
				log::error!(
					"cram: container requests {} processes but the allocation has only {}",
					total_procs,
					allocation_size
				);
				control[0] = REASON_CAPACITY;
				control[1..5].copy_from_slice(&total_procs.to_be_bytes());
			}
			Err(e) => {
				log::error!("cram: failed to open container {}: {}", path.display(), e);
				control[0] = REASON_FORMAT_OR_IO;
			}
		}
	}
	comm.broadcast(root, &mut control);

	let reason = control[0];
	let total_procs = u32::from_be_bytes(control[1..5].try_into().unwrap());
	if reason != REASON_OK {
		return Err(match reason {
			REASON_CAPACITY => Error::Capacity { total_procs, allocation_size: n },
			_ => Error::TruncatedRecord,
		});
	}
	let max_job_size = u32::from_be_bytes(control[5..9].try_into().unwrap()) as usize;
	let num_jobs = u32::from_be_bytes(control[9..13].try_into().unwrap());

	// Step 3: root reads record 0 and broadcasts it verbatim (padded to
	// `max_job_size`); every rank decompresses it independently.
	let mut record0 = vec![0u8; max_job_size];
	if rank == root {
		let reader = reader_slot.as_mut().expect("root validated the container above");
		let mut scratch = Vec::new();
		let (len, _) = reader.next_into(&mut scratch)?;
		record0[..len].copy_from_slice(&scratch);
	}
	comm.broadcast(root, &mut record0);
	let first_job = codec::decode_base(&record0)?;

	// Step 4: every rank decides locally whether it belongs to job 0. Job 0
	// always occupies the contiguous range starting at rank 0, so the root
	// is always a member of it — but the root still has to run steps 5-6
	// below to serve every *other* rank's job, so unlike every other job-0
	// rank it cannot short-circuit here.
	let in_job0 = (rank as u32) < first_job.num_procs;

	// Steps 5-6: root walks the remaining records, pushing each one to the
	// contiguous rank range that owns it; every rank not already known to
	// be in job 0 posts a matching pair of receives.
	let mut my_job_id: Option<u32> = None;
	let mut my_record: Option<Vec<u8>> = None;

	if rank == root {
		let reader = reader_slot.as_mut().expect("root validated the container above");
		let mut requests: Vec<Box<dyn crate::comm::Request>> = Vec::new();
		let mut low = first_job.num_procs;
		let mut buf = Vec::new();
		for job_id in 1..num_jobs {
			let (len, job_procs) = reader.next_into(&mut buf)?;
			let high = low + job_procs;
			for dest in low..high {
				let id_bytes = (job_id as i32).to_be_bytes().to_vec();
				requests.push(comm.isend(dest as i32, TAG_JOB_ID, id_bytes));
				requests.push(comm.isend(dest as i32, TAG_RECORD, buf[..len].to_vec()));
				if requests.len() >= CONCURRENCY_WINDOW_PEERS * 2 {
					drain(&mut requests);
				}
			}
			low = high;
		}
		for dest in total_procs..(n as u32) {
			let id_bytes = (-1i32).to_be_bytes().to_vec();
			requests.push(comm.isend(dest as i32, TAG_JOB_ID, id_bytes));
			if requests.len() >= CONCURRENCY_WINDOW_PEERS * 2 {
				drain(&mut requests);
			}
		}
		drain(&mut requests);
	} else if !in_job0 {
		let id_bytes = comm.irecv(root, TAG_JOB_ID, 4).wait();
		let id = i32::from_be_bytes(id_bytes.try_into().map_err(|_| Error::TruncatedRecord)?);
		if id >= 0 {
			my_job_id = Some(id as u32);
			my_record = Some(comm.irecv(root, TAG_RECORD, max_job_size).wait());
		}
	}

	// Step 7: everyone reaches the barrier, active or not.
	comm.barrier();

	if in_job0 {
		let local_world = comm.split(Some(0));
		return Ok(finish(0, first_job, local_world));
	}

	match my_job_id {
		Some(job_id) => {
			let record = my_record.expect("an active rank always receives its record");
			let job = codec::decode_delta(&record, &first_job)?;
			let local_world = comm.split(Some(job_id as i32));
			Ok(finish(job_id, job, local_world))
		}
		None => {
			comm.split(None);
			Ok(PartitionResult::Inactive)
		}
	}
}

fn finish<L>(job_id: u32, job: JobDescriptor, local_world: Option<L>) -> PartitionResult<L> {
	PartitionResult::Active {
		job_id,
		job,
		local_world: local_world.expect("an active rank's split always yields a local world"),
	}
}

fn drain(requests: &mut Vec<Box<dyn crate::comm::Request>>) {
	for req in requests.drain(..) {
		req.wait();
	}
}

fn open_and_validate(path: &Path, buffer_size: usize, allocation_size: i32) -> Result<ContainerReader> {
	let reader = ContainerReader::open_with_buffer(path, buffer_size)?;
	if reader.header().total_procs > allocation_size as u32 {
		return Err(Error::Capacity { total_procs: reader.header().total_procs, allocation_size });
	}
	Ok(reader)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::comm::inproc;
	use crate::container::write_container;
	use crate::job::{JobDescriptor, RawString};
	use std::path::PathBuf;
	use std::sync::atomic::{AtomicU64, Ordering};
	use std::thread;

	fn tmp_container(jobs: &[JobDescriptor]) -> PathBuf {
		static COUNTER: AtomicU64 = AtomicU64::new(0);
		let n = COUNTER.fetch_add(1, Ordering::Relaxed);
		let path = std::env::temp_dir().join(format!("cram-partition-test-{}-{}.bin", std::process::id(), n));
		write_container(&path, jobs).unwrap();
		path
	}

	fn job(num_procs: u32, dir: &str, env: &[(&str, &str)]) -> JobDescriptor {
		let env = env.iter().map(|(k, v)| (RawString::from(*k), RawString::from(*v))).collect();
		JobDescriptor::new(num_procs, RawString::from(dir), vec![RawString::from("app")], env).unwrap()
	}

	fn run_all(n: i32, path: PathBuf) -> Vec<Result<(i32, PartitionResult<inproc::LocalWorldInfo>)>> {
		let comms = inproc::world(n);
		let handles: Vec<_> = comms
			.into_iter()
			.map(|comm| {
				let path = path.clone();
				thread::spawn(move || {
					let rank = comm.rank();
					let result = partition(&comm, Some(path.as_path()), 4096);
					result.map(|r| (rank, r))
				})
			})
			.collect();
		let results = handles.into_iter().map(|h| h.join().unwrap()).collect();
		let _ = std::fs::remove_file(&path);
		results
	}

	#[test]
	fn one_job_exact_fit() {
		let jobs = vec![job(4, "/tmp", &[("A", "1"), ("B", "2")])];
		let path = tmp_container(&jobs);
		let results = run_all(4, path);
		for r in results {
			let (_, outcome) = r.unwrap();
			match outcome {
				PartitionResult::Active { job_id, job, local_world } => {
					assert_eq!(job_id, 0);
					assert_eq!(job.working_dir, RawString::from("/tmp"));
					assert_eq!(local_world.color, 0);
				}
				_ => panic!("expected every rank to be active"),
			}
		}
	}

	#[test]
	fn two_jobs_with_delta() {
		let jobs = vec![job(2, "/a", &[("X", "p"), ("Y", "q")]), job(3, "/b", &[("Y", "r"), ("Z", "s")])];
		let path = tmp_container(&jobs);
		let results = run_all(5, path);
		for r in results {
			let (rank, outcome) = r.unwrap();
			match outcome {
				PartitionResult::Active { job_id, job, .. } if rank < 2 => {
					assert_eq!(job_id, 0);
					assert_eq!(job, jobs[0]);
				}
				PartitionResult::Active { job_id, job, .. } => {
					assert_eq!(job_id, 1);
					assert_eq!(job, jobs[1]);
				}
				PartitionResult::Inactive => panic!("rank {} should be active", rank),
				PartitionResult::Disabled => unreachable!(),
			}
		}
	}

	#[test]
	fn oversubscription_marks_excess_ranks_inactive() {
		let jobs = vec![job(4, "/tmp", &[])];
		let path = tmp_container(&jobs);
		let results = run_all(6, path);
		for r in results {
			let (rank, outcome) = r.unwrap();
			if rank < 4 {
				assert!(matches!(outcome, PartitionResult::Active { job_id: 0, .. }));
			} else {
				assert!(matches!(outcome, PartitionResult::Inactive));
			}
		}
	}

	#[test]
	fn undersubscription_aborts() {
		let jobs = vec![job(4, "/tmp", &[])];
		let path = tmp_container(&jobs);
		let results = run_all(3, path);
		for r in results {
			assert!(matches!(r, Err(Error::Capacity { total_procs: 4, allocation_size: 3 })));
		}
	}

	#[test]
	fn disabled_when_no_container_configured() {
		let comms = inproc::world(2);
		let handles: Vec<_> = comms
			.into_iter()
			.map(|comm| thread::spawn(move || partition(&comm, None, 4096).unwrap()))
			.collect();
		for h in handles {
			assert!(matches!(h.join().unwrap(), PartitionResult::Disabled));
		}
	}
}
