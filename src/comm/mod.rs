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

// The collective transport the partitioner (§4.4) is written against.
//
// Spec.md describes the partitioner's protocol — broadcast, targeted
// non-blocking point-to-point, a communicator split keyed by job id, and a
// barrier — without naming a transport, since the tool this models is a
// launch-time packer for oversubscribed MPI jobs. `Comm` is the seam: the
// real backend (`mpi`, feature `mpi-backend`) adapts `mpi` crate
// communicators to it, and `inproc` simulates ranks inside one process so
// the partitioner's logic is unit-testable without an MPI runtime.

pub mod inproc;
#[cfg(feature = "mpi-backend")]
pub mod mpi_backend;

/// A pending non-blocking send or receive. `wait` blocks the calling rank
/// until the operation completes; for a receive it returns the bytes that
/// arrived, for a send an empty vector.
pub trait Request {
	fn wait(self: Box<Self>) -> Vec<u8>;
}

/// The subset of collective and point-to-point operations the partitioner
/// needs. A `Comm` represents one rank's view of one communicator.
///
/// `Local` is the type `split` hands back — the "local world" the spec
/// talks about. It is an associated type rather than `Box<dyn Comm>` because
/// what it actually IS differs by backend: a real `mpi::topology::
/// UserCommunicator` for the `mpi-backend` feature, handed off to the
/// unmodified application from there on (out of this crate's scope); a
/// plain rank/size/color record for `inproc`, enough to assert the
/// partitioner's coverage and content-parity invariants in tests.
pub trait Comm {
	type Local;

	fn rank(&self) -> i32;
	fn size(&self) -> i32;

	/// Broadcasts `buf` from `root` to every rank in the communicator,
	/// in place. `buf`'s length is the same on every rank (the partitioner
	/// always broadcasts fixed-size payloads: the header's `max_job_size`,
	/// then job 0's record padded to that size).
	fn broadcast(&self, root: i32, buf: &mut [u8]);

	/// Posts a non-blocking send of `buf` to `dest`, tagged `tag`.
	fn isend(&self, dest: i32, tag: i32, buf: Vec<u8>) -> Box<dyn Request>;

	/// Posts a non-blocking receive of up to `max_len` bytes from `source`,
	/// tagged `tag`.
	fn irecv(&self, source: i32, tag: i32, max_len: usize) -> Box<dyn Request>;

	/// Splits the communicator by `color`: ranks sharing the same `Some`
	/// color end up in the same new communicator, in rank order. `None`
	/// excludes the calling rank from the new communicator entirely —
	/// used for inactive ranks (spec §4.4 step 7), which do not belong to
	/// any `local_world`.
	fn split(&self, color: Option<i32>) -> Option<Self::Local>;

	/// Blocks until every rank in the communicator has called `barrier`.
	/// Always called on the original (global) communicator, never on a
	/// split-off `Local` — inactive ranks have no `Local` to call it on.
	fn barrier(&self);

	/// Returns a capture-free function that finalizes the underlying
	/// runtime (`MPI_Finalize` for the `mpi-backend` feature; a no-op for
	/// `inproc`), idempotent under repeated calls. A plain `fn()` rather
	/// than an instance method because every rank-exit path spec §4.4 step
	/// 7 and §4.6 name — the inactive-rank finalize, the crash handler, and
	/// the exit hook — must be able to call it, and the latter two run from
	/// a signal handler / `atexit` hook with no `Comm` reachable, only
	/// process-global state.
	fn finalizer(&self) -> fn();
}

/// The one thing `cram::launch` needs out of a split-off `Local` world: its
/// rank within that sub-job, for I/O redirection and crash reporting
/// (spec §4.6). Implemented separately from `Comm` itself because `Local`
/// is not required to support any further collective operation in this
/// crate's scope — the unmodified application owns it from here on.
pub trait LocalRank {
	fn local_rank(&self) -> i32;
}

impl LocalRank for inproc::LocalWorldInfo {
	fn local_rank(&self) -> i32 {
		self.rank
	}
}
