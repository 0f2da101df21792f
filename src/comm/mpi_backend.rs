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

// Production `Comm` backend: adapts `mpi` (rsmpi)'s communicators to the
// trait the partitioner is written against. Gated behind the `mpi-backend`
// feature because it links against a system MPI installation via rsmpi's
// build script; the default build and the whole test suite never touch
// this module.

use std::sync::atomic::{AtomicBool, Ordering};

use mpi::request::{Request as MpiRequestHandle, StaticScope};
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;

use super::{Comm, Request};

/// Wraps any rsmpi communicator — the global world, or a communicator
/// produced by an earlier split — uniformly, since rsmpi represents both as
/// `SimpleCommunicator`.
pub struct MpiComm(pub SimpleCommunicator);

impl MpiComm {
	/// The global communicator for this MPI job, per spec §4.4's `root = 0`
	/// over the whole allocation.
	pub fn world() -> MpiComm {
		let universe = mpi::initialize().expect("MPI_Init failed or was already called");
		let world = universe.world();
		// `finalize_mpi` (reached through `Comm::finalizer`) now owns the
		// single `MPI_Finalize` call every rank-exit path in this crate
		// makes (spec §4.4 step 7, §4.6). Forgetting `Universe` here only
		// suppresses *its* `Drop`-time finalize so the two don't race or
		// double-finalize — it does not, by itself, skip finalization.
		std::mem::forget(universe);
		MpiComm(world)
	}
}

/// Guards against calling `MPI_Finalize` more than once: every rank-exit
/// path (inactive rank, crash handler, exit hook) reaches for the same
/// `finalize_mpi`, and at most one of them should actually run it.
static MPI_FINALIZED: AtomicBool = AtomicBool::new(false);

/// Finalizes MPI exactly once, however this process exits. Deliberately a
/// single raw FFI call guarded by a compare-and-swap rather than going
/// through `Universe`'s `Drop` impl: this must be callable from inside a
/// signal handler (spec §4.6's crash path), where taking a Rust-level lock
/// or allocating is not safe.
fn finalize_mpi() {
	if MPI_FINALIZED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
		unsafe {
			mpi::ffi::MPI_Finalize();
		}
	}
}

/// Owns a send buffer for the lifetime of the in-flight request and
/// reclaims (and frees) it in `wait`, rather than leaking it permanently.
/// `ptr` is the only live reference to the allocation from the moment it is
/// created until `wait` reconstructs the `Box` — MPI holds a `&'static mut`
/// view of the same memory in between via `StaticScope`, but never outlives
/// `request.wait()` returning.
struct PendingSend {
	request: MpiRequestHandle<'static, [u8]>,
	ptr: *mut [u8],
}

/// Same ownership story as `PendingSend`, but for a receive buffer: rsmpi's
/// `*_into`-style receive borrows the buffer rather than handing back an
/// owned one, so the bytes have to be recovered from `ptr` after `wait`,
/// not out of `request.wait()`'s return value.
struct PendingRecv {
	request: MpiRequestHandle<'static, [u8]>,
	ptr: *mut [u8],
}

impl Request for PendingSend {
	fn wait(self: Box<Self>) -> Vec<u8> {
		let PendingSend { request, ptr } = *self;
		let _status = request.wait();
		// SAFETY: the request completed, so MPI has finished reading from
		// `ptr` and this is once again the sole owner of the allocation.
		drop(unsafe { Box::from_raw(ptr) });
		Vec::new()
	}
}

impl Request for PendingRecv {
	fn wait(self: Box<Self>) -> Vec<u8> {
		let PendingRecv { request, ptr } = *self;
		let _status = request.wait();
		// SAFETY: the request completed, so MPI has finished writing into
		// `ptr` and this is once again the sole owner of the allocation.
		unsafe { Box::from_raw(ptr) }.into_vec()
	}
}

impl super::LocalRank for SimpleCommunicator {
	fn local_rank(&self) -> i32 {
		self.rank()
	}
}

impl Comm for MpiComm {
	type Local = SimpleCommunicator;

	fn rank(&self) -> i32 {
		self.0.rank()
	}

	fn size(&self) -> i32 {
		self.0.size()
	}

	fn broadcast(&self, root: i32, buf: &mut [u8]) {
		let root_process = self.0.process_at_rank(root);
		root_process.broadcast_into(buf);
	}

	fn isend(&self, dest: i32, tag: i32, buf: Vec<u8>) -> Box<dyn Request> {
		// `StaticScope` is what rsmpi offers for a request whose buffer
		// outlives the stack frame that posted it, which is exactly our
		// case: the partitioner's concurrency window holds many in-flight
		// sends across several loop iterations, not one lexical scope. The
		// buffer is reclaimed (not leaked) by `PendingSend::wait` once the
		// request completes — see the `ptr` field's safety note above.
		let ptr: *mut [u8] = Box::into_raw(buf.into_boxed_slice());
		// SAFETY: `ptr` is reclaimed via `Box::from_raw` in `PendingSend::wait`,
		// which only runs after `request.wait()` returns below — until then
		// this reference is the only one in play.
		let view: &'static mut [u8] = unsafe { &mut *ptr };
		let request = self.0.process_at_rank(dest).immediate_send_with_tag(StaticScope, view, tag);
		Box::new(PendingSend { request, ptr })
	}

	fn irecv(&self, source: i32, tag: i32, max_len: usize) -> Box<dyn Request> {
		let ptr: *mut [u8] = Box::into_raw(vec![0u8; max_len].into_boxed_slice());
		// SAFETY: see `isend` above; reclaimed in `PendingRecv::wait`.
		let view: &'static mut [u8] = unsafe { &mut *ptr };
		let request =
			self.0.process_at_rank(source).immediate_receive_into_with_tag(StaticScope, view, tag);
		Box::new(PendingRecv { request, ptr })
	}

	fn split(&self, color: Option<i32>) -> Option<SimpleCommunicator> {
		match color {
			Some(c) => self.0.split_by_color(Color::with_value(c)),
			None => self.0.split_by_color(Color::undefined()),
		}
	}

	fn barrier(&self) {
		self.0.barrier();
	}

	fn finalizer(&self) -> fn() {
		finalize_mpi
	}
}
