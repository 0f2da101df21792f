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

// Simulates `N` ranks cooperating inside one OS process, so the
// partitioner's collective logic (spec §4.4, tested properties in §8) can
// be exercised without a system MPI installation. Each simulated rank is
// one OS thread; broadcasts rendezvous through a shared slot guarded by a
// pair of reusable barriers, and point-to-point messages go over a
// per-destination channel.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};

use super::{Comm, Request};

struct Shared {
	size: i32,
	bcast_slot: Mutex<Vec<u8>>,
	enter_barrier: Barrier,
	leave_barrier: Barrier,
	senders: Vec<Mutex<Sender<(i32, Vec<u8>)>>>,
	/// Scratch slot for `split`: each rank publishes the color it split by
	/// (or `None` as `i32::MIN`) here before the others read it back, which
	/// is what lets `split` renumber ranks 0..k within their new group
	/// instead of keeping their global rank, matching real `MPI_Comm_split`.
	split_colors: Mutex<Vec<i32>>,
}

/// One simulated rank's handle onto the shared world. Must be driven from
/// its own thread — `receiver` is exclusively owned, matching the real
/// constraint that only the owning rank ever reads its own mailbox.
pub struct InProcComm {
	shared: Arc<Shared>,
	rank: i32,
	receiver: Receiver<(i32, Vec<u8>)>,
}

/// Builds `size` linked `InProcComm` handles, one per simulated rank. Spawn
/// one thread per handle and run the partitioner on each to exercise the
/// collective protocol end to end.
pub fn world(size: i32) -> Vec<InProcComm> {
	assert!(size > 0);
	let mut senders = Vec::with_capacity(size as usize);
	let mut receivers = Vec::with_capacity(size as usize);
	for _ in 0..size {
		let (tx, rx) = mpsc::channel();
		senders.push(Mutex::new(tx));
		receivers.push(rx);
	}
	let shared = Arc::new(Shared {
		size,
		bcast_slot: Mutex::new(Vec::new()),
		enter_barrier: Barrier::new(size as usize),
		leave_barrier: Barrier::new(size as usize),
		senders,
		split_colors: Mutex::new(vec![i32::MIN; size as usize]),
	});
	receivers
		.into_iter()
		.enumerate()
		.map(|(rank, receiver)| InProcComm { shared: shared.clone(), rank: rank as i32, receiver })
		.collect()
}

struct InProcRequest(Vec<u8>);

impl Request for InProcRequest {
	fn wait(self: Box<Self>) -> Vec<u8> {
		self.0
	}
}

/// The result of splitting an `InProcComm`: no further collective
/// capability, just the bookkeeping the per-process setup and tests need
/// (rank/size within the new group, and the color it was split by).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LocalWorldInfo {
	pub rank: i32,
	pub size: i32,
	pub color: i32,
}

impl Comm for InProcComm {
	type Local = LocalWorldInfo;

	fn rank(&self) -> i32 {
		self.rank
	}

	fn size(&self) -> i32 {
		self.shared.size
	}

	fn broadcast(&self, root: i32, buf: &mut [u8]) {
		if self.rank == root {
			*self.shared.bcast_slot.lock().unwrap() = buf.to_vec();
		}
		self.shared.enter_barrier.wait();
		if self.rank != root {
			let slot = self.shared.bcast_slot.lock().unwrap();
			buf.copy_from_slice(&slot);
		}
		self.shared.leave_barrier.wait();
	}

	fn isend(&self, dest: i32, _tag: i32, buf: Vec<u8>) -> Box<dyn Request> {
		let tx = self.shared.senders[dest as usize].lock().unwrap();
		tx.send((self.rank, buf)).expect("receiving rank dropped its mailbox");
		Box::new(InProcRequest(Vec::new()))
	}

	fn irecv(&self, _source: i32, _tag: i32, _max_len: usize) -> Box<dyn Request> {
		let (_from, buf) = self.receiver.recv().expect("sending rank never delivered a message");
		Box::new(InProcRequest(buf))
	}

	fn split(&self, color: Option<i32>) -> Option<LocalWorldInfo> {
		// Real `MPI_Comm_split` renumbers ranks 0..k within each new group
		// in global-rank order, so a rendezvous is needed here even though
		// every rank already knows its own color: nobody knows anyone
		// else's color (or how many ranks share theirs) without asking.
		{
			let mut slot = self.shared.split_colors.lock().unwrap();
			slot[self.rank as usize] = color.unwrap_or(i32::MIN);
		}
		self.shared.enter_barrier.wait();
		let colors = self.shared.split_colors.lock().unwrap().clone();
		self.shared.leave_barrier.wait();

		color.map(|color| {
			let mut local_rank = 0;
			let mut size = 0;
			for (global_rank, &c) in colors.iter().enumerate() {
				if c != color {
					continue;
				}
				if (global_rank as i32) < self.rank {
					local_rank += 1;
				}
				size += 1;
			}
			LocalWorldInfo { rank: local_rank, size, color }
		})
	}

	fn barrier(&self) {
		self.shared.enter_barrier.wait();
		self.shared.leave_barrier.wait();
	}

	fn finalizer(&self) -> fn() {
		// No real runtime backs this transport, so there is nothing to
		// finalize.
		|| {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;

	#[test]
	fn broadcast_delivers_roots_buffer_to_everyone() {
		let comms = world(4);
		let handles: Vec<_> = comms
			.into_iter()
			.map(|comm| {
				thread::spawn(move || {
					let mut buf = if comm.rank() == 0 { vec![9, 9, 9] } else { vec![0, 0, 0] };
					comm.broadcast(0, &mut buf);
					buf
				})
			})
			.collect();
		for h in handles {
			assert_eq!(h.join().unwrap(), vec![9, 9, 9]);
		}
	}

	#[test]
	fn split_renumbers_ranks_within_each_color_group() {
		// Ranks 0,1 -> color 0; ranks 2,3,4 -> color 1. Global rank 2 must
		// become local rank 0 within color 1, not keep its global index.
		let comms = world(5);
		let handles: Vec<_> = comms
			.into_iter()
			.map(|comm| {
				thread::spawn(move || {
					let global_rank = comm.rank();
					let color = if global_rank < 2 { 0 } else { 1 };
					let local = comm.split(Some(color)).unwrap();
					(global_rank, local)
				})
			})
			.collect();
		let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		for (global_rank, local) in results {
			let (expected_local_rank, expected_size) = match global_rank {
				0 => (0, 2),
				1 => (1, 2),
				2 => (0, 3),
				3 => (1, 3),
				4 => (2, 3),
				_ => unreachable!(),
			};
			assert_eq!(local.rank, expected_local_rank, "global rank {}", global_rank);
			assert_eq!(local.size, expected_size, "global rank {}", global_rank);
		}
	}

	#[test]
	fn point_to_point_delivers_payload() {
		let comms = world(2);
		let mut iter = comms.into_iter();
		let root = iter.next().unwrap();
		let leaf = iter.next().unwrap();
		let sender = thread::spawn(move || {
			root.isend(1, 0, vec![1, 2, 3]).wait();
		});
		let got = leaf.irecv(0, 0, 3).wait();
		sender.join().unwrap();
		assert_eq!(got, vec![1, 2, 3]);
	}
}
