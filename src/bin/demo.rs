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

// Manual smoke test for the partitioner, driven entirely with the
// in-process communicator so it needs no MPI installation to run. Not the
// packer CLI (out of scope) — just enough to see the whole flow once.

use cram::comm::inproc;
use cram::container::write_container;
use cram::job::{JobDescriptor, RawString};
use cram::{launch, Outcome};

fn job(num_procs: u32, dir: &str, env: &[(&str, &str)]) -> JobDescriptor {
	let env = env.iter().map(|(k, v)| (RawString::from(*k), RawString::from(*v))).collect();
	JobDescriptor::new(num_procs, RawString::from(dir), vec![RawString::from("app")], env).unwrap()
}

fn main() {
	env_logger::init();

	let jobs = vec![
		job(2, "/tmp", &[("X", "p"), ("Y", "q")]),
		job(3, "/tmp", &[("Y", "r"), ("Z", "s")]),
	];
	let container_path = std::env::temp_dir().join("cram-demo-container.bin");
	write_container(&container_path, &jobs).expect("writing demo container");
	// SAFETY: single-threaded at this point in `main`, before any worker
	// thread has been spawned.
	unsafe {
		std::env::set_var("CRAM_FILE", &container_path);
		std::env::set_var("CRAM_OUTPUT", "SYSTEM");
	}

	let allocation_size = 5;
	let comms = inproc::world(allocation_size);
	let handles: Vec<_> = comms
		.into_iter()
		.map(|comm| {
			std::thread::spawn(move || {
				let rank = comm.rank();
				match launch(&comm, Some("demo")) {
					Ok(Outcome::Active { job_id, job, .. }) => {
						println!("rank {} -> job {} in {}", rank, job_id, job.working_dir);
					}
					Ok(Outcome::Disabled) => println!("rank {} -> disabled", rank),
					Err(e) => eprintln!("rank {} -> aborted: {}", rank, e),
				}
			})
		})
		.collect();

	for h in handles {
		h.join().unwrap();
	}

	let _ = std::fs::remove_file(&container_path);
}
