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

//! Cram packs many small parallel jobs into a single large parallel
//! allocation. At launch time, a single oversubscribed job reads a
//! container of packed job descriptors, partitions its process pool into
//! per-job sub-pools, rewrites each process's environment to match its
//! assigned job, and replaces the global communicator with a private
//! "world" so unmodified applications behave as if launched standalone.
//!
//! This crate is the core described in the design: the container codec
//! ([`codec`], [`container`]), the launch-time partitioner ([`partition`]),
//! and the runtime shim ([`setup`], [`shim`]). The packer's command-line
//! surface and the inspector are out of scope — out-of-tree binaries that
//! need only the format can depend on this crate for [`codec`] and
//! [`container`] alone.

pub mod codec;
pub mod comm;
pub mod config;
pub mod container;
pub mod error;
pub mod job;
pub mod partition;
pub mod setup;
pub mod shim;

use comm::{Comm, LocalRank};
use config::Config;
use error::Result;
use job::JobDescriptor;
use partition::PartitionResult;

/// What [`launch`] did for the calling rank. Unlike [`PartitionResult`],
/// there is no `Inactive` variant: an inactive rank never returns from
/// `launch` (it calls [`shim::finalize_inactive`] and exits first).
pub enum Outcome<L> {
	/// `CRAM_FILE` was unset: nothing was touched, `local_world` aliases
	/// the global world the caller already had.
	Disabled,
	Active { job_id: u32, job: JobDescriptor, local_world: L },
}

/// Runs the whole launch sequence for the calling rank: reads the
/// configuration (spec §6), runs the collective partitioner (spec §4.4),
/// installs the owned job descriptor into the process (spec §4.5), and
/// wires up I/O redirection and crash containment (spec §4.6).
///
/// `comm` must be the global world communicator, and every rank in it must
/// call `launch` exactly once, before any other collective operation and
/// before the application's own runtime entry point. `original_argv0` is
/// the launcher's own `argv[0]`, substituted in for the `"<exe>"` sentinel
/// (spec §4.5 step 2).
///
/// Returns `Ok(Outcome::Disabled)` when Cram is configured off. Returns
/// `Err` when the partitioner aborted the allocation (bad container,
/// capacity mismatch, I/O failure) — the caller should treat this as fatal
/// to the whole allocation, per spec §7. Never returns for an inactive
/// rank, which exits 0 from inside this call.
pub fn launch<C: Comm>(comm: &C, original_argv0: Option<&str>) -> Result<Outcome<C::Local>>
where
	C::Local: LocalRank,
{
	let config = Config::from_env();

	let result = partition::partition(comm, config.file.as_deref(), config.buffer_size)?;

	match result {
		PartitionResult::Disabled => {
			log::info!("cram: CRAM_FILE unset, running unmodified");
			Ok(Outcome::Disabled)
		}
		PartitionResult::Inactive => {
			shim::finalize_inactive(comm.finalizer());
		}
		PartitionResult::Active { job_id, job, local_world } => {
			setup::install(&job, original_argv0);
			let redirection = shim::apply_redirection(config.output, job_id, local_world.local_rank());
			shim::install_crash_handlers(
				job_id,
				local_world.local_rank(),
				redirection.preserved_stderr,
				comm.finalizer(),
			);
			Ok(Outcome::Active { job_id, job, local_world })
		}
	}
}
