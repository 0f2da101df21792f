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

// Per-process setup (spec §4.5): installs an owned job descriptor into the
// current process before the application gains control.

use std::ffi::CString;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::job::{JobDescriptor, ARGV0_SENTINEL};

/// The process-global argv mirror (spec §4.5 step 4, §6 "process-global
/// argument mirror"): published once at setup time so language bindings
/// whose command-line accessors cannot be reached through the standard
/// argument vector can still return the sub-job's arguments. Guarded by a
/// `Mutex` in the teacher's style rather than left to a raw static, even
/// though it is written exactly once before the application starts and read
/// many times after.
static ARGV_MIRROR: OnceLock<Mutex<Vec<CString>>> = OnceLock::new();

/// Installs `job` into the calling process: chdir, argv replacement, and a
/// force-overwrite of the environment. Every step is best-effort beyond the
/// chdir/setenv failures spec §4.5/§7 explicitly call out as non-fatal —
/// the application is left to observe and fail on its own terms.
pub fn install(job: &JobDescriptor, original_argv0: Option<&str>) {
	if let Err(e) = std::env::set_current_dir(job.working_dir.to_string()) {
		log::warn!("cram: chdir to {} failed: {}", job.working_dir, e);
	}

	let mut argv: Vec<CString> = job
		.args
		.iter()
		.enumerate()
		.map(|(i, a)| {
			let bytes = if i == 0 && a.as_bytes() == ARGV0_SENTINEL.as_bytes() {
				original_argv0.map(|s| s.as_bytes().to_vec()).unwrap_or_else(|| a.as_bytes().to_vec())
			} else {
				a.as_bytes().to_vec()
			};
			CString::new(bytes).unwrap_or_else(|_| CString::new("").unwrap())
		})
		.collect();
	if argv.is_empty() {
		argv.push(CString::new("").unwrap());
	}

	for (k, v) in &job.env {
		// SAFETY: setup runs single-threaded, before the application (and
		// any of its threads) has started, per spec §5's "mutated exactly
		// once per process, during setup, before the application gains
		// control".
		unsafe {
			std::env::set_var(k.to_string(), v.to_string());
		}
	}

	let mirror = ARGV_MIRROR.get_or_init(|| Mutex::new(Vec::new()));
	*mirror.lock() = argv;
}

/// Returns the process-global argv mirror published by [`install`], for
/// runtime-environment language bindings that cannot see a rewritten
/// `argv` through the standard mechanism. Empty before `install` runs.
pub fn mirrored_argv() -> Vec<CString> {
	ARGV_MIRROR.get().map(|m| m.lock().clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::RawString;

	#[test]
	fn substitutes_sentinel_with_original_argv0() {
		let job = JobDescriptor::new(
			1,
			RawString::from(std::env::temp_dir().to_string_lossy().to_string()),
			vec![RawString::from(ARGV0_SENTINEL), RawString::from("--flag")],
			vec![],
		)
		.unwrap();
		install(&job, Some("/usr/bin/real-exe"));
		let argv = mirrored_argv();
		assert_eq!(argv[0].to_str().unwrap(), "/usr/bin/real-exe");
		assert_eq!(argv[1].to_str().unwrap(), "--flag");
	}

	#[test]
	fn overwrites_environment_variables() {
		let job = JobDescriptor::new(
			1,
			RawString::from(std::env::temp_dir().to_string_lossy().to_string()),
			vec![RawString::from("app")],
			vec![(RawString::from("CRAM_TEST_VAR"), RawString::from("installed"))],
		)
		.unwrap();
		install(&job, None);
		assert_eq!(std::env::var("CRAM_TEST_VAR").unwrap(), "installed");
	}
}
