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

// The runtime shim (spec §4.6): world substitution, per-mode I/O
// redirection, and crash containment so one rank's catastrophe doesn't tear
// down the whole allocation.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use crate::config::OutputMode;

/// What an intercepted entry point saw as its communicator argument. The
/// shim only ever needs to tell "this is literally the global-world
/// constant" apart from "some other, already-correct, communicator" — it
/// never needs to inspect the other case's contents.
pub enum CommArg<'a, L> {
	Global,
	Other(&'a L),
}

/// World substitution (spec §4.6): resolves an intercepted entry point's
/// communicator argument, swapping the global-world constant for
/// `local_world` and passing anything else through untouched. This is the
/// whole of the "world transparency" invariant in spec §8 — if the argument
/// didn't reference the global world, behavior is unchanged; if it did,
/// it's as if `local_world` had been passed.
pub fn resolve<'a, L>(arg: CommArg<'a, L>, local_world: &'a L) -> &'a L {
	match arg {
		CommArg::Global => local_world,
		CommArg::Other(other) => other,
	}
}

/// A redirection applied to the process's stdout/stderr, keeping a separate
/// handle to the stream that existed before redirection so crash reports
/// can still reach a real terminal or log collector even when the
/// redirected streams point at `/dev/null`.
pub struct Redirection {
	pub preserved_stderr: RawFd,
}

/// Applies the I/O redirection policy for `mode` (spec §4.6, file naming in
/// §6). `local_rank` is the rank's index within its own sub-job (0 for the
/// sub-job's own rank 0). Must run after the per-process chdir (spec §4.5
/// step 1) so the output files land in the sub-job's own working directory.
pub fn apply_redirection(mode: OutputMode, job_id: u32, local_rank: i32) -> Redirection {
	let preserved_stderr = unsafe { libc::dup(libc::STDERR_FILENO) };

	match mode {
		OutputMode::System => {}
		OutputMode::None => {
			redirect_both_to(&null_path());
		}
		OutputMode::Rank0 => {
			if local_rank == 0 {
				redirect_both_to_named(&format!("cram.{}.out", job_id), &format!("cram.{}.err", job_id));
			} else {
				redirect_both_to(&null_path());
			}
		}
		OutputMode::All => {
			redirect_both_to_named(
				&format!("cram.{}.{}.out", job_id, local_rank),
				&format!("cram.{}.{}.err", job_id, local_rank),
			);
		}
	}

	Redirection { preserved_stderr }
}

fn null_path() -> CString {
	CString::new("/dev/null").unwrap()
}

fn redirect_both_to(path: &CString) {
	redirect_fd(libc::STDOUT_FILENO, path, libc::O_WRONLY);
	redirect_fd(libc::STDERR_FILENO, path, libc::O_WRONLY);
}

fn redirect_both_to_named(out_name: &str, err_name: &str) {
	let out = CString::new(out_name).unwrap();
	let err = CString::new(err_name).unwrap();
	redirect_fd(libc::STDOUT_FILENO, &out, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC);
	redirect_fd(libc::STDERR_FILENO, &err, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC);
}

fn redirect_fd(target: RawFd, path: &CString, flags: libc::c_int) {
	unsafe {
		let fd = libc::open(path.as_ptr(), flags, 0o644);
		if fd < 0 {
			log::warn!("cram: could not open {:?} for redirection", path);
			return;
		}
		if libc::dup2(fd, target) < 0 {
			log::warn!("cram: dup2 onto fd {} failed", target);
		}
		libc::close(fd);
	}
}

// --- Crash isolation (spec §4.6) -------------------------------------------------

static CRASH_JOB_ID: AtomicI32 = AtomicI32::new(-1);
static CRASH_LOCAL_RANK: AtomicI32 = AtomicI32::new(-1);
static CRASH_STDERR_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);
static CRASHED: AtomicBool = AtomicBool::new(false);

/// The runtime's finalize function (spec §4.4 step 7, §4.6), stashed as a
/// bare function-pointer address rather than behind a `Mutex`/`OnceLock` so
/// the signal handler can read it without taking a lock. Zero means "not
/// installed yet"; a real `fn()` is never a null pointer.
static FINALIZE_FN: AtomicUsize = AtomicUsize::new(0);

/// Records the process-global crash-handler state (spec §5: "assigned once
/// at launch, read-only thereafter") and installs the `SIGSEGV` handler and
/// the exit hook that together implement crash containment. `finalize` is
/// [`crate::comm::Comm::finalizer`]'s return value for the communicator this
/// rank launched with, called from both the crash and exit-hook paths so
/// the runtime is torn down before the process exits, per spec. Must be
/// called once per process, after [`apply_redirection`] so `preserved_stderr`
/// is already known, and before the application gains control.
pub fn install_crash_handlers(job_id: u32, local_rank: i32, preserved_stderr: RawFd, finalize: fn()) {
	CRASH_JOB_ID.store(job_id as i32, Ordering::SeqCst);
	CRASH_LOCAL_RANK.store(local_rank, Ordering::SeqCst);
	CRASH_STDERR_FD.store(preserved_stderr, Ordering::SeqCst);
	FINALIZE_FN.store(finalize as usize, Ordering::SeqCst);

	unsafe {
		libc::signal(libc::SIGSEGV, on_crash as libc::sighandler_t);
		libc::atexit(on_exit_hook);
	}
}

/// Calls the finalize function installed by [`install_crash_handlers`], if
/// any. Safe to call from the signal handler: reading the address is a
/// single atomic load, and the function it points to (`finalize_mpi` for
/// the real backend) is itself written to be signal-safe.
fn call_finalize() {
	let addr = FINALIZE_FN.load(Ordering::SeqCst);
	if addr != 0 {
		let f: fn() = unsafe { std::mem::transmute::<usize, fn()>(addr) };
		f();
	}
}

/// Formats `"cram: rank crashed in job <job_id> local rank <local_rank>\n"`
/// into `out`, returning the number of bytes written. Built without any
/// allocation so it can run from the signal handler.
fn format_crash_line(job_id: i32, local_rank: i32, out: &mut [u8; 96]) -> usize {
	use std::io::Write;
	let mut cursor = &mut out[..];
	let _ = write!(cursor, "cram: rank crashed in job {} local rank {}\n", job_id, local_rank);
	96 - cursor.len()
}

extern "C" fn on_crash(_signum: libc::c_int) {
	CRASHED.store(true, Ordering::SeqCst);
	let job_id = CRASH_JOB_ID.load(Ordering::SeqCst);
	let local_rank = CRASH_LOCAL_RANK.load(Ordering::SeqCst);
	let fd = CRASH_STDERR_FD.load(Ordering::SeqCst);
	let mut buf = [0u8; 96];
	let len = format_crash_line(job_id, local_rank, &mut buf);
	unsafe {
		libc::write(fd, buf.as_ptr() as *const libc::c_void, len);
	}
	call_finalize();
	unsafe {
		// `_exit`, not `exit`: skips any remaining atexit hooks (including
		// our own, below) and any destructors that might themselves touch
		// unsound state after a segfault.
		libc::_exit(0);
	}
}

/// Only the signal path (`on_crash`) is expected to actually reach here with
/// `CRASHED` set, since it calls `_exit` directly and `_exit` skips `atexit`
/// hooks entirely. This hook exists for the rarer path where a fatal signal
/// other than the ones cram traps unwinds through libc's normal `exit(3)`:
/// if `CRASHED` was never set, the process is exiting normally and this hook
/// must not touch its exit code or print anything.
extern "C" fn on_exit_hook() {
	if !CRASHED.load(Ordering::SeqCst) {
		return;
	}
	let job_id = CRASH_JOB_ID.load(Ordering::SeqCst);
	let local_rank = CRASH_LOCAL_RANK.load(Ordering::SeqCst);
	let fd = CRASH_STDERR_FD.load(Ordering::SeqCst);
	let mut buf = [0u8; 96];
	let len = format_crash_line(job_id, local_rank, &mut buf);
	unsafe {
		libc::write(fd, buf.as_ptr() as *const libc::c_void, len);
	}
	call_finalize();
	unsafe {
		// Masks whatever exit code the application passed to `exit(3)`:
		// `_exit` here terminates immediately with 0, before libc finishes
		// unwinding the original exit() call with its original status.
		libc::_exit(0);
	}
}

/// Finalizes an inactive rank (spec §4.4 step 7): the rank has already
/// reached the barrier alongside every active rank, so all that remains is
/// to finalize the runtime (`finalize`, from
/// [`crate::comm::Comm::finalizer`]), log, and exit 0 before the
/// application ever starts.
pub fn finalize_inactive(finalize: fn()) -> ! {
	log::info!("cram: rank is inactive (beyond total_procs), exiting");
	finalize();
	std::process::exit(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn global_resolves_to_local_world() {
		let local = 42i32;
		let resolved = resolve(CommArg::Global, &local);
		assert_eq!(*resolved, 42);
	}

	#[test]
	fn other_communicators_pass_through_unchanged() {
		let local = 42i32;
		let other = 7i32;
		let resolved = resolve(CommArg::Other(&other), &local);
		assert_eq!(*resolved, 7);
	}

	#[test]
	fn crash_line_is_formatted_without_allocation() {
		let mut buf = [0u8; 96];
		let len = format_crash_line(1, 0, &mut buf);
		assert_eq!(&buf[..len], b"cram: rank crashed in job 1 local rank 0\n");
	}
}
