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

// Wire format: big-endian ints, length-prefixed byte strings, and the
// delta-encoded job record layout of spec §4.1.

use crate::error::{Error, Result};
use crate::job::{JobDescriptor, RawString};

/// A read-only cursor over one record's bytes. Every `read_*` call checks
/// bounds before touching the slice; a length field that would run past the
/// end of `buf` is `Error::InvalidRecord`, never a panic.
struct Cursor<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn new(buf: &'a [u8]) -> Cursor<'a> {
		Cursor { buf, pos: 0 }
	}

	fn read_u32(&mut self) -> Result<u32> {
		if self.buf.len() - self.pos < 4 {
			return Err(Error::InvalidRecord);
		}
		let bytes: [u8; 4] = self.buf[self.pos..self.pos + 4].try_into().unwrap();
		self.pos += 4;
		Ok(u32::from_be_bytes(bytes))
	}

	fn read_string(&mut self) -> Result<RawString> {
		let len = self.read_u32()? as usize;
		if self.buf.len() - self.pos < len {
			return Err(Error::InvalidRecord);
		}
		let s = self.buf[self.pos..self.pos + len].to_vec();
		self.pos += len;
		Ok(RawString(s))
	}
}

/// Appends a big-endian `u32` length prefix followed by the raw bytes of `s`.
pub fn write_string(out: &mut Vec<u8>, s: &[u8]) {
	out.extend_from_slice(&(s.len() as u32).to_be_bytes());
	out.extend_from_slice(s);
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
	out.extend_from_slice(&v.to_be_bytes());
}

/// Encodes job 0: the full record, every environment variable listed as
/// "changed" against an implicit empty base (spec §4.1).
pub fn encode_full(job: &JobDescriptor) -> Vec<u8> {
	encode_record(job, &[], &job.env)
}

/// Encodes job `i > 0` as a delta against `base`'s environment: `subtracted`
/// is every base key absent from `job.env`, `changed` is every key whose
/// value differs from base (including keys base never had).
pub fn encode_delta(job: &JobDescriptor, base: &JobDescriptor) -> Vec<u8> {
	let mut subtracted = Vec::new();
	let mut changed = Vec::new();
	let mut bi = 0;
	let mut ji = 0;
	while bi < base.env.len() || ji < job.env.len() {
		match (base.env.get(bi), job.env.get(ji)) {
			(Some((bk, _)), Some((jk, jv))) if bk == jk => {
				if base.env[bi].1 != *jv {
					changed.push((jk.clone(), jv.clone()));
				}
				bi += 1;
				ji += 1;
			}
			(Some((bk, _)), Some((jk, _))) if bk < jk => {
				subtracted.push(bk.clone());
				bi += 1;
			}
			(Some(_), Some((jk, jv))) => {
				changed.push((jk.clone(), jv.clone()));
				ji += 1;
			}
			(Some((bk, _)), None) => {
				subtracted.push(bk.clone());
				bi += 1;
			}
			(None, Some((jk, jv))) => {
				changed.push((jk.clone(), jv.clone()));
				ji += 1;
			}
			(None, None) => unreachable!(),
		}
	}
	encode_record(job, &subtracted, &changed)
}

fn encode_record(
	job: &JobDescriptor,
	subtracted: &[RawString],
	changed: &[(RawString, RawString)],
) -> Vec<u8> {
	let mut out = Vec::new();
	write_u32(&mut out, job.num_procs);
	write_string(&mut out, job.working_dir.as_bytes());
	write_u32(&mut out, job.args.len() as u32);
	for a in &job.args {
		write_string(&mut out, a.as_bytes());
	}
	write_u32(&mut out, subtracted.len() as u32);
	for k in subtracted {
		write_string(&mut out, k.as_bytes());
	}
	write_u32(&mut out, changed.len() as u32);
	for (k, v) in changed {
		write_string(&mut out, k.as_bytes());
		write_string(&mut out, v.as_bytes());
	}
	out
}

/// Decoded record, prior to merging its environment delta against a base.
struct RawRecord {
	num_procs: u32,
	working_dir: RawString,
	args: Vec<RawString>,
	subtracted: Vec<RawString>,
	changed: Vec<(RawString, RawString)>,
}

fn decode_raw(buf: &[u8]) -> Result<RawRecord> {
	let mut c = Cursor::new(buf);
	let num_procs = c.read_u32()?;
	if num_procs == 0 {
		return Err(Error::InvalidRecord);
	}
	let working_dir = c.read_string()?;
	let num_args = c.read_u32()? as usize;
	if num_args == 0 {
		return Err(Error::InvalidRecord);
	}
	let mut args = Vec::with_capacity(num_args);
	for _ in 0..num_args {
		args.push(c.read_string()?);
	}
	let num_subtracted = c.read_u32()? as usize;
	let mut subtracted = Vec::with_capacity(num_subtracted);
	for _ in 0..num_subtracted {
		subtracted.push(c.read_string()?);
	}
	let num_changed = c.read_u32()? as usize;
	let mut changed = Vec::with_capacity(num_changed);
	for _ in 0..num_changed {
		let k = c.read_string()?;
		let v = c.read_string()?;
		changed.push((k, v));
	}
	Ok(RawRecord { num_procs, working_dir, args, subtracted, changed })
}

/// Decodes record 0 (the base record). `num_subtracted` must be zero in a
/// well-formed container; a non-empty `subtracted` list would mean "job 0 is
/// a delta against nothing", which has no base to apply it to.
pub fn decode_base(buf: &[u8]) -> Result<JobDescriptor> {
	let raw = decode_raw(buf)?;
	if !raw.subtracted.is_empty() {
		return Err(Error::NoBaseForDelta);
	}
	let mut env = raw.changed;
	env.sort_by(|a, b| a.0.cmp(&b.0));
	Ok(JobDescriptor { num_procs: raw.num_procs, working_dir: raw.working_dir, args: raw.args, env })
}

/// Decodes record `i > 0`, merging its `subtracted`/`changed` delta against
/// `base`'s environment via [`decompress`].
pub fn decode_delta(buf: &[u8], base: &JobDescriptor) -> Result<JobDescriptor> {
	let raw = decode_raw(buf)?;
	let env = decompress(&base.env, &raw.subtracted, &raw.changed);
	Ok(JobDescriptor { num_procs: raw.num_procs, working_dir: raw.working_dir, args: raw.args, env })
}

/// Peeks only `num_procs` out of a record buffer, without decoding the rest.
/// Used by the container reader to report each job's process count cheaply.
pub fn peek_num_procs(buf: &[u8]) -> Result<u32> {
	Cursor::new(buf).read_u32()
}

/// Merges a base environment with a `subtracted`/`changed` delta (spec
/// §4.1). All three inputs are sorted ascending by key; the merge walks them
/// with three monotone cursors in linear time.
///
/// Tie-breaks, exactly as specified: a key in both `base` and `changed`
/// takes the `changed` value and does not count as subtracted; a key in
/// `subtracted` but absent from `base` has no effect; a key in both
/// `changed` and `subtracted` keeps the `changed` value. Membership in
/// `subtracted` is tracked with an explicit boolean rather than treating a
/// "not found" search result as index zero, which would silently match
/// whatever key happens to sort first.
pub fn decompress(
	base: &[(RawString, RawString)],
	subtracted: &[RawString],
	changed: &[(RawString, RawString)],
) -> Vec<(RawString, RawString)> {
	let mut out = Vec::with_capacity(base.len() + changed.len());
	let mut bi = 0;
	let mut ci = 0;
	let mut si = 0;

	while bi < base.len() || ci < changed.len() {
		let take_changed_only = match (base.get(bi), changed.get(ci)) {
			(Some((bk, _)), Some((ck, _))) => ck < bk,
			(None, Some(_)) => true,
			(Some(_), None) => false,
			(None, None) => unreachable!(),
		};
		let (key, value, in_changed) = if take_changed_only {
			let (k, v) = &changed[ci];
			ci += 1;
			(k.clone(), v.clone(), true)
		} else {
			let (bk, bv) = &base[bi];
			let in_changed = matches!(changed.get(ci), Some((ck, _)) if ck == bk);
			let (key, value) = if in_changed {
				let (ck, cv) = &changed[ci];
				(ck.clone(), cv.clone())
			} else {
				(bk.clone(), bv.clone())
			};
			bi += 1;
			if in_changed {
				ci += 1;
			}
			(key, value, in_changed)
		};

		while si < subtracted.len() && subtracted[si] < key {
			si += 1;
		}
		let found_in_subtracted = si < subtracted.len() && subtracted[si] == key;
		if found_in_subtracted {
			si += 1;
		}

		if found_in_subtracted && !in_changed {
			continue;
		}
		out.push((key, value));
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::JobDescriptor;
	use rand::rngs::SmallRng;
	use rand::{Rng, SeedableRng};

	fn env(pairs: &[(&str, &str)]) -> Vec<(RawString, RawString)> {
		let mut v: Vec<_> =
			pairs.iter().map(|(k, val)| (RawString::from(*k), RawString::from(*val))).collect();
		v.sort_by(|a, b| a.0.cmp(&b.0));
		v
	}

	fn keys(ks: &[&str]) -> Vec<RawString> {
		let mut v: Vec<_> = ks.iter().map(|k| RawString::from(*k)).collect();
		v.sort();
		v
	}

	#[test]
	fn decompress_matches_spec_scenario_2() {
		let base = env(&[("X", "p"), ("Y", "q")]);
		let subtracted = keys(&["X"]);
		let changed = env(&[("Y", "r"), ("Z", "s")]);
		let got = decompress(&base, &subtracted, &changed);
		assert_eq!(got, env(&[("Y", "r"), ("Z", "s")]));
	}

	#[test]
	fn changed_wins_over_subtracted() {
		let base = env(&[("A", "1")]);
		let subtracted = keys(&["A"]);
		let changed = env(&[("A", "2")]);
		let got = decompress(&base, &subtracted, &changed);
		assert_eq!(got, env(&[("A", "2")]));
	}

	#[test]
	fn subtracting_an_absent_key_has_no_effect() {
		let base = env(&[("A", "1")]);
		let subtracted = keys(&["Z"]);
		let changed = env(&[]);
		let got = decompress(&base, &subtracted, &changed);
		assert_eq!(got, env(&[("A", "1")]));
	}

	#[test]
	fn subtracted_key_sorting_first_is_not_mistaken_for_found() {
		// Regression for the index-of-zero pitfall called out in the design
		// notes: a subtracted key that would sort before everything else
		// must not be treated as matching base[0].
		let base = env(&[("m", "1")]);
		let subtracted = keys(&["a"]);
		let changed = env(&[]);
		let got = decompress(&base, &subtracted, &changed);
		assert_eq!(got, env(&[("m", "1")]));
	}

	#[test]
	fn record_round_trips() {
		let job = JobDescriptor::new(
			4,
			RawString::from("/tmp"),
			vec![RawString::from("app"), RawString::from("x")],
			env(&[("A", "1"), ("B", "2")]),
		)
		.unwrap();
		let bytes = encode_full(&job);
		let decoded = decode_base(&bytes).unwrap();
		assert_eq!(decoded, job);
	}

	#[test]
	fn delta_round_trips() {
		let base = JobDescriptor::new(
			2,
			RawString::from("/a"),
			vec![RawString::from("app"), RawString::from("1")],
			env(&[("X", "p"), ("Y", "q")]),
		)
		.unwrap();
		let other = JobDescriptor::new(
			3,
			RawString::from("/b"),
			vec![RawString::from("app"), RawString::from("2")],
			env(&[("Y", "r"), ("Z", "s")]),
		)
		.unwrap();
		let bytes = encode_delta(&other, &base);
		let decoded = decode_delta(&bytes, &base).unwrap();
		assert_eq!(decoded, other);
	}

	#[test]
	fn randomized_round_trip() {
		let mut rng = SmallRng::seed_from_u64(42);
		for _ in 0..200 {
			let base_env_len = rng.gen_range(0..8);
			let mut base_env: Vec<(RawString, RawString)> = (0..base_env_len)
				.map(|i| (RawString::from(format!("K{:03}", i)), RawString::from(format!("v{}", rng.gen::<u32>()))))
				.collect();
			base_env.sort_by(|a, b| a.0.cmp(&b.0));
			let base = JobDescriptor::new(
				rng.gen_range(1..32),
				RawString::from("/base"),
				vec![RawString::from("app")],
				base_env,
			)
			.unwrap();

			let other_env_len = rng.gen_range(0..8);
			let mut other_env: Vec<(RawString, RawString)> = (0..other_env_len)
				.map(|i| (RawString::from(format!("K{:03}", i)), RawString::from(format!("w{}", rng.gen::<u32>()))))
				.collect();
			other_env.sort_by(|a, b| a.0.cmp(&b.0));
			let other = JobDescriptor::new(
				rng.gen_range(1..32),
				RawString::from("/other"),
				vec![RawString::from("app"), RawString::from("y")],
				other_env,
			)
			.unwrap();

			let bytes = encode_delta(&other, &base);
			let decoded = decode_delta(&bytes, &base).unwrap();
			assert_eq!(decoded, other);
		}
	}
}
