//! Deterministic tar.gz packaging of build contexts.
//!
//! Identical inputs always produce byte-identical archives: entries are sorted
//! by path, and ownership, permissions and timestamps are fixed.

use std::collections::BTreeMap;
use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{EntryType, Header};

use crate::build::types::ArchiveError;
use crate::consts::ARCHIVE_MTIME;

/// Pack `(path, contents)` entries into a gzip-compressed tarball.
///
/// # Errors
///
/// Returns `ArchiveError::DuplicatePath` if two entries share a path.
pub fn pack(entries: &[(&str, &[u8])]) -> Result<Vec<u8>, ArchiveError> {
  let mut sorted: BTreeMap<&str, &[u8]> = BTreeMap::new();
  for &(path, data) in entries {
    if sorted.insert(path, data).is_some() {
      return Err(ArchiveError::DuplicatePath(path.to_string()));
    }
  }

  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);

  for (path, data) in sorted {
    let mut header = Header::new_gnu();
    header.set_path(path)?;
    header.set_size(data.len() as u64);
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(ARCHIVE_MTIME);
    header.set_cksum();
    builder.append(&header, data)?;
  }

  let mut encoder = builder.into_inner()?;
  encoder.flush()?;
  Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
  use std::io::Read;

  use flate2::read::GzDecoder;

  use super::*;

  fn unpack(bytes: &[u8]) -> Vec<(String, Vec<u8>, u64)> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive
      .entries()
      .unwrap()
      .map(|entry| {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().to_string();
        let mtime = entry.header().mtime().unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        (path, data, mtime)
      })
      .collect()
  }

  #[test]
  fn identical_inputs_produce_identical_bytes() {
    let a = pack(&[("index.js", b"console.log(1)".as_slice()), ("Dockerfile", b"FROM node".as_slice())]).unwrap();
    let b = pack(&[("Dockerfile", b"FROM node".as_slice()), ("index.js", b"console.log(1)".as_slice())]).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn entries_are_sorted_with_fixed_mtime() {
    let bytes = pack(&[("z.txt", b"z".as_slice()), ("a.txt", b"a".as_slice())]).unwrap();
    let entries = unpack(&bytes);
    let names: Vec<_> = entries.iter().map(|(p, _, _)| p.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "z.txt"]);
    assert!(entries.iter().all(|(_, _, mtime)| *mtime == ARCHIVE_MTIME));
    assert_eq!(entries[1].1, b"z");
  }

  #[test]
  fn duplicate_paths_are_rejected() {
    let err = pack(&[("a", b"1".as_slice()), ("a", b"2".as_slice())]).unwrap_err();
    assert!(matches!(err, ArchiveError::DuplicatePath(p) if p == "a"));
  }
}
