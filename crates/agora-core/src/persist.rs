//! On-disk layout of a [`VectorIndex`]: two companion files written and read as a pair.
//!
//! ```text
//! index.vectors  magic "AGVX" | version u16 | metric u8 | dims u32 | count u64 | stamp [16]
//!                then per entry: id u64 | dims x f32           (all little-endian)
//! index.store    magic "AGST" | version u16 | stamp [16] | bincode(StoreBody)
//! ```
//!
//! Each save goes into its own generation directory next to a `CURRENT` pointer file:
//!
//! ```text
//! <dir>/CURRENT           name of the live generation, e.g. "gen-3f0c..."
//! <dir>/gen-3f0c.../      index.vectors + index.store
//! ```
//!
//! A generation is filled in a staging directory, renamed into place, and only then
//! published by renaming a new `CURRENT` over the old one. A reader therefore sees the
//! whole old pair or the whole new pair; a save that dies halfway leaves the old pair
//! live. Both files of one save also carry the same random stamp and a mismatch is
//! rejected. Only one writer per directory is supported.
//!
//! Loading trusts the origin of the bytes. Only load artifacts written by [`save`],
//! either locally or from the operator-controlled remote folder. The decoder rejects
//! anything with another magic or format version instead of guessing.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::{Builder, NamedTempFile, TempDir};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunks::Chunk;
use crate::store::{Entry, IndexError, IndexSpec, Metric, VectorIndex};

pub const VECTORS_FILE: &str = "index.vectors";
pub const STORE_FILE: &str = "index.store";
/// Both artifacts, in the order they are fetched and pushed.
pub const ARTIFACTS: [&str; 2] = [VECTORS_FILE, STORE_FILE];
/// Pointer file naming the live generation directory.
pub const CURRENT_FILE: &str = "CURRENT";

const GENERATION_PREFIX: &str = "gen-";
const STAGING_PREFIX: &str = ".staging-";

const VECTORS_MAGIC: &[u8; 4] = b"AGVX";
const STORE_MAGIC: &[u8; 4] = b"AGST";
pub const FORMAT_VERSION: u16 = 1;

/// Upper bound for the decoded chunk store.
const STORE_LIMIT: usize = 1 << 30;
const VECTORS_HEADER_LEN: usize = 4 + 2 + 1 + 4 + 8 + 16;

#[derive(Serialize, Deserialize)]
struct StoreBody {
    metric: Metric,
    dimensions: u64,
    next_id: u64,
    chunks: Vec<(u64, Chunk)>,
}

/// Directory holding the live pair under `dir`, if a save has been published there.
pub fn current_dir(dir: &Path) -> Option<PathBuf> {
    let generation = dir.join(read_pointer(dir)?);
    generation.is_dir().then_some(generation)
}

/// True when the live generation in `dir` has both companion files.
pub fn artifacts_present(dir: &Path) -> bool {
    current_dir(dir).is_some_and(|g| ARTIFACTS.iter().all(|name| g.join(name).is_file()))
}

/// Empty staging directory inside `dir`. Fill it with the two artifacts, then hand it
/// to [`commit`]. Dropping it instead discards the staged files.
pub fn stage(dir: &Path) -> std::io::Result<TempDir> {
    std::fs::create_dir_all(dir)?;
    Builder::new().prefix(STAGING_PREFIX).tempdir_in(dir)
}

/// Publishes a staged pair as the live generation of `dir` and removes older
/// generations. Returns the new generation directory.
pub fn commit(staged: TempDir, dir: &Path) -> std::io::Result<PathBuf> {
    let name = format!("{GENERATION_PREFIX}{}", Uuid::new_v4().simple());
    let generation = dir.join(&name);
    std::fs::rename(staged.path(), &generation)?;

    let mut pointer = NamedTempFile::new_in(dir)?;
    pointer.write_all(name.as_bytes())?;
    pointer.as_file().sync_all()?;
    pointer
        .persist(dir.join(CURRENT_FILE))
        .map_err(|e| e.error)?;
    prune(dir, &name);
    Ok(generation)
}

/// Writes `index` to `dir` as the two companion files.
pub fn save(index: &VectorIndex, dir: &Path) -> Result<(), IndexError> {
    let stamp = Uuid::new_v4();
    let vectors = encode_vectors(index, stamp);
    let store = encode_store(index, stamp)?;

    let staged = stage(dir)?;
    write_synced(&staged.path().join(VECTORS_FILE), &vectors)?;
    write_synced(&staged.path().join(STORE_FILE), &store)?;
    let generation = commit(staged, dir)?;

    info!(dir = %generation.display(), entries = index.len(), %stamp, "saved index");
    Ok(())
}

/// Reads the live pair in `dir`. Any missing, truncated, mismatched, or incompatible
/// artifact is a [`IndexError::Deserialization`]. A read that fails because a save
/// published a new generation meanwhile is retried once against that generation.
pub fn load(dir: &Path, expected: IndexSpec) -> Result<VectorIndex, IndexError> {
    let pointer = read_pointer(dir);
    match load_generation(dir, pointer.as_deref(), expected) {
        Err(e) if read_pointer(dir) != pointer => {
            debug!(error = %e, "index replaced while loading; retrying");
            load_generation(dir, read_pointer(dir).as_deref(), expected)
        }
        result => result,
    }
}

fn load_generation(
    dir: &Path,
    generation: Option<&str>,
    expected: IndexSpec,
) -> Result<VectorIndex, IndexError> {
    let corrupt = |reason: String| IndexError::Deserialization {
        dir: dir.to_path_buf(),
        reason,
    };
    let generation = generation.ok_or_else(|| corrupt(format!("no readable {CURRENT_FILE} pointer")))?;
    let read = |name: &str| {
        std::fs::read(dir.join(generation).join(name))
            .map_err(|e| corrupt(format!("cannot read {generation}/{name}: {e}")))
    };
    let vectors = read(VECTORS_FILE)?;
    let store = read(STORE_FILE)?;

    let header = decode_vectors_header(&vectors).map_err(&corrupt)?;
    let spec = IndexSpec {
        metric: header.metric,
        dimensions: header.dimensions,
    };
    if spec != expected {
        return Err(corrupt(format!("index was built as {spec}, expected {expected}")));
    }
    let (stamp, body) = decode_store(&store).map_err(&corrupt)?;
    if stamp != header.stamp {
        return Err(corrupt(format!("{VECTORS_FILE} and {STORE_FILE} come from different saves")));
    }
    if body.metric != spec.metric || body.dimensions != spec.dimensions as u64 {
        return Err(corrupt(format!("{STORE_FILE} disagrees with {VECTORS_FILE} on metric or dimension")));
    }
    if body.chunks.len() as u64 != header.count {
        return Err(corrupt(format!(
            "{STORE_FILE} holds {} chunks, {VECTORS_FILE} holds {} vectors",
            body.chunks.len(),
            header.count
        )));
    }

    let mut entries = Vec::with_capacity(body.chunks.len());
    let mut rest = &vectors[VECTORS_HEADER_LEN..];
    for (id, chunk) in body.chunks {
        let vector_id = u64::from_le_bytes(array(take(&mut rest, 8).map_err(&corrupt)?));
        if vector_id != id {
            return Err(corrupt(format!("entry id {vector_id} does not match chunk id {id}")));
        }
        let raw = take(&mut rest, spec.dimensions * 4).map_err(&corrupt)?;
        let vector = raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        entries.push(Entry { id, vector, chunk });
    }
    if !rest.is_empty() {
        return Err(corrupt(format!("{} trailing bytes in {VECTORS_FILE}", rest.len())));
    }
    if entries.iter().any(|e| e.id >= body.next_id) {
        return Err(corrupt("entry id beyond the recorded id counter".to_string()));
    }

    debug!(dir = %dir.display(), generation, entries = entries.len(), %stamp, "loaded index");
    Ok(VectorIndex::from_parts(spec, entries, body.next_id))
}

/// Generation named by `dir/CURRENT`. Anything that is not a plain generation name
/// counts as no pointer.
fn read_pointer(dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(dir.join(CURRENT_FILE)).ok()?;
    let name = raw.trim();
    let valid = name.len() > GENERATION_PREFIX.len()
        && name.starts_with(GENERATION_PREFIX)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    valid.then(|| name.to_string())
}

/// Removes every generation except `keep` and whatever `CURRENT` names now.
fn prune(dir: &Path, keep: &str) {
    let live = read_pointer(dir);
    let Ok(listing) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in listing.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(GENERATION_PREFIX) || name == keep || live.as_deref() == Some(name) {
            continue;
        }
        if let Err(e) = std::fs::remove_dir_all(entry.path()) {
            warn!(generation = name, error = %e, "could not remove old index generation");
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn encode_vectors(index: &VectorIndex, stamp: Uuid) -> Vec<u8> {
    let spec = index.spec();
    let mut out = Vec::with_capacity(VECTORS_HEADER_LEN + index.len() * (8 + spec.dimensions * 4));
    out.extend_from_slice(VECTORS_MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(spec.metric.code());
    out.extend_from_slice(&(spec.dimensions as u32).to_le_bytes());
    out.extend_from_slice(&(index.len() as u64).to_le_bytes());
    out.extend_from_slice(stamp.as_bytes());
    for entry in index.entries() {
        out.extend_from_slice(&entry.id.to_le_bytes());
        for x in &entry.vector {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }
    out
}

fn encode_store(index: &VectorIndex, stamp: Uuid) -> Result<Vec<u8>, IndexError> {
    let spec = index.spec();
    let body = StoreBody {
        metric: spec.metric,
        dimensions: spec.dimensions as u64,
        next_id: index.next_id(),
        chunks: index
            .entries()
            .iter()
            .map(|e| (e.id, e.chunk.clone()))
            .collect(),
    };
    let mut out = Vec::new();
    out.extend_from_slice(STORE_MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(stamp.as_bytes());
    out.extend(bincode::serde::encode_to_vec(&body, bincode::config::standard())?);
    Ok(out)
}

struct VectorsHeader {
    metric: Metric,
    dimensions: usize,
    count: u64,
    stamp: Uuid,
}

fn decode_vectors_header(bytes: &[u8]) -> Result<VectorsHeader, String> {
    let mut rest = bytes;
    let magic = take(&mut rest, 4)?;
    if magic != VECTORS_MAGIC {
        return Err(format!("{VECTORS_FILE} has an unknown magic"));
    }
    check_version(take(&mut rest, 2)?)?;
    let code = take(&mut rest, 1)?[0];
    let metric = Metric::from_code(code).ok_or_else(|| format!("unknown metric code {code}"))?;
    let dimensions = u32::from_le_bytes(array(take(&mut rest, 4)?)) as usize;
    let count = u64::from_le_bytes(array(take(&mut rest, 8)?));
    let stamp = Uuid::from_bytes(array(take(&mut rest, 16)?));
    let expected_len = count
        .checked_mul(8 + dimensions as u64 * 4)
        .ok_or_else(|| "entry count overflows".to_string())?;
    if rest.len() as u64 != expected_len {
        return Err(format!(
            "{VECTORS_FILE} is truncated or padded: {} body bytes, expected {expected_len}",
            rest.len()
        ));
    }
    Ok(VectorsHeader {
        metric,
        dimensions,
        count,
        stamp,
    })
}

fn decode_store(bytes: &[u8]) -> Result<(Uuid, StoreBody), String> {
    let mut rest = bytes;
    let magic = take(&mut rest, 4)?;
    if magic != STORE_MAGIC {
        return Err(format!("{STORE_FILE} has an unknown magic"));
    }
    check_version(take(&mut rest, 2)?)?;
    let stamp = Uuid::from_bytes(array(take(&mut rest, 16)?));
    let config = bincode::config::standard().with_limit::<STORE_LIMIT>();
    let (body, read): (StoreBody, usize) = bincode::serde::decode_from_slice(rest, config)
        .map_err(|e| format!("{STORE_FILE} does not decode: {e}"))?;
    if read != rest.len() {
        return Err(format!("{} trailing bytes in {STORE_FILE}", rest.len() - read));
    }
    Ok((stamp, body))
}

fn check_version(raw: &[u8]) -> Result<(), String> {
    let version = u16::from_le_bytes(array(raw));
    if version != FORMAT_VERSION {
        return Err(format!("format version {version} is not supported (expected {FORMAT_VERSION})"));
    }
    Ok(())
}

/// Splits `n` bytes off the front of `rest`.
fn take<'a>(rest: &mut &'a [u8], n: usize) -> Result<&'a [u8], String> {
    if rest.len() < n {
        return Err("unexpected end of data".to_string());
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
