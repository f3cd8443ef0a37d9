//! pprof profile codec.
//!
//! Parses and serializes gzip-wrapped `perftools.profiles` payloads and keeps
//! merged state structurally valid: every profile handed out by [`parse`] has
//! passed validation, and [`Profile::merge_from`] preserves that.

pub mod proto;

mod merge;

use std::io::{Read, Write};

use anyhow::bail;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

use crate::error::{Error, Result};

pub use proto::{Function, Label, Line, Location, Mapping, Profile, Sample, ValueType};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decode a profile payload, transparently decompressing gzip-wrapped data,
/// and validate its structure.
pub fn parse(data: &[u8]) -> Result<Profile> {
    let decoded = if data.len() >= 2 && data[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(data);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .map_err(|e| Error::Codec(format!("decompress profile: {e}")))?;
        buf
    } else {
        data.to_vec()
    };

    let profile = Profile::decode(decoded.as_slice())
        .map_err(|e| Error::Codec(format!("decode profile: {e}")))?;
    validate(&profile).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(profile)
}

/// Serialize `profile` as gzip-compressed protobuf into `writer`, returning
/// the number of compressed bytes written.
pub fn serialize<W: Write>(profile: &Profile, writer: W) -> Result<u64> {
    let mut counter = CountingWriter::new(writer);
    let mut encoder = GzEncoder::new(&mut counter, Compression::default());
    encoder.write_all(&profile.encode_to_vec())?;
    encoder.finish()?;
    Ok(counter.written)
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Structural validation of a decoded profile: sequential entity ids, string
/// and entity references in bounds, per-sample value arity matching the
/// declared sample types.
fn validate(profile: &Profile) -> anyhow::Result<()> {
    if let Some(first) = profile.string_table.first() {
        if !first.is_empty() {
            bail!("first string table entry must be empty");
        }
    }

    let strings = profile.string_table.len() as i64;
    let str_in_bounds = |idx: i64| idx == 0 || (idx > 0 && idx < strings);

    for (i, value_type) in profile.sample_type.iter().enumerate() {
        if !str_in_bounds(value_type.r#type) || !str_in_bounds(value_type.unit) {
            bail!("sample_type {i} has a string index out of bounds");
        }
    }

    for (i, mapping) in profile.mapping.iter().enumerate() {
        if mapping.id != (i + 1) as u64 {
            bail!("mapping id {} is not sequential", mapping.id);
        }
        if !str_in_bounds(mapping.filename) || !str_in_bounds(mapping.build_id) {
            bail!("mapping {} has a string index out of bounds", mapping.id);
        }
    }

    let functions = profile.function.len() as u64;
    for (i, function) in profile.function.iter().enumerate() {
        if function.id != (i + 1) as u64 {
            bail!("function id {} is not sequential", function.id);
        }
        if !str_in_bounds(function.name)
            || !str_in_bounds(function.system_name)
            || !str_in_bounds(function.filename)
        {
            bail!("function {} has a string index out of bounds", function.id);
        }
    }

    let mappings = profile.mapping.len() as u64;
    for (i, location) in profile.location.iter().enumerate() {
        if location.id != (i + 1) as u64 {
            bail!("location id {} is not sequential", location.id);
        }
        if location.mapping_id > mappings {
            bail!(
                "location {} references mapping {} out of bounds",
                location.id,
                location.mapping_id
            );
        }
        for line in &location.line {
            if line.function_id > functions {
                bail!(
                    "location {} references function {} out of bounds",
                    location.id,
                    line.function_id
                );
            }
        }
    }

    if profile.sample_type.is_empty() && !profile.sample.is_empty() {
        bail!("profile has samples but no sample_type");
    }

    let locations = profile.location.len() as u64;
    for (i, sample) in profile.sample.iter().enumerate() {
        if sample.value.len() != profile.sample_type.len() {
            bail!(
                "sample {} has {} values, expected {}",
                i,
                sample.value.len(),
                profile.sample_type.len()
            );
        }
        for &location_id in &sample.location_id {
            if location_id == 0 || location_id > locations {
                bail!("sample {i} references location {location_id} out of bounds");
            }
        }
        for label in &sample.label {
            if label.key == 0 || !str_in_bounds(label.key) {
                bail!("sample {} has label key {} out of bounds", i, label.key);
            }
            if !str_in_bounds(label.str) || !str_in_bounds(label.num_unit) {
                bail!("sample {i} has a label string index out of bounds");
            }
        }
    }

    if let Some(period_type) = &profile.period_type {
        if !str_in_bounds(period_type.r#type) || !str_in_bounds(period_type.unit) {
            bail!("period_type has a string index out of bounds");
        }
    }
    for &comment in &profile.comment {
        if !str_in_bounds(comment) {
            bail!("comment string index {comment} out of bounds");
        }
    }
    if !str_in_bounds(profile.default_sample_type) {
        bail!("default_sample_type string index out of bounds");
    }
    if !str_in_bounds(profile.drop_frames) || !str_in_bounds(profile.keep_frames) {
        bail!("drop_frames/keep_frames string index out of bounds");
    }

    Ok(())
}

impl Profile {
    /// Resolve a string table index; out-of-range indices resolve to "".
    pub(crate) fn str_at(&self, idx: i64) -> &str {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.string_table.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Intern `s` into the string table, returning its index.
    pub(crate) fn intern(&mut self, s: &str) -> i64 {
        if self.string_table.is_empty() {
            self.string_table.push(String::new());
        }
        if let Some(idx) = self.string_table.iter().position(|entry| entry == s) {
            return idx as i64;
        }
        self.string_table.push(s.to_string());
        (self.string_table.len() - 1) as i64
    }

    /// Drop all per-sample labels. The merged artifact only needs stacks and
    /// values; labels would bloat it for no downstream benefit.
    pub fn strip_labels(&mut self) {
        for sample in &mut self.sample {
            sample.label.clear();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample.len()
    }
}
