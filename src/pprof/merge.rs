//! Sample-wise union of decoded profiles.
//!
//! Follows pprof merge semantics: strings are interned across both inputs,
//! functions/mappings/locations are matched structurally, samples with the
//! same stack and labels sum their values, and header fields fold.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

use super::{Function, Label, Line, Location, Mapping, Profile, Sample, ValueType};

/// Mapping sizes round to the nearest page when matching mappings across
/// profiles, so the same binary mapped with slightly different extents still
/// matches.
const MAPSIZE_ROUNDING: u64 = 0x1000;

impl Profile {
    /// Fold `other` into `self` as a sample-wise union.
    ///
    /// Fails when the profiles disagree on period type or sample value
    /// schema; `self` is left untouched in that case.
    pub fn merge_from(&mut self, other: Profile) -> Result<()> {
        self.check_compatible(&other)?;
        Merger::new(self).merge(other);
        Ok(())
    }

    fn check_compatible(&self, other: &Profile) -> Result<()> {
        let period_a = resolved_value_type(self, self.period_type.as_ref());
        let period_b = resolved_value_type(other, other.period_type.as_ref());
        if period_a != period_b {
            return Err(Error::Merge(format!(
                "incompatible period types {period_a:?} and {period_b:?}"
            )));
        }
        if self.sample_type.len() != other.sample_type.len() {
            return Err(Error::Merge(format!(
                "incompatible sample types: {} vs {} values per sample",
                self.sample_type.len(),
                other.sample_type.len()
            )));
        }
        for (a, b) in self.sample_type.iter().zip(&other.sample_type) {
            let type_a = (self.str_at(a.r#type), self.str_at(a.unit));
            let type_b = (other.str_at(b.r#type), other.str_at(b.unit));
            if type_a != type_b {
                return Err(Error::Merge(format!(
                    "incompatible sample types {type_a:?} and {type_b:?}"
                )));
            }
        }
        Ok(())
    }
}

fn resolved_value_type<'a>(profile: &'a Profile, vt: Option<&ValueType>) -> (&'a str, &'a str) {
    vt.map(|vt| (profile.str_at(vt.r#type), profile.str_at(vt.unit)))
        .unwrap_or(("", ""))
}

#[derive(PartialEq, Eq, Hash)]
struct FunctionKey {
    name: i64,
    system_name: i64,
    filename: i64,
    start_line: i64,
}

#[derive(PartialEq, Eq, Hash)]
struct MappingKey {
    size: u64,
    file_offset: u64,
    build_id_or_filename: i64,
}

#[derive(PartialEq, Eq, Hash)]
struct LocationKey {
    mapping_id: u64,
    address: u64,
    is_folded: bool,
    lines: Vec<(u64, i64)>,
}

#[derive(PartialEq, Eq, Hash)]
struct SampleKey {
    location_ids: Vec<u64>,
    labels: Vec<(i64, i64, i64, i64)>,
}

#[derive(Clone, Copy)]
struct MappedMapping {
    id: u64,
    memory_start: u64,
}

/// Index state for one merge pass. Keys live in the destination profile's
/// coordinate space; incoming entities are remapped into it before lookup.
struct Merger<'a> {
    dst: &'a mut Profile,
    strings: HashMap<String, i64>,
    functions: HashMap<FunctionKey, u64>,
    mappings: HashMap<MappingKey, MappedMapping>,
    locations: HashMap<LocationKey, u64>,
    samples: HashMap<SampleKey, usize>,
}

impl<'a> Merger<'a> {
    fn new(dst: &'a mut Profile) -> Self {
        if dst.string_table.is_empty() {
            dst.string_table.push(String::new());
        }

        let mut strings = HashMap::with_capacity(dst.string_table.len());
        for (idx, entry) in dst.string_table.iter().enumerate() {
            strings.entry(entry.clone()).or_insert(idx as i64);
        }

        let functions = dst
            .function
            .iter()
            .map(|f| (function_key(f), f.id))
            .collect();
        let mappings = dst
            .mapping
            .iter()
            .map(|m| {
                let mapped = MappedMapping {
                    id: m.id,
                    memory_start: m.memory_start,
                };
                (mapping_key(dst, m), mapped)
            })
            .collect();
        let locations = dst
            .location
            .iter()
            .map(|l| (location_key(dst, l), l.id))
            .collect();

        // Samples that differed only in labels collapse to one key once
        // labels are stripped; fold such duplicates so no values hide behind
        // the first map hit.
        let mut samples: HashMap<SampleKey, usize> = HashMap::with_capacity(dst.sample.len());
        let mut folded: Vec<Sample> = Vec::with_capacity(dst.sample.len());
        for sample in dst.sample.drain(..) {
            let key = SampleKey {
                location_ids: sample.location_id.clone(),
                labels: label_key(&sample.label),
            };
            match samples.entry(key) {
                Entry::Occupied(entry) => {
                    let merged = &mut folded[*entry.get()];
                    for (dst_value, value) in merged.value.iter_mut().zip(&sample.value) {
                        *dst_value += *value;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(folded.len());
                    folded.push(sample);
                }
            }
        }
        dst.sample = folded;

        Self {
            dst,
            strings,
            functions,
            mappings,
            locations,
            samples,
        }
    }

    fn merge(&mut self, other: Profile) {
        let string_remap: Vec<i64> = other
            .string_table
            .iter()
            .map(|s| self.intern(s))
            .collect();

        let mut function_remap: HashMap<u64, u64> = HashMap::with_capacity(other.function.len());
        for function in &other.function {
            let name = remap_index(&string_remap, function.name);
            let system_name = remap_index(&string_remap, function.system_name);
            let filename = remap_index(&string_remap, function.filename);
            let key = FunctionKey {
                name,
                system_name,
                filename,
                start_line: function.start_line,
            };
            let id = match self.functions.entry(key) {
                Entry::Occupied(entry) => *entry.get(),
                Entry::Vacant(entry) => {
                    let id = (self.dst.function.len() + 1) as u64;
                    self.dst.function.push(Function {
                        id,
                        name,
                        system_name,
                        filename,
                        start_line: function.start_line,
                    });
                    entry.insert(id);
                    id
                }
            };
            function_remap.insert(function.id, id);
        }

        let mut mapping_remap: HashMap<u64, (u64, i64)> =
            HashMap::with_capacity(other.mapping.len());
        for mapping in &other.mapping {
            let filename = remap_index(&string_remap, mapping.filename);
            let build_id = remap_index(&string_remap, mapping.build_id);
            let key = MappingKey {
                size: rounded_mapping_size(mapping),
                file_offset: mapping.file_offset,
                build_id_or_filename: build_id_or_filename(self.dst, build_id, filename),
            };
            match self.mappings.entry(key) {
                Entry::Occupied(entry) => {
                    let mapped = *entry.get();
                    // Same binary loaded at a different base: incoming
                    // addresses rebase by the start delta.
                    let offset =
                        (mapped.memory_start as i64).wrapping_sub(mapping.memory_start as i64);
                    mapping_remap.insert(mapping.id, (mapped.id, offset));
                }
                Entry::Vacant(entry) => {
                    let id = (self.dst.mapping.len() + 1) as u64;
                    self.dst.mapping.push(Mapping {
                        id,
                        memory_start: mapping.memory_start,
                        memory_limit: mapping.memory_limit,
                        file_offset: mapping.file_offset,
                        filename,
                        build_id,
                        has_functions: mapping.has_functions,
                        has_filenames: mapping.has_filenames,
                        has_line_numbers: mapping.has_line_numbers,
                        has_inline_frames: mapping.has_inline_frames,
                    });
                    entry.insert(MappedMapping {
                        id,
                        memory_start: mapping.memory_start,
                    });
                    mapping_remap.insert(mapping.id, (id, 0));
                }
            }
        }

        let mut location_remap: HashMap<u64, u64> = HashMap::with_capacity(other.location.len());
        for location in &other.location {
            let (mapping_id, offset) = mapping_remap
                .get(&location.mapping_id)
                .copied()
                .unwrap_or((0, 0));
            let address = (location.address as i64).wrapping_add(offset) as u64;
            // Key on the mapping-relative address so address space layout
            // randomization does not defeat matching.
            let normalized = if location.mapping_id != 0 {
                other
                    .mapping
                    .get(location.mapping_id as usize - 1)
                    .map(|m| location.address.wrapping_sub(m.memory_start))
                    .unwrap_or(location.address)
            } else {
                location.address
            };
            let lines: Vec<Line> = location
                .line
                .iter()
                .map(|l| Line {
                    function_id: function_remap.get(&l.function_id).copied().unwrap_or(0),
                    line: l.line,
                })
                .collect();
            let key = LocationKey {
                mapping_id,
                address: normalized,
                is_folded: location.is_folded,
                lines: lines.iter().map(|l| (l.function_id, l.line)).collect(),
            };
            let id = match self.locations.entry(key) {
                Entry::Occupied(entry) => *entry.get(),
                Entry::Vacant(entry) => {
                    let id = (self.dst.location.len() + 1) as u64;
                    self.dst.location.push(Location {
                        id,
                        mapping_id,
                        address,
                        line: lines,
                        is_folded: location.is_folded,
                    });
                    entry.insert(id);
                    id
                }
            };
            location_remap.insert(location.id, id);
        }

        for sample in other.sample {
            let location_ids: Vec<u64> = sample
                .location_id
                .iter()
                .map(|id| location_remap.get(id).copied().unwrap_or(0))
                .collect();
            let labels: Vec<Label> = sample
                .label
                .iter()
                .map(|l| Label {
                    key: remap_index(&string_remap, l.key),
                    str: remap_index(&string_remap, l.str),
                    num: l.num,
                    num_unit: remap_index(&string_remap, l.num_unit),
                })
                .collect();
            let key = SampleKey {
                location_ids: location_ids.clone(),
                labels: label_key(&labels),
            };
            match self.samples.entry(key) {
                Entry::Occupied(entry) => {
                    let merged = &mut self.dst.sample[*entry.get()];
                    for (dst_value, value) in merged.value.iter_mut().zip(&sample.value) {
                        *dst_value += *value;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(self.dst.sample.len());
                    self.dst.sample.push(Sample {
                        location_id: location_ids,
                        value: sample.value,
                        label: labels,
                    });
                }
            }
        }

        // Header fold: earliest capture time, total wall duration, coarsest
        // period, comment union, first non-empty default sample type.
        if other.time_nanos != 0
            && (self.dst.time_nanos == 0 || other.time_nanos < self.dst.time_nanos)
        {
            self.dst.time_nanos = other.time_nanos;
        }
        self.dst.duration_nanos += other.duration_nanos;
        if other.period > self.dst.period {
            self.dst.period = other.period;
        }

        let mut seen: HashSet<String> = self
            .dst
            .comment
            .iter()
            .map(|&c| self.dst.str_at(c).to_string())
            .collect();
        for &comment in &other.comment {
            let idx = remap_index(&string_remap, comment);
            if seen.insert(self.dst.str_at(idx).to_string()) {
                self.dst.comment.push(idx);
            }
        }

        if self.dst.str_at(self.dst.default_sample_type).is_empty() {
            let idx = remap_index(&string_remap, other.default_sample_type);
            if !self.dst.str_at(idx).is_empty() {
                self.dst.default_sample_type = idx;
            }
        }
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&idx) = self.strings.get(s) {
            return idx;
        }
        let idx = self.dst.string_table.len() as i64;
        self.dst.string_table.push(s.to_string());
        self.strings.insert(s.to_string(), idx);
        idx
    }
}

fn function_key(function: &Function) -> FunctionKey {
    FunctionKey {
        name: function.name,
        system_name: function.system_name,
        filename: function.filename,
        start_line: function.start_line,
    }
}

fn mapping_key(profile: &Profile, mapping: &Mapping) -> MappingKey {
    MappingKey {
        size: rounded_mapping_size(mapping),
        file_offset: mapping.file_offset,
        build_id_or_filename: build_id_or_filename(profile, mapping.build_id, mapping.filename),
    }
}

fn rounded_mapping_size(mapping: &Mapping) -> u64 {
    let size = mapping.memory_limit.wrapping_sub(mapping.memory_start);
    size.wrapping_add(MAPSIZE_ROUNDING - 1) & !(MAPSIZE_ROUNDING - 1)
}

/// Mappings with neither build id nor filename are synthetic; the empty key
/// lets them all match each other.
fn build_id_or_filename(profile: &Profile, build_id: i64, filename: i64) -> i64 {
    if !profile.str_at(build_id).is_empty() {
        build_id
    } else if !profile.str_at(filename).is_empty() {
        filename
    } else {
        0
    }
}

fn location_key(profile: &Profile, location: &Location) -> LocationKey {
    let mut address = location.address;
    if location.mapping_id != 0 {
        if let Some(mapping) = profile.mapping.get(location.mapping_id as usize - 1) {
            address = address.wrapping_sub(mapping.memory_start);
        }
    }
    LocationKey {
        mapping_id: location.mapping_id,
        address,
        is_folded: location.is_folded,
        lines: location
            .line
            .iter()
            .map(|l| (l.function_id, l.line))
            .collect(),
    }
}

fn label_key(labels: &[Label]) -> Vec<(i64, i64, i64, i64)> {
    let mut key: Vec<_> = labels
        .iter()
        .map(|l| (l.key, l.str, l.num, l.num_unit))
        .collect();
    key.sort_unstable();
    key
}

fn remap_index(remap: &[i64], idx: i64) -> i64 {
    usize::try_from(idx)
        .ok()
        .and_then(|i| remap.get(i))
        .copied()
        .unwrap_or(0)
}
