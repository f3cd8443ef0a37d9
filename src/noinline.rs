//! Rename pass for functions that must not become PGO inlining candidates.
//!
//! A handful of hot runtime functions regress badly when a profile-guided
//! build inlines them (see golang/go#65532 for the gRPC case). Prefixing the
//! function name in the artifact makes them invisible to the inliner without
//! touching the sample data.

use std::collections::HashSet;

use crate::pprof::{Profile, Sample};

const GRPC_PROCESS_DATA_FUNC: &str =
    "google.golang.org/grpc/internal/transport.(*loopyWriter).processData";
const RUNTIME_GOPARK_FUNC: &str = "runtime.gopark";

const DO_NOT_INLINE_PREFIX: &str = "DO NOT INLINE: ";

/// Rename known-pathological functions that appear as the first line of a
/// leaf frame. The rename happens on the shared function record, so the pass
/// is idempotent: a renamed function no longer matches the list.
pub fn apply_noinline_hack(profile: &mut Profile) {
    rename_noinline_funcs(profile, &[GRPC_PROCESS_DATA_FUNC, RUNTIME_GOPARK_FUNC]);
}

fn rename_noinline_funcs(profile: &mut Profile, noinline_funcs: &[&str]) {
    let mut rename: HashSet<u64> = HashSet::new();
    for sample in &profile.sample {
        let function_id = match leaf_function_id(profile, sample) {
            Some(id) => id,
            None => continue,
        };
        if noinline_funcs.contains(&function_name(profile, function_id)) {
            rename.insert(function_id);
        }
    }

    for function_id in rename {
        let idx = (function_id - 1) as usize;
        let renamed = format!(
            "{DO_NOT_INLINE_PREFIX}{}",
            profile.str_at(profile.function[idx].name)
        );
        let name = profile.intern(&renamed);
        profile.function[idx].name = name;
    }
}

/// Function on the first line of the sample's leaf location, if any.
fn leaf_function_id(profile: &Profile, sample: &Sample) -> Option<u64> {
    let &location_id = sample.location_id.first()?;
    let location = profile
        .location
        .get(usize::try_from(location_id).ok()?.checked_sub(1)?)?;
    let line = location.line.first()?;
    if line.function_id == 0 {
        None
    } else {
        Some(line.function_id)
    }
}

fn function_name(profile: &Profile, function_id: u64) -> &str {
    profile
        .function
        .get(function_id as usize - 1)
        .map(|f| profile.str_at(f.name))
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pprof::{Function, Line, Location, Sample, ValueType};

    fn profile_with_leaves(leaves: &[&str]) -> Profile {
        let mut profile = Profile {
            string_table: vec![String::new(), "cpu".to_string(), "nanoseconds".to_string()],
            sample_type: vec![ValueType { r#type: 1, unit: 2 }],
            ..Profile::default()
        };
        for (i, leaf) in leaves.iter().enumerate() {
            let name = profile.intern(leaf);
            let id = (i + 1) as u64;
            profile.function.push(Function {
                id,
                name,
                system_name: name,
                filename: 0,
                start_line: 0,
            });
            profile.location.push(Location {
                id,
                mapping_id: 0,
                address: 0x100 * id,
                line: vec![Line {
                    function_id: id,
                    line: 1,
                }],
                is_folded: false,
            });
            profile.sample.push(Sample {
                location_id: vec![id],
                value: vec![1],
                label: vec![],
            });
        }
        profile
    }

    fn names(profile: &Profile) -> Vec<&str> {
        profile
            .function
            .iter()
            .map(|f| profile.str_at(f.name))
            .collect()
    }

    #[test]
    fn test_renames_pathological_leaf_functions() {
        let mut profile = profile_with_leaves(&[
            GRPC_PROCESS_DATA_FUNC,
            RUNTIME_GOPARK_FUNC,
            "main.compute",
        ]);
        apply_noinline_hack(&mut profile);

        let names = names(&profile);
        assert_eq!(
            names[0],
            "DO NOT INLINE: google.golang.org/grpc/internal/transport.(*loopyWriter).processData"
        );
        assert_eq!(names[1], "DO NOT INLINE: runtime.gopark");
        assert_eq!(names[2], "main.compute");
    }

    #[test]
    fn test_is_idempotent() {
        let mut profile = profile_with_leaves(&[RUNTIME_GOPARK_FUNC]);
        apply_noinline_hack(&mut profile);
        apply_noinline_hack(&mut profile);
        assert_eq!(names(&profile)[0], "DO NOT INLINE: runtime.gopark");
    }

    #[test]
    fn test_ignores_non_leaf_occurrences() {
        // gopark only appears as the caller, never the leaf.
        let mut profile = profile_with_leaves(&["main.compute", RUNTIME_GOPARK_FUNC]);
        profile.sample.truncate(1);
        profile.sample[0].location_id = vec![1, 2];
        apply_noinline_hack(&mut profile);
        assert_eq!(names(&profile)[1], RUNTIME_GOPARK_FUNC);
    }

    #[test]
    fn test_ignores_samples_without_frames() {
        let mut profile = profile_with_leaves(&[]);
        profile.sample.push(Sample {
            location_id: vec![],
            value: vec![1],
            label: vec![],
        });
        apply_noinline_hack(&mut profile);
        assert_eq!(profile.function.len(), 0);
    }
}
