//! Shared merge state for the acquisition pipeline.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::pprof::Profile;

/// Lock-guarded accumulation of downloaded profiles into a single union.
///
/// The first profile is adopted as the base; later ones fold in through
/// [`Profile::merge_from`]. Per-sample labels are stripped before merging.
/// Download tasks share the accumulator behind an `Arc` and merge as soon as
/// their payload decodes.
pub struct Accumulator {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    profile: Option<Profile>,
    profile_ids: Vec<String>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Fold one downloaded profile into the accumulated state, recording
    /// `source_id` as a contributor. Blocks while another merge is in flight;
    /// on failure the previously accumulated state is kept as it was.
    pub fn merge(&self, source_id: &str, mut profile: Profile) -> Result<()> {
        profile.strip_labels();
        let mut state = self
            .state
            .lock()
            .map_err(|e| Error::Merge(format!("accumulator lock poisoned: {e}")))?;
        if let Some(current) = state.profile.as_mut() {
            current.merge_from(profile)?;
        } else {
            state.profile = Some(profile);
        }
        state.profile_ids.push(source_id.to_string());
        Ok(())
    }

    /// Consume the accumulator, yielding the merged result. Errors when no
    /// profile was ever merged: an empty union has no serialized form.
    pub fn finalize(self) -> Result<MergedProfile> {
        let state = self
            .state
            .into_inner()
            .map_err(|e| Error::Merge(format!("accumulator lock poisoned: {e}")))?;
        let profile = state.profile.ok_or(Error::NoProfiles)?;
        Ok(MergedProfile {
            profile,
            profile_ids: state.profile_ids,
        })
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Finalized union of all downloaded profiles.
#[derive(Debug)]
pub struct MergedProfile {
    profile: Profile,
    profile_ids: Vec<String>,
}

impl MergedProfile {
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Mutable access for post-merge passes over the artifact.
    pub fn profile_mut(&mut self) -> &mut Profile {
        &mut self.profile
    }

    /// Profile ids that contributed to the union, in merge order.
    pub fn contributors(&self) -> &[String] {
        &self.profile_ids
    }

    pub fn sample_count(&self) -> usize {
        self.profile.sample_count()
    }

    /// Catalog query matching exactly the contributing profiles, so a merged
    /// artifact can be traced back to its inputs.
    pub fn debug_query(&self) -> String {
        format!("profile-id:({})", self.profile_ids.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pprof::{Function, Label, Line, Location, Sample, ValueType};

    fn profile_with_stack(frame: &str, value: i64) -> Profile {
        let mut profile = Profile {
            string_table: vec![String::new(), "cpu".to_string(), "nanoseconds".to_string()],
            sample_type: vec![ValueType { r#type: 1, unit: 2 }],
            period_type: Some(ValueType { r#type: 1, unit: 2 }),
            ..Profile::default()
        };
        let name = profile.intern(frame);
        profile.function.push(Function {
            id: 1,
            name,
            system_name: name,
            filename: 0,
            start_line: 0,
        });
        profile.location.push(Location {
            id: 1,
            mapping_id: 0,
            address: 0x1000,
            line: vec![Line {
                function_id: 1,
                line: 3,
            }],
            is_folded: false,
        });
        profile.sample.push(Sample {
            location_id: vec![1],
            value: vec![value],
            label: vec![],
        });
        profile
    }

    fn total(profile: &Profile) -> i64 {
        profile.sample.iter().map(|s| s.value[0]).sum()
    }

    #[test]
    fn test_adopts_first_then_merges() {
        let accumulator = Accumulator::new();
        accumulator
            .merge("prof-a", profile_with_stack("main.alpha", 10))
            .unwrap();
        accumulator
            .merge("prof-b", profile_with_stack("main.beta", 20))
            .unwrap();

        let merged = accumulator.finalize().unwrap();
        assert_eq!(merged.contributors(), ["prof-a", "prof-b"]);
        assert_eq!(merged.sample_count(), 2);
        assert_eq!(total(merged.profile()), 30);
    }

    #[test]
    fn test_strips_labels_and_folds_label_variants() {
        // Two samples on the same stack distinguished only by labels, plus a
        // second profile on that stack: after stripping, all three fold into
        // one sample.
        let mut a = profile_with_stack("main.hot", 10);
        let key = a.intern("worker");
        let value = a.intern("pool-1");
        a.sample.push(Sample {
            location_id: vec![1],
            value: vec![5],
            label: vec![Label {
                key,
                str: value,
                num: 0,
                num_unit: 0,
            }],
        });

        let accumulator = Accumulator::new();
        accumulator.merge("prof-a", a).unwrap();
        accumulator
            .merge("prof-b", profile_with_stack("main.hot", 20))
            .unwrap();

        let merged = accumulator.finalize().unwrap();
        assert_eq!(merged.sample_count(), 1);
        assert_eq!(total(merged.profile()), 35);
        assert!(merged.profile().sample.iter().all(|s| s.label.is_empty()));
    }

    #[test]
    fn test_finalize_without_merges_is_an_error() {
        let accumulator = Accumulator::new();
        assert!(matches!(
            accumulator.finalize(),
            Err(Error::NoProfiles)
        ));
    }

    #[test]
    fn test_failed_merge_keeps_previous_state() {
        let accumulator = Accumulator::new();
        accumulator
            .merge("prof-a", profile_with_stack("main.alpha", 10))
            .unwrap();

        let mut incompatible = profile_with_stack("main.beta", 20);
        incompatible.string_table[1] = "wall".to_string();
        assert!(accumulator.merge("prof-b", incompatible).is_err());

        let merged = accumulator.finalize().unwrap();
        assert_eq!(merged.contributors(), ["prof-a"]);
        assert_eq!(total(merged.profile()), 10);
    }

    #[test]
    fn test_merges_from_multiple_threads() {
        let accumulator = Accumulator::new();
        std::thread::scope(|scope| {
            for i in 0..4 {
                let accumulator = &accumulator;
                scope.spawn(move || {
                    accumulator
                        .merge(&format!("prof-{i}"), profile_with_stack("main.hot", 10))
                        .unwrap();
                });
            }
        });

        let merged = accumulator.finalize().unwrap();
        assert_eq!(merged.contributors().len(), 4);
        assert_eq!(merged.sample_count(), 1);
        assert_eq!(total(merged.profile()), 40);
    }

    #[test]
    fn test_debug_query_lists_contributors() {
        let accumulator = Accumulator::new();
        accumulator
            .merge("abc", profile_with_stack("main.alpha", 1))
            .unwrap();
        accumulator
            .merge("def", profile_with_stack("main.beta", 2))
            .unwrap();
        let merged = accumulator.finalize().unwrap();
        assert_eq!(merged.debug_query(), "profile-id:(abc OR def)");
    }
}
