//! Writing the merged profile to disk.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::accumulator::MergedProfile;
use crate::error::Result;
use crate::pprof;

/// Serialize `merged` to `dst` as a gzipped pprof artifact. Returns the
/// number of compressed bytes written. An existing file is truncated.
pub fn write(merged: &MergedProfile, dst: &Path) -> Result<u64> {
    let file = File::create(dst)?;
    let mut writer = BufWriter::new(file);
    let written = pprof::serialize(merged.profile(), &mut writer)?;
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::Accumulator;
    use crate::pprof::{Function, Line, Location, Profile, Sample, ValueType};

    #[test]
    fn test_writes_a_parseable_artifact() -> anyhow::Result<()> {
        let profile = Profile {
            string_table: vec![
                String::new(),
                "cpu".to_string(),
                "nanoseconds".to_string(),
                "main.run".to_string(),
            ],
            sample_type: vec![ValueType { r#type: 1, unit: 2 }],
            period_type: Some(ValueType { r#type: 1, unit: 2 }),
            function: vec![Function {
                id: 1,
                name: 3,
                system_name: 3,
                filename: 0,
                start_line: 0,
            }],
            location: vec![Location {
                id: 1,
                mapping_id: 0,
                address: 0x1000,
                line: vec![Line {
                    function_id: 1,
                    line: 42,
                }],
                is_folded: false,
            }],
            sample: vec![Sample {
                location_id: vec![1],
                value: vec![10],
                label: vec![],
            }],
            ..Profile::default()
        };

        let accumulator = Accumulator::new();
        accumulator.merge("prof-1", profile)?;
        let merged = accumulator.finalize()?;

        let file = tempfile::NamedTempFile::new()?;
        let written = write(&merged, file.path())?;
        assert!(written > 0);

        let data = std::fs::read(file.path())?;
        assert_eq!(written, data.len() as u64);

        let reparsed = pprof::parse(&data)?;
        assert_eq!(reparsed.sample_count(), merged.sample_count());
        Ok(())
    }
}
