//! Downloaded profile bundles.
//!
//! The catalog serves profiles as zip bundles holding one file per captured
//! profile type; only the CPU profile feeds the merge.

use std::io::{Cursor, Read};
use std::path::Path;

use zip::ZipArchive;

use crate::error::{Error, Result};

/// Entry name of the CPU profile inside a downloaded bundle.
pub const CPU_PROFILE_ENTRY: &str = "cpu.pprof";

/// Extract the raw CPU profile payload from a downloaded zip bundle.
/// The entry is matched by base name, however deep the bundle nests it.
pub fn extract_cpu_profile(data: &[u8]) -> Result<Vec<u8>> {
    let mut archive =
        ZipArchive::new(Cursor::new(data)).map_err(|e| Error::Archive(format!("open bundle: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::Archive(format!("read bundle entry {i}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let base = Path::new(&name).file_name().and_then(|n| n.to_str());
        if base == Some(CPU_PROFILE_ENTRY) {
            let mut payload = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut payload)
                .map_err(|e| Error::Archive(format!("read {name}: {e}")))?;
            return Ok(payload);
        }
    }

    Err(Error::Archive(format!(
        "no {CPU_PROFILE_ENTRY} entry in bundle"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn bundle(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, payload) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(payload).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_finds_entry_by_base_name() {
        let data = bundle(&[
            ("metadata.json", b"{}"),
            ("profiles/cpu.pprof", b"payload"),
            ("profiles/heap.pprof", b"other"),
        ]);
        assert_eq!(extract_cpu_profile(&data).unwrap(), b"payload");
    }

    #[test]
    fn test_errors_when_entry_missing() {
        let data = bundle(&[("profiles/heap.pprof", b"other")]);
        let err = extract_cpu_profile(&data).unwrap_err();
        assert!(err.to_string().contains("no cpu.pprof"));
    }

    #[test]
    fn test_errors_on_non_zip_payload() {
        assert!(matches!(
            extract_cpu_profile(b"definitely not a zip"),
            Err(Error::Archive(_))
        ));
    }
}
