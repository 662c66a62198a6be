use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use regex::Regex;

use crate::error::FetchError;

/// Extracts exactly one CSV member from `zip_path` into `dest_dir`.
///
/// Opening the archive verifies its central directory; zero or multiple
/// matching members is ambiguity and fails with an integrity error.
pub fn extract_single_csv(
    zip_path: &Path,
    member_pattern: Option<&Regex>,
    dest_dir: &Path,
    source: &str,
) -> Result<PathBuf, FetchError> {
    let file = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| FetchError::Integrity {
        source_id: source.to_string(),
        msg: format!("corrupt zip archive: {e}"),
    })?;

    let matches: Vec<usize> = (0..archive.len())
        .filter(|&i| {
            archive
                .by_index(i)
                .map(|member| {
                    let name = member.name();
                    name.to_ascii_lowercase().ends_with(".csv")
                        && member_pattern.is_none_or(|p| p.is_match(name))
                })
                .unwrap_or(false)
        })
        .collect();

    let index = match matches.as_slice() {
        [index] => *index,
        [] => {
            return Err(FetchError::Integrity {
                source_id: source.to_string(),
                msg: "no CSV member in archive".to_string(),
            });
        }
        many => {
            return Err(FetchError::Integrity {
                source_id: source.to_string(),
                msg: format!("{} CSV members match, expected exactly one", many.len()),
            });
        }
    };

    let mut member = archive.by_index(index).map_err(|e| FetchError::Integrity {
        source_id: source.to_string(),
        msg: format!("failed to open zip member: {e}"),
    })?;

    // Member names can carry paths; keep only the file name.
    let member_name = Path::new(member.name())
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| FetchError::Integrity {
            source_id: source.to_string(),
            msg: "zip member has no file name".to_string(),
        })?;

    let mut contents = Vec::with_capacity(member.size() as usize);
    member
        .read_to_end(&mut contents)
        .map_err(|e| FetchError::Integrity {
            source_id: source.to_string(),
            msg: format!("truncated zip member: {e}"),
        })?;

    let final_path = dest_dir.join(member_name);
    let tmp_path = final_path.with_extension("csv.tmp");
    let mut out = fs::File::create(&tmp_path)?;
    out.write_all(&contents)?;
    out.sync_all()?;
    fs::rename(&tmp_path, &final_path)?;

    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn zip_with_members(dir: &Path, members: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("bulletin.zip");
        let file = fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in members {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn extracts_the_single_csv() {
        let dir = tempfile::tempdir().unwrap();
        let zip = zip_with_members(
            dir.path(),
            &[("BhavCopy_NSE_CM_20240102.csv", "SYMBOL,OPEN\nRELIANCE,2600\n")],
        );

        let out = extract_single_csv(&zip, None, dir.path(), "nse_cm_bhavcopy").unwrap();
        let body = fs::read_to_string(&out).unwrap();
        assert!(body.starts_with("SYMBOL,OPEN"));
    }

    #[test]
    fn ambiguity_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let zip = zip_with_members(dir.path(), &[("a.csv", "x"), ("b.csv", "y")]);

        let err = extract_single_csv(&zip, None, dir.path(), "nse_cm_bhavcopy").unwrap_err();
        assert!(matches!(err, FetchError::Integrity { .. }));
    }

    #[test]
    fn member_pattern_disambiguates() {
        let dir = tempfile::tempdir().unwrap();
        let zip = zip_with_members(
            dir.path(),
            &[("readme.csv", "x"), ("BhavCopy_NSE_CM_20240102.csv", "y")],
        );

        let pattern = Regex::new(r"^BhavCopy.*\.csv$").unwrap();
        let out =
            extract_single_csv(&zip, Some(&pattern), dir.path(), "nse_cm_bhavcopy").unwrap();
        assert!(out.ends_with("BhavCopy_NSE_CM_20240102.csv"));
    }

    #[test]
    fn missing_csv_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let zip = zip_with_members(dir.path(), &[("notes.txt", "hello")]);

        let err = extract_single_csv(&zip, None, dir.path(), "nse_cm_bhavcopy").unwrap_err();
        assert!(matches!(err, FetchError::Integrity { .. }));
    }

    #[test]
    fn corrupt_archive_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.zip");
        fs::write(&path, b"this is not a zip").unwrap();

        let err = extract_single_csv(&path, None, dir.path(), "nse_cm_bhavcopy").unwrap_err();
        assert!(matches!(err, FetchError::Integrity { .. }));
    }
}
