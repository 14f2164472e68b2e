use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use tracing::debug;
use zip::ZipArchive;

/// Drain every line of the first entry of a zip archive, invoking `f` with
/// `(line_index, bytes)` for each complete line. Lines before `skip_lines`
/// are decompressed but not delivered, which is how a partially ingested
/// archive resumes after a restart. Returns the total number of lines seen.
///
/// Archives appear when the platform compresses a rotated-out journal file;
/// they are static by the time we read them, so this is a one-shot drain
/// rather than a tail.
pub fn for_each_line<F>(path: &Path, skip_lines: u64, mut f: F) -> io::Result<u64>
where
    F: FnMut(u64, &[u8]),
{
    let file = File::open(path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if archive.is_empty() {
        debug!(message = "Archive holds no entries.", path = ?path);
        return Ok(0);
    }
    let entry = archive
        .by_index(0)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut reader = BufReader::new(entry);
    let mut line = Vec::with_capacity(2048);
    let mut index: u64 = 0;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if index >= skip_lines {
            f(index, &line);
        }
        index += 1;
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    use super::for_each_line;

    fn write_archive(path: &std::path::Path, contents: &[u8]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("2025111310.log", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn drains_all_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2025111310.log.zip");
        write_archive(&path, b"first\nsecond\nthird\n");

        let mut seen = Vec::new();
        let total = for_each_line(&path, 0, |i, bytes| {
            seen.push((i, String::from_utf8_lossy(bytes).into_owned()));
        })
        .unwrap();

        assert_eq!(total, 3);
        assert_eq!(seen[0], (0, "first".into()));
        assert_eq!(seen[2], (2, "third".into()));
    }

    #[test]
    fn skips_already_ingested_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2025111310.log.zip");
        write_archive(&path, b"first\nsecond\nthird\n");

        let mut seen = Vec::new();
        let total = for_each_line(&path, 2, |i, bytes| {
            seen.push((i, bytes.to_vec()));
        })
        .unwrap();

        assert_eq!(total, 3);
        assert_eq!(seen, vec![(2, b"third".to_vec())]);
    }
}
