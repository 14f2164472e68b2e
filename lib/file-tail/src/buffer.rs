use std::io::{self, BufRead};

use bstr::Finder;
use bytes::BytesMut;
use tracing::warn;

use crate::FilePosition;

/// Outcome of a single delimiter scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanResult {
    /// A delimiter was found; `buf` now ends at the byte before it and the
    /// inner value is the total number of bytes consumed from the reader,
    /// delimiter included.
    Delimited(usize),
    /// The reader is exhausted without a delimiter. Bytes read so far stay in
    /// `buf`; calling again once the file has grown continues the same line.
    Pending,
}

/// Scan `reader` for the next `delim`, appending the line bytes to `buf` and
/// advancing `position` by everything consumed.
///
/// Lines longer than `max_size` are discarded wholesale: the scan keeps
/// consuming (and keeps `position` accurate) until the delimiter, then clears
/// `buf` and moves on to the next line. An EOF in the middle of a line leaves
/// the partial bytes in `buf` so that a sheared write can complete on a later
/// call; this makes the function safe to drive from a polling tailer.
pub fn read_until_with_max_size<R: BufRead + ?Sized>(
    reader: &mut R,
    position: &mut FilePosition,
    delim: &[u8],
    buf: &mut BytesMut,
    max_size: usize,
) -> io::Result<ScanResult> {
    let finder = Finder::new(delim);
    let mut total_read = 0;
    let mut discarding = false;
    loop {
        let available = match reader.fill_buf() {
            Ok(chunk) => chunk,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let (found, used) = match finder.find(available) {
            Some(i) => {
                if !discarding {
                    buf.extend_from_slice(&available[..i]);
                }
                (true, i + delim.len())
            }
            None => {
                if !discarding {
                    buf.extend_from_slice(available);
                }
                (false, available.len())
            }
        };
        reader.consume(used);
        *position += used as u64;
        total_read += used;

        if !discarding && buf.len() > max_size {
            warn!(message = "Line exceeds the configured maximum; discarding.");
            discarding = true;
        }

        if found {
            if discarding {
                discarding = false;
                buf.clear();
            } else {
                return Ok(ScanResult::Delimited(total_read));
            }
        } else if used == 0 {
            return Ok(ScanResult::Pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;
    use quickcheck::{QuickCheck, TestResult};

    use super::{read_until_with_max_size, ScanResult};

    #[test]
    fn finds_delimited_lines() {
        let mut reader = Cursor::new(&b"alpha\nbeta\n"[..]);
        let mut position = 0;
        let mut buf = BytesMut::new();

        let res = read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 64);
        assert_eq!(res.unwrap(), ScanResult::Delimited(6));
        assert_eq!(&buf[..], b"alpha");
        assert_eq!(position, 6);

        buf.clear();
        let res = read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 64);
        assert_eq!(res.unwrap(), ScanResult::Delimited(5));
        assert_eq!(&buf[..], b"beta");
        assert_eq!(position, 11);
    }

    #[test]
    fn partial_line_survives_across_calls() {
        let mut position = 0;
        let mut buf = BytesMut::new();

        let mut reader = Cursor::new(&b"half"[..]);
        let res = read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 64);
        assert_eq!(res.unwrap(), ScanResult::Pending);
        assert_eq!(&buf[..], b"half");

        // The rest of the write becomes visible later.
        let mut reader = Cursor::new(&b"-full\n"[..]);
        let res = read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 64);
        assert_eq!(res.unwrap(), ScanResult::Delimited(6));
        assert_eq!(&buf[..], b"half-full");
        assert_eq!(position, 10);
    }

    #[test]
    fn oversized_lines_are_discarded_whole() {
        let mut reader = Cursor::new(&b"tiny\nthis one is far too long\nok\n"[..]);
        let mut position = 0;
        let mut buf = BytesMut::new();

        let res = read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 8);
        assert_eq!(res.unwrap(), ScanResult::Delimited(5));
        assert_eq!(&buf[..], b"tiny");

        buf.clear();
        // The oversized line is consumed and dropped; the next short line is
        // returned instead, with `position` covering both.
        let res = read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 8);
        assert_eq!(res.unwrap(), ScanResult::Delimited(28));
        assert_eq!(&buf[..], b"ok");
        assert_eq!(position, 33);
    }

    #[test]
    fn position_always_matches_consumed_bytes() {
        fn prop(lines: Vec<Vec<u8>>, max_size: u8) -> TestResult {
            if max_size == 0 {
                return TestResult::discard();
            }
            let mut input = Vec::new();
            for line in &lines {
                input.extend(line.iter().filter(|&&b| b != b'\n'));
                input.push(b'\n');
            }

            let mut reader = Cursor::new(&input[..]);
            let mut position = 0;
            let mut buf = BytesMut::new();
            loop {
                buf.clear();
                match read_until_with_max_size(
                    &mut reader,
                    &mut position,
                    b"\n",
                    &mut buf,
                    max_size as usize,
                )
                .unwrap()
                {
                    ScanResult::Delimited(_) => {
                        assert!(buf.len() <= max_size as usize);
                    }
                    ScanResult::Pending => break,
                }
            }
            assert_eq!(position, input.len() as u64);
            TestResult::passed()
        }

        QuickCheck::new()
            .tests(500)
            .quickcheck(prop as fn(Vec<Vec<u8>>, u8) -> TestResult);
    }
}
