//! Turns raw zero-fill tool output into progress samples.
//!
//! The only contract with the external tool is textual: a progress line holds an
//! ASCII decimal digit run followed by the word `bytes`, as in
//! `"1048576000 bytes (1.0 GB, 1000 MiB) copied, 5 s, 210 MB/s"`. Everything that
//! does not match is plain log output.

use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{self, BufRead, BufReader, Read};

static BYTES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+) bytes").expect("progress pattern is valid"));

/// A byte-count checkpoint recognized in one line of tool output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressSample {
    pub bytes_written: u64,
    /// `None` when the total size of the device is unknown.
    pub percent: Option<u8>,
}

/// Parses one line of tool output.
///
/// Returns `None` for lines without a byte count, including digit runs that do
/// not fit in a `u64`. Never panics.
pub fn parse(line: &str, total_bytes: u64) -> Option<ProgressSample> {
    let caps = BYTES_RE.captures(line)?;
    let bytes_written: u64 = caps.get(1)?.as_str().parse().ok()?;
    Some(ProgressSample {
        bytes_written,
        percent: percent_of(bytes_written, total_bytes),
    })
}

/// `floor(bytes * 100 / total)` clamped to 100, or `None` for an unknown total.
pub fn percent_of(bytes: u64, total_bytes: u64) -> Option<u8> {
    if total_bytes == 0 {
        return None;
    }
    let pct = (u128::from(bytes) * 100 / u128::from(total_bytes)).min(100);
    Some(pct as u8)
}

/// Splits a byte stream into lines on both `\n` and `\r`.
///
/// GNU `dd status=progress` redraws its status line with carriage returns, so a
/// plain `BufRead::lines` would only yield it once the tool exits. Blank
/// fragments are skipped and invalid UTF-8 is replaced.
pub struct OutputLines<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    done: bool,
}

impl<R: Read> OutputLines<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
            done: false,
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() { None } else { Some(line) }
    }
}

impl<R: Read> Iterator for OutputLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if available.is_empty() {
                self.done = true;
                return self.take_line().map(Ok);
            }

            match available.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(pos) => {
                    self.pending.extend_from_slice(&available[..pos]);
                    self.reader.consume(pos + 1);
                    if let Some(line) = self.take_line() {
                        return Some(Ok(line));
                    }
                }
                None => {
                    let len = available.len();
                    self.pending.extend_from_slice(available);
                    self.reader.consume(len);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_dd_progress_line() {
        let sample = parse("12345 bytes (12 KB) copied", 100_000).unwrap();
        assert_eq!(sample.bytes_written, 12345);
        assert_eq!(sample.percent, Some(12));
    }

    #[test]
    fn garbage_is_not_progress() {
        assert_eq!(parse("garbage line with no numbers", 100_000), None);
        assert_eq!(parse("", 100_000), None);
        assert_eq!(parse("1+0 records in", 100_000), None);
        assert_eq!(parse("bytes 123", 100_000), None);
    }

    #[test]
    fn unknown_total_yields_no_percent() {
        let sample = parse("4096 bytes copied", 0).unwrap();
        assert_eq!(sample.bytes_written, 4096);
        assert_eq!(sample.percent, None);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(parse("200000 bytes", 100_000).unwrap().percent, Some(100));
        assert_eq!(percent_of(u64::MAX, 1), Some(100));
        assert_eq!(percent_of(0, 1), Some(0));
    }

    #[test]
    fn overflowing_digit_run_is_ignored() {
        assert_eq!(parse("99999999999999999999999 bytes", 100), None);
    }

    #[test]
    fn uses_the_run_directly_before_bytes() {
        let sample = parse("1,048,576 1048576 bytes", 1_048_576 * 4).unwrap();
        assert_eq!(sample.bytes_written, 1_048_576);
        assert_eq!(sample.percent, Some(25));
    }

    #[test]
    fn non_ascii_digits_are_not_a_byte_count() {
        let sample = parse("٣٣ bytes, 5000 bytes copied", 10_000).unwrap();
        assert_eq!(sample.bytes_written, 5000);
        assert_eq!(sample.percent, Some(50));
        assert_eq!(parse("٣٣ bytes", 10_000), None);
    }

    #[test]
    fn splits_on_carriage_returns_and_newlines() {
        let raw = b"100 bytes copied\r200 bytes copied\r\n1+0 records in\n\n   \nlast";
        let lines: Vec<String> = OutputLines::new(&raw[..]).map(Result::unwrap).collect();
        assert_eq!(
            lines,
            vec!["100 bytes copied", "200 bytes copied", "1+0 records in", "last"]
        );
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let raw = b"ab\xffcd\n";
        let lines: Vec<String> = OutputLines::new(&raw[..]).map(Result::unwrap).collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ab"));
    }

    proptest! {
        #[test]
        fn parse_never_panics(line in ".*", total in any::<u64>()) {
            let _ = parse(&line, total);
        }

        #[test]
        fn percent_stays_in_range(bytes in any::<u64>(), total in 1u64..) {
            let line = format!("{bytes} bytes (x) copied");
            let pct = parse(&line, total).unwrap().percent.unwrap();
            prop_assert!(pct <= 100);
        }
    }
}
