//! Streaming, validating parser for `title.ratings.tsv`.
//!
//! The input is read in fixed-size chunks into a single growable buffer. Each
//! completed line is inspected in place; only rows that survive the filter
//! allocate. Whole-file statistics (row count, parse errors) are gathered in
//! both filtered and unfiltered mode and decide whether the download is
//! trustworthy at all.

use std::path::Path;

use atoi::FromRadix10Checked;
use memchr::memchr;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::filter::IdFilter;
use super::{RatingRecord, RatingsTable, EXPECTED_HEADER};
use crate::error::{SyncError, ValidationError};

const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Plausibility thresholds for a full dataset snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParseLimits {
    /// Fewer valid rows than this means the download was cut short.
    pub min_rows: u64,
    /// Parse errors / total rows above this means the bytes are damaged.
    pub max_error_ratio: f64,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            min_rows: 500_000,
            max_error_ratio: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ParseStats {
    pub total_rows: u64,
    pub parse_errors: u64,
    pub valid_rows: u64,
    /// Entries retained in the table (after filtering and de-duplication).
    pub matched: u64,
}

#[derive(Debug)]
pub struct ParsedRatings {
    pub table: RatingsTable,
    pub stats: ParseStats,
}

pub struct RatingsParser<'f> {
    limits: ParseLimits,
    filter: Option<&'f IdFilter>,
    buffer_capacity: usize,
}

impl<'f> RatingsParser<'f> {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            filter: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Retain only rows whose identifier is in `filter`. Validation still covers every row.
    pub fn with_filter(mut self, filter: &'f IdFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Initial read buffer size; it still doubles for lines longer than this.
    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes.max(1);
        self
    }

    #[instrument(skip(self, cancel), fields(path = %path.display(), filtered = self.filter.is_some()))]
    pub async fn parse_path(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ParsedRatings, SyncError> {
        let file = File::open(path)
            .await
            .map_err(|e| SyncError::io(path, e))?;
        let parsed = self.parse_reader(file, cancel).await.map_err(|e| match e {
            SyncError::Io { source, .. } => SyncError::io(path, source),
            other => other,
        })?;
        info!(
            total_rows = parsed.stats.total_rows,
            parse_errors = parsed.stats.parse_errors,
            valid_rows = parsed.stats.valid_rows,
            matched = parsed.stats.matched,
            "ratings dataset parsed"
        );
        Ok(parsed)
    }

    pub async fn parse_reader<R>(
        &self,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<ParsedRatings, SyncError>
    where
        R: AsyncRead + Unpin,
    {
        let mut sink = LineSink::new(self.filter);
        let mut buf = vec![0u8; self.buffer_capacity];
        let mut filled = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if filled == buf.len() {
                // A single unterminated line fills the whole buffer.
                let grown = buf.len() * 2;
                buf.resize(grown, 0);
            }
            let n = reader
                .read(&mut buf[filled..])
                .await
                .map_err(|e| SyncError::io("<reader>", e))?;
            if n == 0 {
                break;
            }
            let end = filled + n;

            // Bytes before `filled` are a remainder that held no newline.
            let mut start = 0usize;
            let mut search_from = filled;
            while let Some(pos) = memchr(b'\n', &buf[search_from..end]) {
                let newline = search_from + pos;
                sink.accept(&buf[start..newline])?;
                start = newline + 1;
                search_from = start;
            }

            buf.copy_within(start..end, 0);
            filled = end - start;
        }

        if filled > 0 {
            sink.accept(&buf[..filled])?;
        }

        Ok(sink.finish(&self.limits)?)
    }
}

struct LineSink<'f> {
    filter: Option<&'f IdFilter>,
    header_seen: bool,
    stats: ParseStats,
    table: RatingsTable,
}

impl<'f> LineSink<'f> {
    fn new(filter: Option<&'f IdFilter>) -> Self {
        Self {
            filter,
            header_seen: false,
            stats: ParseStats::default(),
            table: RatingsTable::new(),
        }
    }

    fn accept(&mut self, line: &[u8]) -> Result<(), ValidationError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return Ok(());
        }
        if !self.header_seen {
            if line != EXPECTED_HEADER.as_bytes() {
                return Err(ValidationError::InvalidHeader {
                    expected: EXPECTED_HEADER,
                });
            }
            self.header_seen = true;
            return Ok(());
        }

        self.stats.total_rows += 1;
        let Some((id, record)) = parse_row(line) else {
            self.stats.parse_errors += 1;
            return Ok(());
        };
        self.stats.valid_rows += 1;
        if self.filter.map_or(true, |f| f.matches(id.as_bytes())) {
            self.table.insert(id.to_owned(), record);
        }
        Ok(())
    }

    fn finish(mut self, limits: &ParseLimits) -> Result<ParsedRatings, ValidationError> {
        if !self.header_seen {
            return Err(ValidationError::InvalidHeader {
                expected: EXPECTED_HEADER,
            });
        }
        let stats = &mut self.stats;
        if stats.valid_rows == 0 {
            return Err(ValidationError::NoValidRows {
                total_rows: stats.total_rows,
                parse_errors: stats.parse_errors,
            });
        }
        if stats.valid_rows < limits.min_rows {
            return Err(ValidationError::Truncated {
                valid_rows: stats.valid_rows,
                min_rows: limits.min_rows,
            });
        }
        let ratio = stats.parse_errors as f64 / stats.total_rows as f64;
        if ratio > limits.max_error_ratio {
            return Err(ValidationError::Corrupt {
                parse_errors: stats.parse_errors,
                total_rows: stats.total_rows,
                max_ratio: limits.max_error_ratio,
            });
        }
        stats.matched = self.table.len() as u64;
        Ok(ParsedRatings {
            table: self.table,
            stats: self.stats,
        })
    }
}

/// Splits `id\trating\tvotes`. Every field must be consumed entirely by its parser.
fn parse_row(line: &[u8]) -> Option<(&str, RatingRecord)> {
    let first = memchr(b'\t', line)?;
    let id = &line[..first];
    let rest = &line[first + 1..];
    let second = memchr(b'\t', rest)?;
    let rating = &rest[..second];
    let votes = &rest[second + 1..];
    if id.is_empty() || memchr(b'\t', votes).is_some() {
        return None;
    }
    let id = std::str::from_utf8(id).ok()?;
    Some((
        id,
        RatingRecord {
            rating: parse_rating(rating)?,
            votes: parse_votes(votes)?,
        },
    ))
}

fn parse_rating(field: &[u8]) -> Option<f32> {
    std::str::from_utf8(field)
        .ok()?
        .parse::<f32>()
        .ok()
        .filter(|r| r.is_finite())
}

fn parse_votes(field: &[u8]) -> Option<u32> {
    if field.is_empty() {
        return None;
    }
    match u32::from_radix_10_checked(field) {
        (Some(n), used) if used == field.len() => Some(n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn lenient() -> ParseLimits {
        ParseLimits {
            min_rows: 1,
            max_error_ratio: 0.01,
        }
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = &mut *self;
            let remaining = &this.data[this.pos..];
            let n = remaining.len().min(this.step).min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    async fn parse_bytes(
        parser: &RatingsParser<'_>,
        data: &[u8],
    ) -> Result<ParsedRatings, SyncError> {
        parser.parse_reader(data, &CancellationToken::new()).await
    }

    fn body(rows: &[&str], terminator: &str, trailing: bool) -> Vec<u8> {
        let mut out = String::from(EXPECTED_HEADER);
        for row in rows {
            out.push_str(terminator);
            out.push_str(row);
        }
        if trailing {
            out.push_str(terminator);
        }
        out.into_bytes()
    }

    fn assert_header_error(result: Result<ParsedRatings, SyncError>) {
        match result {
            Err(SyncError::DataValidation(ValidationError::InvalidHeader { .. })) => {}
            other => panic!("expected header error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_header() {
        let parser = RatingsParser::new(lenient());
        assert_header_error(parse_bytes(&parser, b"").await);
        assert_header_error(parse_bytes(&parser, b"\n\r\n\n").await);
        assert_header_error(parse_bytes(&parser, b"tconst\taverageRating\n").await);
        assert_header_error(
            parse_bytes(&parser, b"tconst\taverageRating\tnumVotes\textra\ntt1\t5.0\t3\n").await,
        );
        assert_header_error(parse_bytes(&parser, b"tt0000001\t5.7\t2000\n").await);
        assert_header_error(
            parse_bytes(&parser, b"TCONST\taverageRating\tnumVotes\ntt1\t5.0\t3\n").await,
        );
    }

    #[tokio::test]
    async fn skips_blank_lines_before_header() {
        let parser = RatingsParser::new(lenient());
        let mut data = b"\n\r\n".to_vec();
        data.extend(body(&["tt0000001\t5.7\t2000"], "\n", true));
        let parsed = parse_bytes(&parser, &data).await.unwrap();
        assert_eq!(parsed.table.len(), 1);
    }

    #[tokio::test]
    async fn unfiltered_table_holds_every_valid_row() {
        let parser = RatingsParser::new(ParseLimits {
            min_rows: 1,
            max_error_ratio: 0.5,
        });
        let data = body(
            &[
                "tt0000001\t5.7\t2000",
                "tt0000002\t6.1\t271",
                "tt0000003\tbad\t10",
                "tt0000004\t5.4\t180",
            ],
            "\n",
            true,
        );
        let parsed = parse_bytes(&parser, &data).await.unwrap();
        assert_eq!(parsed.stats.total_rows, 4);
        assert_eq!(parsed.stats.parse_errors, 1);
        assert_eq!(parsed.stats.valid_rows, 3);
        assert_eq!(parsed.table.len() as u64, parsed.stats.valid_rows);
        assert_eq!(
            parsed.table["tt0000002"],
            RatingRecord {
                rating: 6.1,
                votes: 271
            }
        );
    }

    #[test]
    fn rows_must_be_consumed_entirely() {
        assert!(parse_row(b"tt1\t7.5\t10").is_some());
        assert!(parse_row(b"tt1\t7.5x\t10").is_none());
        assert!(parse_row(b"tt1\t7.5\t10x").is_none());
        assert!(parse_row(b"tt1\t7.5\t-10").is_none());
        assert!(parse_row(b"tt1\t7.5\t").is_none());
        assert!(parse_row(b"tt1\t\t10").is_none());
        assert!(parse_row(b"\t7.5\t10").is_none());
        assert!(parse_row(b"tt1\t7.5").is_none());
        assert!(parse_row(b"tt1\t7.5\t10\t4").is_none());
        assert!(parse_row(b"tt1\tNaN\t10").is_none());
        assert!(parse_row(b"tt1\tinf\t10").is_none());
        assert!(parse_row(b"tt1\t7.5\t99999999999").is_none());
        assert!(parse_row(b"tt1\t 7.5\t10").is_none());
    }

    #[tokio::test]
    async fn framing_is_insensitive_to_terminators_and_chunking() {
        let rows = [
            "tt0000001\t5.7\t2000",
            "tt0000002\t6.1\t271",
            "tt0000003\t6.5\t1950",
            "tt1234567\t8.25\t42",
        ];
        let reference = parse_bytes(&RatingsParser::new(lenient()), &body(&rows, "\n", true))
            .await
            .unwrap();

        for terminator in ["\n", "\r\n"] {
            for trailing in [true, false] {
                let data = body(&rows, terminator, trailing);
                for step in [1usize, 2, 3, 7, 64] {
                    for capacity in [4usize, 16, 4096] {
                        let parser = RatingsParser::new(lenient()).buffer_capacity(capacity);
                        let reader = Trickle {
                            data: data.clone(),
                            pos: 0,
                            step,
                        };
                        let parsed = parser
                            .parse_reader(reader, &CancellationToken::new())
                            .await
                            .unwrap();
                        assert_eq!(
                            parsed.table, reference.table,
                            "terminator={terminator:?} trailing={trailing} step={step} capacity={capacity}"
                        );
                        assert_eq!(parsed.stats, reference.stats);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn filtered_parse_keeps_only_the_intersection() {
        let data = body(
            &[
                "tt0000001\t5.7\t2000",
                "tt0000002\t6.1\t271",
                "tt0000003\t6.5\t1950",
                "tt0000004\tx\t1",
            ],
            "\n",
            true,
        );
        let filter = IdFilter::numeric(["tt0000002", "tt0000004", "tt9999999", "junk"]);
        let parser = RatingsParser::new(ParseLimits {
            min_rows: 1,
            max_error_ratio: 0.5,
        })
        .with_filter(&filter);
        let parsed = parse_bytes(&parser, &data).await.unwrap();

        assert_eq!(parsed.table.len(), 1);
        assert!(parsed.table.contains_key("tt0000002"));
        assert_eq!(parsed.stats.total_rows, 4);
        assert_eq!(parsed.stats.parse_errors, 1);
        assert_eq!(parsed.stats.matched, 1);
    }

    #[tokio::test]
    async fn colliding_numeric_spellings_are_both_retained() {
        let data = body(
            &["tt0111161\t9.3\t2900000", "tt111161\t1.0\t5", "tt0000007\t5.0\t10"],
            "\n",
            true,
        );
        let filter = IdFilter::numeric(["tt111161", "tt0111161"]);
        let parser = RatingsParser::new(lenient()).with_filter(&filter);
        let parsed = parse_bytes(&parser, &data).await.unwrap();

        assert_eq!(parsed.table.len(), 2);
        assert_eq!(
            parsed.table["tt0111161"],
            RatingRecord {
                rating: 9.3,
                votes: 2_900_000
            }
        );
        assert_eq!(parsed.table["tt111161"].votes, 5);
        assert_eq!(parsed.stats.matched, 2);
    }

    #[tokio::test]
    async fn small_file_is_truncated_even_when_requested_ids_are_present() {
        let data = body(&["tt0000001\t5.7\t2000", "tt0000002\t6.1\t271"], "\n", true);
        let filter = IdFilter::literal(["tt0000001", "tt0000002"]);
        let parser = RatingsParser::new(ParseLimits::default()).with_filter(&filter);
        match parse_bytes(&parser, &data).await {
            Err(SyncError::DataValidation(ValidationError::Truncated {
                valid_rows,
                min_rows,
            })) => {
                assert_eq!(valid_rows, 2);
                assert_eq!(min_rows, 500_000);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_only_or_all_garbage_has_no_valid_rows() {
        let parser = RatingsParser::new(lenient());
        for data in [
            body(&[], "\n", true),
            body(&["nonsense", "tt1\tbad\tbad"], "\n", false),
        ] {
            match parse_bytes(&parser, &data).await {
                Err(SyncError::DataValidation(ValidationError::NoValidRows { .. })) => {}
                other => panic!("expected no valid rows, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn error_ratio_above_one_percent_is_corrupt() {
        let mut rows: Vec<String> = (0..98).map(|i| format!("tt{i:07}\t7.0\t10")).collect();
        rows.push("tt0000098\toops\t10".into());
        rows.push("tt0000099\t7.0\toops".into());
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let parser = RatingsParser::new(lenient());

        match parse_bytes(&parser, &body(&refs, "\n", true)).await {
            Err(SyncError::DataValidation(ValidationError::Corrupt {
                parse_errors,
                total_rows,
                ..
            })) => {
                assert_eq!(parse_errors, 2);
                assert_eq!(total_rows, 100);
            }
            other => panic!("expected corruption, got {other:?}"),
        }

        // Exactly one percent is tolerated.
        let refs: Vec<&str> = refs[..98]
            .iter()
            .copied()
            .chain(["tt0000098\toops\t10", "tt0000100\t7.0\t10"])
            .collect();
        let parsed = parse_bytes(&parser, &body(&refs, "\n", true)).await.unwrap();
        assert_eq!(parsed.stats.parse_errors, 1);
        assert_eq!(parsed.stats.total_rows, 100);
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_parse() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let parser = RatingsParser::new(lenient());
        let data = body(&["tt0000001\t5.7\t2000"], "\n", true);
        let result = parser.parse_reader(data.as_slice(), &cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error_naming_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.tsv");
        let result = RatingsParser::new(lenient())
            .parse_path(&path, &CancellationToken::new())
            .await;
        match result {
            Err(SyncError::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_size_file_filtered_to_four_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("title.ratings.tsv");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut w = std::io::BufWriter::new(file);
            writeln!(w, "{EXPECTED_HEADER}").unwrap();
            for i in 0..500_010u32 {
                match i {
                    1 => writeln!(w, "tt0000001\t5.7\t2136").unwrap(),
                    250_000 => writeln!(w, "tt0250000\t8.3\t1024").unwrap(),
                    500_009 => write!(w, "tt0500009\t9.1\t7").unwrap(),
                    _ => writeln!(w, "tt{:07}\t{}.{}\t{}", i, i % 10, i % 7, i % 5000 + 5).unwrap(),
                }
            }
            w.flush().unwrap();
        }

        let filter = IdFilter::numeric(["tt0000001", "tt0250000", "tt0500009", "tt9999999"]);
        let parsed = RatingsParser::new(ParseLimits::default())
            .with_filter(&filter)
            .parse_path(&path, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(parsed.stats.total_rows, 500_010);
        assert_eq!(parsed.stats.parse_errors, 0);
        assert_eq!(parsed.table.len(), 3);
        assert_eq!(
            parsed.table["tt0000001"],
            RatingRecord {
                rating: 5.7,
                votes: 2136
            }
        );
        assert_eq!(
            parsed.table["tt0250000"],
            RatingRecord {
                rating: 8.3,
                votes: 1024
            }
        );
        assert_eq!(
            parsed.table["tt0500009"],
            RatingRecord {
                rating: 9.1,
                votes: 7
            }
        );
        assert!(!parsed.table.contains_key("tt9999999"));
    }
}
