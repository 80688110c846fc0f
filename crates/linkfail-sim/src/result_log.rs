//! Append-only text result log.
//!
//! One record per line, `time_ms;node;message`, where `node` is a replica
//! id or `-1` for records about the run as a whole. Each completed request
//! gets a line, and the run ends with a summary line.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use linkfail_types::ReplicaId;

use crate::clock::ns_to_ms_f64;
use crate::driver::CompletedRequest;
use crate::metrics::RunReport;

/// File name for a run: `result_{n}_{requests}_{p*100}_s{seed}.log`,
/// prefixed with the UTC time when `timestamp` is given.
pub fn result_file_name(
    nodes: usize,
    requests: u64,
    probability: f64,
    seed: u64,
    timestamp: Option<DateTime<Utc>>,
) -> String {
    let percent = (probability * 100.0).round() as u64;
    let base = format!("result_{nodes:03}_{requests:03}_{percent:03}_s{seed}.log");
    match timestamp {
        Some(at) => format!("{}_{base}", at.format("%Y%m%d_%H%M%S")),
        None => base,
    }
}

pub struct ResultLog {
    writer: Box<dyn Write>,
    path: Option<PathBuf>,
    lines: u64,
}

impl std::fmt::Debug for ResultLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultLog")
            .field("path", &self.path)
            .field("lines", &self.lines)
            .finish_non_exhaustive()
    }
}

impl ResultLog {
    pub fn new(writer: Box<dyn Write>) -> Self {
        Self {
            writer,
            path: None,
            lines: 0,
        }
    }

    /// Creates `dir/file_name`, creating `dir` if needed.
    pub fn create(dir: &Path, file_name: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name);
        let file = File::create(&path)?;
        Ok(Self {
            writer: Box::new(BufWriter::new(file)),
            path: Some(path),
            lines: 0,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn record(&mut self, time_ns: u64, node: Option<ReplicaId>, message: &str) -> io::Result<()> {
        let node = node.map_or(-1, |r| i32::from(r.as_u8()));
        writeln!(self.writer, "{:.3};{node};{message}", ns_to_ms_f64(time_ns))?;
        self.lines += 1;
        Ok(())
    }

    pub fn request_completed(&mut self, done: &CompletedRequest) -> io::Result<()> {
        self.record(
            done.completed_at_ns,
            None,
            &format!(
                "request={} seq={} view={} latency_ms={:.3}",
                done.request_id,
                done.seq,
                done.view,
                ns_to_ms_f64(done.latency_ns)
            ),
        )
    }

    pub fn summary(&mut self, report: &RunReport) -> io::Result<()> {
        self.record(
            report.final_time_ns,
            None,
            &format!(
                "summary completed={} issued={} view_changes={} dropped={} attempted={} outcome={}",
                report.requests_completed,
                report.requests_issued,
                report.view_changes,
                report.links.dropped,
                report.links.attempted,
                report.outcome.label()
            ),
        )?;
        self.flush()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use linkfail_types::{Digest, RequestId, SeqNumber, ViewNumber};
    use tempfile::tempdir;
    use test_case::test_case;

    #[test_case(4, 100, 0.1, 42 => "result_004_100_010_s42.log"; "default experiment")]
    #[test_case(10, 5, 0.0, 7 => "result_010_005_000_s7.log"; "no loss")]
    #[test_case(7, 1000, 1.0, 0 => "result_007_1000_100_s0.log"; "total loss")]
    fn file_names(nodes: usize, requests: u64, p: f64, seed: u64) -> String {
        result_file_name(nodes, requests, p, seed, None)
    }

    #[test]
    fn timestamp_prefix() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).single().expect("valid time");
        assert_eq!(
            result_file_name(4, 100, 0.1, 42, Some(at)),
            "20240309_140500_result_004_100_010_s42.log"
        );
    }

    #[test]
    fn writes_request_lines() {
        let dir = tempdir().expect("temp dir");
        let mut log = ResultLog::create(&dir.path().join("out"), "run.log").expect("create");
        log.record(1_500_000, Some(ReplicaId::new(2)), "view change").expect("write");
        log.request_completed(&CompletedRequest {
            request_id: RequestId::new(3),
            seq: SeqNumber::new(3),
            view: ViewNumber::new(1),
            result: Digest::ZERO,
            issued_at_ns: 10_000_000,
            completed_at_ns: 22_250_000,
            latency_ns: 12_250_000,
            retries: 0,
        })
        .expect("write");
        log.flush().expect("flush");
        assert_eq!(log.lines(), 2);

        let path = log.path().expect("file backed").to_path_buf();
        let text = fs::read_to_string(path).expect("read");
        assert_eq!(
            text,
            "1.500;2;view change\n22.250;-1;request=3 seq=3 view=1 latency_ms=12.250\n"
        );
    }
}
