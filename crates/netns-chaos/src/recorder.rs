//! Run-artifact recording.
//!
//! Every scenario invocation gets a uniquely named run directory holding a
//! schedule log (chronological fault/lifecycle events with relative
//! offsets), a combined execution log (orchestrator narration plus all role
//! output, interleaved), a `meta.json` identity record, per-role working
//! storage, readiness-address files, and an optional `metrics.csv` sampled
//! by a background task. The recorder is append-only and shared by clone;
//! writes are short and serialized behind a mutex.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Serialize)]
struct RunMeta<'a> {
    topology: &'a str,
    transport: &'a str,
    seed: u64,
    started_unix_ms: u128,
}

struct TrackedProcess {
    member: String,
    pid: u32,
}

struct Sampler {
    stop: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

struct Inner {
    run_dir: PathBuf,
    start: Instant,
    run_log: Mutex<File>,
    schedule_log: Mutex<File>,
    processes: Mutex<Vec<TrackedProcess>>,
    sampler: Mutex<Option<Sampler>>,
}

/// Handle to one run's artifact directory. Cheap to clone; all clones
/// append to the same files.
#[derive(Clone)]
pub struct RunRecorder {
    inner: Arc<Inner>,
}

impl RunRecorder {
    /// Allocate a unique run directory and its log files.
    ///
    /// The name encodes topology, transport, seed, and a millisecond
    /// timestamp; a numeric suffix disambiguates the (unlikely) same-ms
    /// collision so concurrent runs with different seeds never share a
    /// directory.
    pub fn begin(
        out_dir: &Path,
        topology: &str,
        transport: &str,
        seed: u64,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(out_dir)?;
        let started_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();

        let base = format!("run-{topology}-{transport}-s{seed}-{started_unix_ms}");
        let mut run_dir = out_dir.join(&base);
        let mut suffix = 1u32;
        while run_dir.exists() {
            run_dir = out_dir.join(format!("{base}-{suffix}"));
            suffix += 1;
        }
        std::fs::create_dir(&run_dir)?;

        let meta = RunMeta {
            topology,
            transport,
            seed,
            started_unix_ms,
        };
        std::fs::write(
            run_dir.join("meta.json"),
            serde_json::to_vec_pretty(&meta).map_err(std::io::Error::other)?,
        )?;

        let run_log = append_file(&run_dir.join("run.log"))?;
        let schedule_log = append_file(&run_dir.join("schedule.log"))?;

        debug!("recording run into {}", run_dir.display());
        Ok(Self {
            inner: Arc::new(Inner {
                run_dir,
                start: Instant::now(),
                run_log: Mutex::new(run_log),
                schedule_log: Mutex::new(schedule_log),
                processes: Mutex::new(Vec::new()),
                sampler: Mutex::new(None),
            }),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.inner.run_dir
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.start.elapsed()
    }

    /// Working-storage directory for one role, created on demand.
    pub fn store_dir(&self, member: &str) -> std::io::Result<PathBuf> {
        let dir = self.inner.run_dir.join(member).join("store");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Readiness-address file path for one role.
    pub fn ready_file(&self, member: &str) -> PathBuf {
        self.inner.run_dir.join(format!("{member}.addr"))
    }

    /// Record a scheduled event (fault application or lifecycle action).
    /// The line lands in the schedule artifact and is mirrored into the
    /// combined log so both views stay chronological.
    pub fn log_schedule(&self, action: &str, target: &str) {
        let line = format!("+{}ms {} {}", self.elapsed().as_millis(), action, target);
        append_line(&self.inner.schedule_log, &line);
        append_line(&self.inner.run_log, &format!("schedule: {line}"));
    }

    /// Append one line to the combined execution log.
    pub fn log_output(&self, text: &str) {
        let line = format!("[+{}ms] {}", self.elapsed().as_millis(), text);
        append_line(&self.inner.run_log, &line);
    }

    /// Make a process visible to the metrics sampler.
    pub fn track_process(&self, member: &str, pid: u32) {
        if let Ok(mut processes) = self.inner.processes.lock() {
            processes.push(TrackedProcess {
                member: member.to_string(),
                pid,
            });
        }
    }

    /// Drop a terminated process from the sampler's view.
    pub fn untrack_process(&self, pid: u32) {
        if let Ok(mut processes) = self.inner.processes.lock() {
            processes.retain(|p| p.pid != pid);
        }
    }

    /// Start the background resource sampler. Appends
    /// `t_ms,role,pid,rss_kb` rows for every tracked process at a fixed
    /// interval. Sampler failures are logged, never fatal to the run.
    pub fn start_metrics_sampler(&self, interval: Duration) {
        let mut slot = match self.inner.sampler.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.is_some() {
            return;
        }

        let stop = Arc::new(Mutex::new(false));
        let inner = self.inner.clone();
        let stop_flag = stop.clone();

        let task = tokio::spawn(async move {
            let path = inner.run_dir.join("metrics.csv");
            let mut file = match append_file(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("metrics sampler disabled: {}", e);
                    return;
                }
            };
            if let Err(e) = writeln!(file, "t_ms,role,pid,rss_kb") {
                warn!("metrics header write failed: {}", e);
                return;
            }

            loop {
                if stop_flag.lock().map(|s| *s).unwrap_or(true) {
                    break;
                }
                let t_ms = inner.start.elapsed().as_millis();
                let snapshot: Vec<(String, u32)> = match inner.processes.lock() {
                    Ok(processes) => processes
                        .iter()
                        .map(|p| (p.member.clone(), p.pid))
                        .collect(),
                    Err(_) => break,
                };
                for (member, pid) in snapshot {
                    match rss_kb(pid) {
                        Some(rss) => {
                            if let Err(e) = writeln!(file, "{t_ms},{member},{pid},{rss}") {
                                warn!("metrics row write failed: {}", e);
                            }
                        }
                        // Process may have exited between snapshot and read.
                        None => debug!("no RSS for pid {} ({})", pid, member),
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        *slot = Some(Sampler { stop, task });
    }

    /// Stop the sampler and wait for its final flush. Idempotent.
    pub async fn stop_metrics_sampler(&self) {
        let sampler = match self.inner.sampler.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(sampler) = sampler {
            if let Ok(mut stop) = sampler.stop.lock() {
                *stop = true;
            }
            if let Err(e) = sampler.task.await {
                warn!("metrics sampler task failed: {}", e);
            }
        }
    }

    /// Write the run's final result line. The recorder is not written to
    /// after this.
    pub fn finish(&self, pass: bool, topology: &str, transport: &str, seed: u64) {
        let verdict = if pass { "pass" } else { "fail" };
        self.log_output(&format!("RESULT {verdict} {topology} {transport} seed={seed}"));
    }
}

fn append_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn append_line(file: &Mutex<File>, line: &str) {
    if let Ok(mut file) = file.lock() {
        if let Err(e) = writeln!(file, "{line}") {
            warn!("log write failed: {}", e);
        }
    }
}

/// Resident set size in kB from `/proc/<pid>/status`, or `None` if the
/// process is gone or unreadable.
fn rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn run_dirs_are_unique_per_invocation() {
        let out = TempDir::new().unwrap();
        let a = RunRecorder::begin(out.path(), "pair", "tcp", 1).unwrap();
        let b = RunRecorder::begin(out.path(), "pair", "tcp", 1).unwrap();
        assert_ne!(a.run_dir(), b.run_dir());
        assert!(a.run_dir().join("meta.json").exists());
    }

    #[test]
    fn schedule_events_preserve_order_in_both_logs() {
        let out = TempDir::new().unwrap();
        let recorder = RunRecorder::begin(out.path(), "pair", "tcp", 1).unwrap();
        recorder.log_schedule("apply_profile:partition_burst", "pub");
        recorder.log_schedule("apply_profile:recover", "pub");
        recorder.log_schedule("apply_profile:jitter_spike", "pub");

        let schedule = std::fs::read_to_string(recorder.run_dir().join("schedule.log")).unwrap();
        let lines: Vec<&str> = schedule.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("partition_burst"));
        assert!(lines[1].contains("recover"));
        assert!(lines[2].contains("jitter_spike"));

        let run_log = std::fs::read_to_string(recorder.run_dir().join("run.log")).unwrap();
        let partition = run_log.find("partition_burst").unwrap();
        let spike = run_log.find("jitter_spike").unwrap();
        assert!(partition < spike, "mirrored events must stay chronological");
    }

    #[tokio::test]
    async fn sampler_writes_header_and_monotonic_rows() {
        let out = TempDir::new().unwrap();
        let recorder = RunRecorder::begin(out.path(), "pair", "tcp", 7).unwrap();
        // Sample ourselves; the test process certainly has an RSS.
        recorder.track_process("pub", std::process::id());
        recorder.start_metrics_sampler(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        recorder.stop_metrics_sampler().await;
        // Stop is idempotent.
        recorder.stop_metrics_sampler().await;

        let metrics = std::fs::read_to_string(recorder.run_dir().join("metrics.csv")).unwrap();
        let mut lines = metrics.lines();
        assert_eq!(lines.next(), Some("t_ms,role,pid,rss_kb"));

        let mut last_t = 0u128;
        let mut rows = 0;
        for line in lines {
            let mut fields = line.split(',');
            let t: u128 = fields.next().unwrap().parse().unwrap();
            assert!(t >= last_t, "timestamps must be non-decreasing");
            last_t = t;
            assert_eq!(fields.next(), Some("pub"));
            rows += 1;
        }
        assert!(rows >= 3, "expected several samples, got {rows}");
    }

    #[test]
    fn role_paths_live_under_the_run_dir() {
        let out = TempDir::new().unwrap();
        let recorder = RunRecorder::begin(out.path(), "line", "quic", 3).unwrap();
        let store = recorder.store_dir("relay").unwrap();
        assert!(store.starts_with(recorder.run_dir()));
        assert!(store.is_dir());
        assert!(recorder.ready_file("relay").starts_with(recorder.run_dir()));
    }
}
