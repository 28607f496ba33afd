//! Greedy LPT scheduling of jobs onto workers × threads.
//!
//! Purpose
//! - Estimate how long a batch of requests takes when spread over
//!   `num_workers` replicas, each serving `threads_per_worker` requests at once.
//!   Used to size data-parallel deployments and rollout concurrency.
//!
//! Model
//! - Jobs are sorted by duration, longest first; ties keep input order.
//! - Each job goes to the worker whose earliest-free thread frees up first
//!   (lowest worker index on ties), and runs back to back on that thread.
//! - The makespan is the latest thread end time, 0.0 for an empty batch.

use serde::Serialize;
use std::fmt::{self, Write as _};

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleError {
    InvalidParams { reason: String },
}

impl ScheduleError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParams { reason } => write!(f, "invalid schedule params: {reason}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Input job: index in the submitted list plus expected duration (seconds).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Job {
    pub id: usize,
    pub duration: f64,
}

/// A job placed on a thread.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Placement {
    pub job_id: usize,
    pub duration: f64,
    pub start_time: f64,
    pub end_time: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThreadSlot {
    pub id: usize,
    pub jobs: Vec<Placement>,
}

impl ThreadSlot {
    fn new(id: usize) -> Self {
        Self {
            id,
            jobs: Vec::new(),
        }
    }

    /// End of the last placed job; jobs only ever append.
    pub fn available_at(&self) -> f64 {
        self.jobs.last().map_or(0.0, |p| p.end_time)
    }

    fn push(&mut self, job: Job) {
        let start_time = self.available_at();
        self.jobs.push(Placement {
            job_id: job.id,
            duration: job.duration,
            start_time,
            end_time: start_time + job.duration,
        });
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Worker {
    pub id: usize,
    pub threads: Vec<ThreadSlot>,
}

impl Worker {
    fn new(id: usize, num_threads: usize) -> Self {
        Self {
            id,
            threads: (0..num_threads).map(ThreadSlot::new).collect(),
        }
    }

    /// Index of the thread that frees up first (lowest index on ties).
    fn earliest_thread(&self) -> usize {
        let mut best = 0;
        for (i, t) in self.threads.iter().enumerate().skip(1) {
            if t.available_at() < self.threads[best].available_at() {
                best = i;
            }
        }
        best
    }

    pub fn earliest_available(&self) -> f64 {
        self.threads[self.earliest_thread()].available_at()
    }

    pub fn completion_time(&self) -> f64 {
        self.threads
            .iter()
            .map(ThreadSlot::available_at)
            .fold(0.0, f64::max)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Schedule {
    pub makespan: f64,
    pub workers: Vec<Worker>,
}

impl Schedule {
    /// Per-thread timeline with `[J<id>:<dur>s]` and `[Idle:<gap>s]` segments,
    /// idle-padded to the makespan.
    pub fn timeline(&self) -> String {
        let mut out = String::new();
        for worker in &self.workers {
            let _ = writeln!(out, "worker_{}:", worker.id);
            for thread in &worker.threads {
                let mut line = String::new();
                let mut current = 0.0;
                for p in &thread.jobs {
                    if p.start_time > current {
                        let _ = write!(line, "[Idle:{:.1}s]", p.start_time - current);
                    }
                    let _ = write!(line, "[J{}:{:.1}s]", p.job_id, p.duration);
                    current = p.end_time;
                }
                if current < self.makespan {
                    let _ = write!(line, "[Idle:{:.1}s]", self.makespan - current);
                }
                let _ = writeln!(out, "  thread_{}: {}", thread.id, line);
            }
        }
        out
    }
}

/// Aggregate statistics for a computed schedule.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub workers: usize,
    pub threads_per_worker: usize,
    pub jobs: usize,
    pub total_job_time: f64,
    pub makespan: f64,
    /// Perfect split of the total work over every thread.
    pub theoretical_min: f64,
    pub avg_worker_time: f64,
    pub max_worker_time: f64,
    pub min_worker_time: f64,
    /// `max / avg` worker completion time; 0.0 when nothing ran.
    pub load_balance: f64,
    /// Busy share of thread time up to each worker's completion, in percent.
    pub utilization_pct: f64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Problem size:")?;
        writeln!(f, "  Workers: {}", self.workers)?;
        writeln!(f, "  Threads per worker: {}", self.threads_per_worker)?;
        writeln!(f, "  Jobs: {}", self.jobs)?;
        writeln!(f, "  Total job time: {:.2}s", self.total_job_time)?;
        writeln!(f, "Schedule result:")?;
        writeln!(f, "  Total time: {:.2}s", self.makespan)?;
        writeln!(f, "  Theoretical minimum: {:.2}s", self.theoretical_min)?;
        writeln!(f, "  Average worker completion time: {:.2}s", self.avg_worker_time)?;
        writeln!(f, "  Max worker completion time: {:.2}s", self.max_worker_time)?;
        writeln!(f, "  Min worker completion time: {:.2}s", self.min_worker_time)?;
        writeln!(f, "  Load balance index: {:.2}x", self.load_balance)?;
        writeln!(f, "  Thread pool utilization: {:.1}%", self.utilization_pct)
    }
}

/// Validated problem instance.
#[derive(Clone, Debug)]
pub struct LptScheduler {
    num_workers: usize,
    threads_per_worker: usize,
    jobs: Vec<Job>,
}

impl LptScheduler {
    pub fn new(
        num_workers: usize,
        threads_per_worker: usize,
        durations: &[f64],
    ) -> Result<Self, ScheduleError> {
        if num_workers == 0 {
            return Err(ScheduleError::invalid("need at least one worker"));
        }
        if threads_per_worker == 0 {
            return Err(ScheduleError::invalid("need at least one thread per worker"));
        }
        if let Some((i, d)) = durations
            .iter()
            .enumerate()
            .find(|(_, d)| !(d.is_finite() && **d >= 0.0))
        {
            return Err(ScheduleError::invalid(format!(
                "job {i} has duration {d}; expected a finite value >= 0"
            )));
        }
        let jobs = durations
            .iter()
            .enumerate()
            .map(|(id, &duration)| Job { id, duration })
            .collect();
        Ok(Self {
            num_workers,
            threads_per_worker,
            jobs,
        })
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn total_job_time(&self) -> f64 {
        self.jobs.iter().map(|j| j.duration).sum()
    }

    pub fn greedy_lpt(&self) -> Schedule {
        let mut sorted = self.jobs.clone();
        // `sort_by` is stable, so equal durations keep submission order.
        sorted.sort_by(|a, b| b.duration.total_cmp(&a.duration));

        let mut workers: Vec<Worker> = (0..self.num_workers)
            .map(|id| Worker::new(id, self.threads_per_worker))
            .collect();
        for job in sorted {
            let mut best = 0;
            for (i, w) in workers.iter().enumerate().skip(1) {
                if w.earliest_available() < workers[best].earliest_available() {
                    best = i;
                }
            }
            let worker = &mut workers[best];
            let t = worker.earliest_thread();
            worker.threads[t].push(job);
        }

        let makespan = workers
            .iter()
            .map(Worker::completion_time)
            .fold(0.0, f64::max);
        tracing::debug!(
            workers = self.num_workers,
            threads = self.threads_per_worker,
            jobs = self.jobs.len(),
            makespan,
            "greedy_lpt"
        );
        Schedule { makespan, workers }
    }

    pub fn summary(&self, schedule: &Schedule) -> Summary {
        let total_job_time = self.total_job_time();
        let worker_times: Vec<f64> = schedule
            .workers
            .iter()
            .map(Worker::completion_time)
            .collect();
        let n = worker_times.len() as f64;
        let sum_worker: f64 = worker_times.iter().sum();
        let avg = sum_worker / n;
        let max = worker_times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = worker_times.iter().copied().fold(f64::INFINITY, f64::min);
        let thread_time = sum_worker * self.threads_per_worker as f64;
        Summary {
            workers: self.num_workers,
            threads_per_worker: self.threads_per_worker,
            jobs: self.jobs.len(),
            total_job_time,
            makespan: schedule.makespan,
            theoretical_min: total_job_time / (self.num_workers * self.threads_per_worker) as f64,
            avg_worker_time: avg,
            max_worker_time: max,
            min_worker_time: min,
            load_balance: if avg > 0.0 { max / avg } else { 0.0 },
            utilization_pct: if thread_time > 0.0 {
                total_job_time / thread_time * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn placements(s: &Schedule) -> Vec<(usize, usize, Placement)> {
        let mut out = Vec::new();
        for w in &s.workers {
            for t in &w.threads {
                for p in &t.jobs {
                    out.push((w.id, t.id, *p));
                }
            }
        }
        out
    }

    #[test]
    fn two_by_two_fixture() {
        let sched = LptScheduler::new(2, 2, &[5.0, 3.0, 8.0, 6.0, 2.0]).unwrap();
        let s = sched.greedy_lpt();
        assert_eq!(s.makespan, 8.0);
        let by_job = |id: usize| {
            placements(&s)
                .into_iter()
                .find(|(_, _, p)| p.job_id == id)
                .unwrap()
        };
        // 8 -> w0/t0, 6 -> w0/t1, 5 -> w1/t0, 3 -> w1/t1, 2 -> w1/t1 after 3.
        assert_eq!((by_job(2).0, by_job(2).1), (0, 0));
        assert_eq!((by_job(3).0, by_job(3).1), (0, 1));
        assert_eq!((by_job(0).0, by_job(0).1), (1, 0));
        assert_eq!((by_job(1).0, by_job(1).1), (1, 1));
        let j4 = by_job(4);
        assert_eq!((j4.0, j4.1), (1, 1));
        assert_eq!((j4.2.start_time, j4.2.end_time), (3.0, 5.0));

        let timeline = s.timeline();
        let expected = "\
worker_0:
  thread_0: [J2:8.0s]
  thread_1: [J3:6.0s][Idle:2.0s]
worker_1:
  thread_0: [J0:5.0s][Idle:3.0s]
  thread_1: [J1:3.0s][J4:2.0s][Idle:3.0s]
";
        assert_eq!(timeline, expected);
    }

    #[test]
    fn summary_matches_hand_computation() {
        let sched = LptScheduler::new(2, 2, &[5.0, 3.0, 8.0, 6.0, 2.0]).unwrap();
        let s = sched.greedy_lpt();
        let sum = sched.summary(&s);
        assert_eq!(sum.total_job_time, 24.0);
        assert_eq!(sum.theoretical_min, 6.0);
        assert_eq!(sum.max_worker_time, 8.0);
        assert_eq!(sum.min_worker_time, 5.0);
        assert!((sum.avg_worker_time - 6.5).abs() < 1e-12);
        assert!((sum.load_balance - 8.0 / 6.5).abs() < 1e-12);
        // 24 / ((8 + 5) * 2)
        assert!((sum.utilization_pct - 24.0 / 26.0 * 100.0).abs() < 1e-9);
        assert!(sum.to_string().contains("Total time: 8.00s"));
    }

    #[test]
    fn empty_batch_has_zero_makespan() {
        let sched = LptScheduler::new(3, 3, &[]).unwrap();
        let s = sched.greedy_lpt();
        assert_eq!(s.makespan, 0.0);
        let sum = sched.summary(&s);
        assert_eq!(sum.load_balance, 0.0);
        assert_eq!(sum.utilization_pct, 0.0);
    }

    #[test]
    fn rejects_bad_params() {
        assert!(LptScheduler::new(0, 1, &[1.0]).is_err());
        assert!(LptScheduler::new(1, 0, &[1.0]).is_err());
        assert!(LptScheduler::new(1, 1, &[1.0, -2.0]).is_err());
        assert!(LptScheduler::new(1, 1, &[f64::NAN]).is_err());
    }

    proptest! {
        #[test]
        fn every_job_placed_once_and_bounds_hold(
            workers in 1usize..5,
            threads in 1usize..5,
            durations in prop::collection::vec(0.0f64..100.0, 0..40),
        ) {
            let sched = LptScheduler::new(workers, threads, &durations).unwrap();
            let s = sched.greedy_lpt();
            let mut ids: Vec<usize> = placements(&s).iter().map(|(_, _, p)| p.job_id).collect();
            ids.sort_unstable();
            prop_assert_eq!(ids, (0..durations.len()).collect::<Vec<_>>());

            let sum = sched.summary(&s);
            prop_assert!(s.makespan + 1e-9 >= sum.theoretical_min);
            let longest = durations.iter().copied().fold(0.0, f64::max);
            prop_assert!(s.makespan + 1e-9 >= longest);
            for w in &s.workers {
                for t in &w.threads {
                    for pair in t.jobs.windows(2) {
                        prop_assert_eq!(pair[0].end_time, pair[1].start_time);
                    }
                }
            }
        }
    }
}
