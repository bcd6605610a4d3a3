//! Execution Timeline
//!
//! Records when each job attempt starts and ends, for the run report's
//! Gantt chart and per-job durations.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
    /// Killed or abandoned because the run was aborted
    Cancelled,
}

impl EventType {
    fn ends_attempt(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Job label, e.g. `align[sample=a]`
    pub job: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// One start/end pair, in milliseconds since the timeline began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u128,
    end: Option<u128>,
    outcome: Option<EventType>,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a job.
    pub fn add_event(&mut self, job: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            job: job.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Every attempt of every job, in order of first start.
    fn spans(&self) -> Vec<(String, Vec<Span>)> {
        let mut order: Vec<String> = Vec::new();
        let mut spans: BTreeMap<String, Vec<Span>> = BTreeMap::new();

        for event in &self.events {
            let at = event.timestamp.duration_since(self.start_time).as_millis();
            let job_spans = spans.entry(event.job.clone()).or_insert_with(|| {
                order.push(event.job.clone());
                Vec::new()
            });

            if event.event_type.ends_attempt() {
                if let Some(open) = job_spans.iter_mut().rev().find(|s| s.end.is_none()) {
                    open.end = Some(at);
                    open.outcome = Some(event.event_type);
                }
            } else {
                job_spans.push(Span {
                    start: at,
                    end: None,
                    outcome: None,
                });
            }
        }

        order
            .into_iter()
            .filter_map(|job| spans.remove(&job).map(|s| (job, s)))
            .collect()
    }

    /// ASCII Gantt chart, one row per job. Retried jobs show every attempt;
    /// failed attempts are drawn with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (job, spans) in self.spans() {
            let mut bar = String::new();
            let mut busy = 0;
            for span in &spans {
                let Some(end) = span.end else { continue };
                let start_pos = (span.start as f64 * scale) as usize;
                let width = ((end - span.start) as f64 * scale).max(1.0) as usize;
                if bar.len() < start_pos {
                    bar.push_str(&" ".repeat(start_pos - bar.len()));
                }
                let mark = if span.outcome == Some(EventType::Completed) { "#" } else { "x" };
                bar.push_str(&mark.repeat(width));
                busy += end - span.start;
            }
            if bar.is_empty() {
                continue;
            }
            output.push_str(&format!("{:24} |{:50}| ({} ms)\n", truncate(&job, 24), bar, busy));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Duration of the last finished attempt of each job, in milliseconds.
    pub fn get_durations(&self) -> BTreeMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(job, spans)| {
                spans
                    .iter()
                    .rev()
                    .find_map(|s| s.end.map(|end| end - s.start))
                    .map(|d| (job, d))
            })
            .collect()
    }

    /// Number of started attempts per job.
    pub fn attempts(&self) -> BTreeMap<String, usize> {
        let mut attempts = BTreeMap::new();
        for event in self.events.iter().filter(|e| e.event_type == EventType::Started) {
            *attempts.entry(event.job.clone()).or_insert(0) += 1;
        }
        attempts
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or cuts a label to `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
