//! Deterministic replay of request traces.
//!
//! A trace is a stream of JSON lines, one request descriptor per line. Each
//! request is run through the limiter in trace order and one JSON line is
//! written per input line.
//!
//! Idle keys are swept in trace time, never on a wall-clock timer, so the
//! output depends only on the trace.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::ratelimit::{CounterStore, Decision, RateLimiter, RequestDescriptor};

/// Order in which a request is counted and checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RequestOrder {
    /// Count the request, then decide on it (the request sees itself)
    #[default]
    RecordThenCheck,
    /// Decide on the request, then count it
    CheckThenRecord,
}

/// Totals for a replayed trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub total: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub invalid: u64,
    /// Idle records removed by sweeps during the replay
    pub swept: u64,
}

#[derive(Serialize)]
struct DecisionLine<'a> {
    api_key: &'a str,
    route: &'a str,
    epoch_seconds: u64,
    #[serde(flatten)]
    decision: Decision,
}

#[derive(Serialize)]
struct ErrorLine {
    line: u64,
    error: String,
}

/// Replays a trace through a limiter.
pub struct Replayer<'a, S: CounterStore> {
    limiter: &'a RateLimiter<S>,
    ordering: RequestOrder,
    sweep_interval_secs: Option<u64>,
    stop: Option<&'a AtomicBool>,
}

impl<'a, S: CounterStore> Replayer<'a, S> {
    pub fn new(limiter: &'a RateLimiter<S>, ordering: RequestOrder) -> Self {
        Self {
            limiter,
            ordering,
            sweep_interval_secs: None,
            stop: None,
        }
    }

    /// Sweep the store each time the newest trace second has moved
    /// `interval_secs` past the previous sweep.
    pub fn with_sweep_interval(mut self, interval_secs: u64) -> Self {
        self.sweep_interval_secs = Some(interval_secs.max(1));
        self
    }

    /// Stop before the next line once `stop` is set.
    pub fn with_stop(mut self, stop: &'a AtomicBool) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Replay every line of `input`, writing one result line per input line.
    ///
    /// Blank lines are skipped. Lines that fail to parse or validate produce
    /// an error line and do not stop the replay.
    pub fn run<R: BufRead, W: Write>(&self, input: R, mut output: W) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        let mut newest: Option<u64> = None;
        let mut last_sweep: Option<u64> = None;

        for (index, line) in input.lines().enumerate() {
            if self.stop.is_some_and(|stop| stop.load(Ordering::Relaxed)) {
                warn!(line = index as u64 + 1, "Replay stopped before end of trace");
                break;
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let line_number = index as u64 + 1;
            summary.total += 1;

            let req = match parse_request(&line) {
                Ok(req) => req,
                Err(e) => {
                    warn!(line = line_number, error = %e, "Skipping invalid trace line");
                    summary.invalid += 1;
                    serde_json::to_writer(
                        &mut output,
                        &ErrorLine {
                            line: line_number,
                            error: e.to_string(),
                        },
                    )?;
                    writeln!(output)?;
                    continue;
                }
            };

            let now = newest.map_or(req.epoch_seconds, |n| n.max(req.epoch_seconds));
            newest = Some(now);
            if let Some(interval) = self.sweep_interval_secs {
                let due = last_sweep.map_or(true, |last| now >= last.saturating_add(interval));
                if due {
                    if last_sweep.is_some() {
                        summary.swept += self.limiter.store().sweep(now) as u64;
                    }
                    last_sweep = Some(now);
                }
            }

            let decision = self.decide(&req);
            if decision.allowed {
                summary.allowed += 1;
            } else {
                summary.rejected += 1;
            }

            serde_json::to_writer(
                &mut output,
                &DecisionLine {
                    api_key: &req.api_key,
                    route: &req.route,
                    epoch_seconds: req.epoch_seconds,
                    decision,
                },
            )?;
            writeln!(output)?;
        }

        output.flush()?;

        info!(
            total = summary.total,
            allowed = summary.allowed,
            rejected = summary.rejected,
            invalid = summary.invalid,
            swept = summary.swept,
            "Replay finished"
        );

        Ok(summary)
    }

    fn decide(&self, req: &RequestDescriptor) -> Decision {
        match self.ordering {
            RequestOrder::RecordThenCheck => self.limiter.admit(req),
            RequestOrder::CheckThenRecord => {
                let decision = self.limiter.evaluate(req);
                self.limiter.record_request(req);
                decision
            }
        }
    }
}

fn parse_request(line: &str) -> Result<RequestDescriptor> {
    let req: RequestDescriptor = serde_json::from_str(line)?;
    req.validate()?;
    Ok(req)
}
