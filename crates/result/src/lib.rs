//! Probe outcomes, aggregated ping results, and RTT statistics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a single echo probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub success: bool,
    /// Round trip in milliseconds, -1 when no reply arrived.
    pub rtt_ms: i64,
    /// Hop count of the reply, -1 when unknown.
    pub ttl: i32,
    /// Failure detail, empty on success.
    pub error: String,
    /// Interface the probe went through, possibly empty.
    pub interface: String,
}

impl Default for ProbeOutcome {
    fn default() -> Self {
        Self {
            success: false,
            rtt_ms: -1,
            ttl: -1,
            error: String::new(),
            interface: String::new(),
        }
    }
}

impl ProbeOutcome {
    pub fn success(rtt_ms: i64, ttl: i32) -> Self {
        Self {
            success: true,
            rtt_ms,
            ttl,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }
}

/// Aggregated outcome of one or more probes toward a host. The headline
/// numbers track the best success; `probes` keeps every attempt in send
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub reachable: bool,
    pub rtt_ms: i64,
    pub ttl: i32,
    pub probes: Vec<ProbeOutcome>,
}

impl Default for PingResult {
    fn default() -> Self {
        Self {
            reachable: false,
            rtt_ms: -1,
            ttl: -1,
            probes: Vec::new(),
        }
    }
}

/// RTT statistics over the successful probes of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttStats {
    pub min: i64,
    pub avg: f64,
    pub max: i64,
    pub median: f64,
    pub stddev: f64,
    pub jitter: f64,
}

/// Summary of a probe series toward one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttSummary {
    pub host: String,
    pub sent: u64,
    pub received: u64,
    /// Integer percentage, matching classic ping output.
    pub loss: u64,
    pub rtt: RttStats,
}

pub const SUMMARY_CSV_HEADER: &str = "host,sent,received,loss,min,avg,max,median,stddev,jitter";
pub const PROBES_CSV_HEADER: &str = "host,idx,success,rtt_ms,ttl,if,error";

/// Summary over recorded outcomes.
pub fn summarize(host: &str, probes: &[ProbeOutcome]) -> RttSummary {
    let rtts: Vec<i64> = probes
        .iter()
        .filter(|probe| probe.success)
        .map(|probe| probe.rtt_ms)
        .collect();
    from_series(host, probes.len() as u64, &rtts)
}

/// Summary from an already-collected RTT series; continuous probing
/// keeps counters instead of full probe records.
pub fn from_series(host: &str, sent: u64, rtts: &[i64]) -> RttSummary {
    let received = rtts.len() as u64;
    let loss = if sent > 0 {
        100 - received * 100 / sent
    } else {
        100
    };
    RttSummary {
        host: host.to_string(),
        sent,
        received,
        loss,
        rtt: rtt_stats(rtts),
    }
}

fn rtt_stats(rtts: &[i64]) -> RttStats {
    if rtts.is_empty() {
        return RttStats {
            min: 0,
            avg: 0.0,
            max: 0,
            median: 0.0,
            stddev: 0.0,
            jitter: 0.0,
        };
    }
    let min = rtts.iter().copied().min().unwrap_or(0);
    let max = rtts.iter().copied().max().unwrap_or(0);
    let sum: i64 = rtts.iter().sum();
    let avg = sum as f64 / rtts.len() as f64;

    // Jitter is temporal: mean absolute difference between consecutive
    // samples, unsorted.
    let jitter = if rtts.len() > 1 {
        let diff_sum: i64 = rtts.windows(2).map(|pair| (pair[1] - pair[0]).abs()).sum();
        diff_sum as f64 / (rtts.len() - 1) as f64
    } else {
        0.0
    };

    let mut sorted = rtts.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    };

    let variance = rtts
        .iter()
        .map(|&rtt| {
            let diff = rtt as f64 - avg;
            diff * diff
        })
        .sum::<f64>()
        / rtts.len() as f64;

    RttStats {
        min,
        avg,
        max,
        median,
        stddev: variance.sqrt(),
        jitter,
    }
}

impl RttSummary {
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{:.2},{},{:.2},{:.2},{:.2}",
            self.host,
            self.sent,
            self.received,
            self.loss,
            self.rtt.min,
            self.rtt.avg,
            self.rtt.max,
            self.rtt.median,
            self.rtt.stddev,
            self.rtt.jitter
        )
    }
}

impl fmt::Display for RttSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- {} ping statistics ---", self.host)?;
        writeln!(
            f,
            "{} packets transmitted, {} received, {}% packet loss",
            self.sent, self.received, self.loss
        )?;
        if self.received > 0 {
            writeln!(
                f,
                "rtt min/avg/max/median/mdev/jitter = {}/{:.2}/{}/{:.2}/{:.2}/{:.2} ms",
                self.rtt.min,
                self.rtt.avg,
                self.rtt.max,
                self.rtt.median,
                self.rtt.stddev,
                self.rtt.jitter
            )?;
        }
        Ok(())
    }
}

/// Per-probe CSV block, one row per attempt in send order.
pub fn probes_to_csv(host: &str, probes: &[ProbeOutcome], include_header: bool) -> String {
    let mut out = String::new();
    if include_header {
        out.push_str(PROBES_CSV_HEADER);
        out.push('\n');
    }
    for (idx, probe) in probes.iter().enumerate() {
        let interface = if probe.interface.is_empty() {
            "-"
        } else {
            &probe.interface
        };
        let error = if probe.error.is_empty() {
            "-"
        } else {
            &probe.error
        };
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            host,
            idx + 1,
            u8::from(probe.success),
            if probe.success { probe.rtt_ms } else { 0 },
            if probe.success { probe.ttl } else { -1 },
            interface,
            error
        ));
    }
    out
}

/// Counters for continuous probing. Keeps the full series so median and
/// jitter stay exact.
#[derive(Debug, Default)]
pub struct RollingStats {
    pub sent: u64,
    rtts: Vec<i64>,
}

impl RollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, success: bool, rtt_ms: i64) {
        self.sent += 1;
        if success {
            self.rtts.push(rtt_ms);
        }
    }

    pub fn received(&self) -> u64 {
        self.rtts.len() as u64
    }

    pub fn summary(&self, host: &str) -> RttSummary {
        from_series(host, self.sent, &self.rtts)
    }
}
