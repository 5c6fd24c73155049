//! Result table and derived metrics.

use std::io::{self, Write};
use std::time::Duration;

const MIB: f64 = 1024.0 * 1024.0;

/// Timing of one measured ping-pong loop, as seen by rank 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub size: usize,
    pub iters: usize,
    pub warmup: usize,
    pub elapsed: Duration,
}

impl Measurement {
    /// Half round-trip time in microseconds.
    pub fn latency_us(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1e6 / self.iters as f64 / 2.0
    }

    /// Messages per second across the pair; each iteration carries two.
    pub fn msg_rate(&self) -> f64 {
        self.iters as f64 / self.elapsed.as_secs_f64() * 2.0
    }

    /// MiB per second across the pair.
    pub fn bandwidth_mbps(&self) -> f64 {
        (self.iters * self.size) as f64 / self.elapsed.as_secs_f64() / MIB * 2.0
    }
}

pub fn header() -> String {
    format!("{:<10}{:>15}{:>15}{:>15}", "Size", "Latency us", "Msg/s", "BW MB/s")
}

pub fn row(m: &Measurement) -> String {
    format!(
        "{:<10}{:>15.2}{:>15.2}{:>15.2}",
        m.size,
        m.latency_us(),
        m.msg_rate(),
        m.bandwidth_mbps()
    )
}

pub fn write_header<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "{}", header())?;
    out.flush()
}

pub fn write_row<W: Write>(out: &mut W, m: &Measurement) -> io::Result<()> {
    writeln!(out, "{}", row(m))?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(size: usize, micros: u64) -> Measurement {
        Measurement {
            size,
            iters: 100,
            warmup: 10,
            elapsed: Duration::from_micros(micros),
        }
    }

    #[test]
    fn header_layout() {
        assert_eq!(
            header(),
            "Size           Latency us          Msg/s        BW MB/s"
        );
    }

    #[test]
    fn row_layout() {
        // 100 iterations in 400us: 2us half round trip, 500k msg/s.
        let m = sample(8, 400);
        assert_eq!(
            row(&m),
            format!("{:<10}{:>15}{:>15}{:>15}", 8, "2.00", "500000.00", "3.81")
        );
    }

    #[test]
    fn metrics_are_consistent() {
        for (size, micros) in [(8, 123), (4096, 9_876), (8 << 20, 1_234_567)] {
            let m = sample(size, micros);
            let bw_bytes = m.bandwidth_mbps() * MIB;
            let expected = m.msg_rate() * size as f64;
            assert!((bw_bytes - expected).abs() / expected < 1e-9);
            assert!((m.latency_us() * 2.0 * m.msg_rate() - 1e6).abs() < 1e-3);
        }
    }

    #[test]
    fn rows_go_through_writer() {
        let mut out = Vec::new();
        write_header(&mut out).unwrap();
        write_row(&mut out, &sample(16, 500)).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("16 "));
    }
}
