use std::fmt;
use std::time::Duration;

/// Timing for one client stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTiming {
    pub label: &'static str,
    pub elapsed: Duration,
}

/// What the benchmark prints once both loops finish.
#[derive(Debug, Clone)]
pub struct RunReport {
    total: usize,
    results: Vec<ClientTiming>,
}

impl RunReport {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            results: Vec::new(),
        }
    }

    pub fn record(&mut self, label: &'static str, elapsed: Duration) {
        self.results.push(ClientTiming { label, elapsed });
    }

    /// Requests each client ran.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn results(&self) -> &[ClientTiming] {
        &self.results
    }

    /// Rendered lines, header first.
    pub fn lines(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.results.len() + 1);
        out.push(format!("Results for {} requests", self.total));
        for timing in &self.results {
            out.push(format!(
                "{} {} ms",
                timing.label,
                timing.elapsed.as_millis()
            ));
        }
        out
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}
