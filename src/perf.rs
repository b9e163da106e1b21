//! Performance marks and measures recorded by the guest.

use crate::error::HostError;

#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
    pub name: String,
    pub time_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub name: String,
    pub start_ms: f64,
    pub duration_ms: f64,
}

#[derive(Debug, Default)]
pub struct Performance {
    marks: Vec<Mark>,
    measures: Vec<Measure>,
}

impl Performance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, name: &str, now_ms: f64) {
        self.marks.push(Mark {
            name: name.to_string(),
            time_ms: now_ms,
        });
    }

    /// Record the time from the latest mark named `start` (or from zero) to
    /// `now_ms`.
    pub fn measure(&mut self, name: &str, start: Option<&str>, now_ms: f64) -> Result<f64, HostError> {
        let start_ms = match start {
            Some(mark) => self
                .marks
                .iter()
                .rev()
                .find(|m| m.name == mark)
                .map(|m| m.time_ms)
                .ok_or_else(|| HostError::syntax_error(format!("the mark '{mark}' does not exist")))?,
            None => 0.0,
        };
        let duration_ms = now_ms - start_ms;
        self.measures.push(Measure {
            name: name.to_string(),
            start_ms,
            duration_ms,
        });
        Ok(duration_ms)
    }

    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measure_uses_latest_mark() {
        let mut perf = Performance::new();
        perf.mark("load", 1.0);
        perf.mark("load", 4.0);
        assert_eq!(perf.measure("since-load", Some("load"), 10.0).expect("measure"), 6.0);
        assert_eq!(perf.measure("total", None, 10.0).expect("measure"), 10.0);
        assert_eq!(perf.measures().len(), 2);

        let err = perf.measure("x", Some("missing"), 1.0).expect_err("unknown mark");
        assert_eq!(err.name, "SyntaxError");
    }
}
