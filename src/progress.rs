use tracing::info;

/// Receives run progress as a percentage in `[0, 100]`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, percent: f64) {
        self(percent)
    }
}

/// Logs progress through `tracing`; used when no host UI is attached.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, percent: f64) {
        info!(percent, "ratings sync progress");
    }
}

/// Forwards to a sink only when the integer percentage advances, and never backwards.
pub struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    last: Option<u8>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self { sink, last: None }
    }

    pub fn report(&mut self, percent: f64) {
        let bucket = if percent.is_nan() {
            0
        } else {
            percent.clamp(0.0, 100.0).floor() as u8
        };
        if self.last.is_some_and(|last| bucket <= last) {
            return;
        }
        self.last = Some(bucket);
        self.sink.report(f64::from(bucket));
    }

    /// Reports `start + span * done / total`; an empty phase counts as complete.
    pub fn report_phase(&mut self, start: f64, span: f64, done: usize, total: usize) {
        let fraction = if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        };
        self.report(start + span * fraction);
    }

    pub fn finish(&mut self) {
        self.report(100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collect(f: impl FnOnce(&mut ProgressReporter<'_>)) -> Vec<f64> {
        let seen = Mutex::new(Vec::new());
        let sink = |p: f64| seen.lock().unwrap().push(p);
        {
            let mut reporter = ProgressReporter::new(&sink);
            f(&mut reporter);
        }
        seen.into_inner().unwrap()
    }

    #[test]
    fn only_advancing_buckets_are_reported() {
        let seen = collect(|r| {
            r.report(0.0);
            r.report(0.4);
            r.report(5.0);
            r.report(5.9);
            r.report(3.0);
            r.report(30.2);
            r.finish();
            r.finish();
        });
        assert_eq!(seen, vec![0.0, 5.0, 30.0, 100.0]);
    }

    #[test]
    fn values_are_clamped() {
        let seen = collect(|r| {
            r.report(-3.0);
            r.report(140.0);
        });
        assert_eq!(seen, vec![0.0, 100.0]);
    }

    #[test]
    fn phases_scale_into_their_span() {
        let seen = collect(|r| {
            r.report(30.0);
            for done in 1..=4 {
                r.report_phase(30.0, 60.0, done, 4);
            }
            r.report_phase(90.0, 10.0, 0, 0);
        });
        assert_eq!(seen, vec![30.0, 45.0, 60.0, 75.0, 90.0, 100.0]);
    }
}
