use indicatif::{ProgressBar, ProgressStyle};
use simbatch_core::engine::TracingObserver;
use simbatch_core::{Completion, JobOutcome, Progress, ProgressObserver};

/// Terminal progress bar; completions are still logged through `tracing`.
pub struct BarObserver {
    bar: ProgressBar,
    log: TracingObserver,
}

impl BarObserver {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        {
            bar.set_style(style.progress_chars("█▓░"));
        }
        Self {
            bar,
            log: TracingObserver,
        }
    }
}

impl ProgressObserver for BarObserver {
    fn on_start(&self, total_hint: Option<usize>) {
        if let Some(total) = total_hint {
            self.bar.set_length(total as u64);
        }
    }

    fn on_completion(&self, completion: &Completion, progress: &Progress) {
        self.bar.suspend(|| self.log.on_completion(completion, progress));
        if let JobOutcome::Failure { .. } = completion.outcome {
            self.bar.set_message(format!("{} failed", progress.failed));
        }
        self.bar.inc(1);
    }

    fn on_finish(&self, progress: &Progress) {
        self.bar.finish_and_clear();
        self.log.on_finish(progress);
    }
}
