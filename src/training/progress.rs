//! Terminal progress for training and validation passes

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar over the batches of one pass; draws nothing when disabled
pub struct PassProgress {
    bar: ProgressBar,
}

impl PassProgress {
    /// Create a bar for `total` batches
    pub fn new(label: &str, total: usize, enabled: bool) -> Self {
        if !enabled {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }

        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("█▇▆▅▄▃▂▁  "));
        }
        bar.set_prefix(label.to_string());

        Self { bar }
    }

    /// Count one batch and show the running loss
    pub fn advance(&self, mean_loss: f64, lr: Option<f64>) {
        self.bar.inc(1);
        match lr {
            Some(lr) => self.bar.set_message(format!("loss: {:.4}, lr: {:.2e}", mean_loss, lr)),
            None => self.bar.set_message(format!("loss: {:.4}", mean_loss)),
        }
    }

    /// Remove the bar from the terminal
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
