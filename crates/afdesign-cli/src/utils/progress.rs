use afdesign::engine::progress::{Progress, ProgressReporter};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Label used for runs that report steps without announcing a stage.
const UNSTAGED_LABEL: &str = "Design";

/// What the bar is currently describing: the active stage and the most
/// recent loss the session summarized.
#[derive(Debug, Clone, Default, PartialEq)]
struct RunView {
    stage: Option<&'static str>,
    finished_stages: Vec<&'static str>,
    last_step: Option<usize>,
    last_loss: Option<f64>,
}

impl RunView {
    fn label(&self) -> &'static str {
        self.stage.unwrap_or(UNSTAGED_LABEL)
    }

    fn message(&self) -> String {
        match (self.last_step, self.last_loss) {
            (Some(step), Some(loss)) => {
                format!("{} step {} loss {:.3}", self.label(), step, loss)
            }
            _ => self.label().to_string(),
        }
    }

    fn closing_message(&self) -> String {
        let stages = if self.finished_stages.is_empty() {
            UNSTAGED_LABEL.to_string()
        } else {
            self.finished_stages.join(" > ")
        };
        match self.last_loss {
            Some(loss) => format!("✓ {} (loss {:.3})", stages, loss),
            None => format!("✓ {}", stages),
        }
    }
}

struct StageDisplay {
    bar: ProgressBar,
    view: RunView,
}

impl StageDisplay {
    fn apply(&mut self, event: Progress) {
        match event {
            Progress::StageStart { name } => {
                self.view.stage = Some(name);
                self.bar.set_message(self.view.message());
            }
            Progress::StageFinish => {
                if let Some(name) = self.view.stage.take() {
                    self.view.finished_stages.push(name);
                }
            }
            Progress::TaskStart { total_steps } => {
                self.bar.reset();
                self.bar.set_style(bar_style());
                self.bar.set_length(total_steps);
                self.bar.set_message(self.view.message());
            }
            Progress::TaskIncrement => self.bar.inc(1),
            Progress::TaskFinish => {
                if let Some(length) = self.bar.length() {
                    self.bar.set_position(length);
                }
            }
            Progress::StepSummary { step, loss, .. } => {
                self.view.last_step = Some(step);
                self.view.last_loss = Some(loss);
                self.bar.set_message(self.view.message());
            }
            Progress::Message(msg) => self.bar.println(format!("  {}", msg)),
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg:<32} [{bar:30.cyan/blue}] {pos}/{len} ({elapsed})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Shows design stages on stderr, one bar per stage, labelled with the
/// stage name and the latest summarized loss.
#[derive(Clone)]
pub struct StageProgress {
    display: Arc<Mutex<StageDisplay>>,
}

impl StageProgress {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), target);
        Self {
            display: Arc::new(Mutex::new(StageDisplay {
                bar,
                view: RunView::default(),
            })),
        }
    }

    /// A reporter that forwards session events into this display.
    pub fn reporter(&self) -> ProgressReporter<'static> {
        let display = self.display.clone();
        ProgressReporter::with_callback(Box::new(move |event: Progress| {
            match display.lock() {
                Ok(mut guard) => guard.apply(event),
                Err(_) => warn!("Progress display lock was poisoned; dropping event."),
            }
        }))
    }

    /// Leaves a one-line record of the completed stages on the terminal.
    pub fn finish(&self) {
        if let Ok(guard) = self.display.lock() {
            guard.bar.finish_with_message(guard.view.closing_message());
        }
    }
}

impl Default for StageProgress {
    fn default() -> Self {
        Self::new()
    }
}
