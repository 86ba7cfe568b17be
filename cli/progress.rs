use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::sync::Mutex;

use brainsync::{SyncProgressObserver, SyncProgressStage};

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

/// Terminal progress bar for one stage at a time.
#[derive(Default)]
pub struct BarProgress {
    current: Mutex<Option<(SyncProgressStage, ProgressBar)>>,
}

impl SyncProgressObserver for BarProgress {
    fn on_stage_start(&self, stage: SyncProgressStage, total: usize) {
        let bar = create_progress_bar(total as u64, stage.describe());
        if let Ok(mut current) = self.current.lock() {
            if let Some((_, previous)) = current.replace((stage, bar)) {
                previous.finish_and_clear();
            }
        }
    }

    fn on_stage_advance(&self, stage: SyncProgressStage, completed: usize) {
        if let Ok(current) = self.current.lock() {
            if let Some((active, bar)) = current.as_ref() {
                if *active == stage {
                    bar.set_position(completed as u64);
                }
            }
        }
    }

    fn on_stage_finish(&self, stage: SyncProgressStage) {
        if let Ok(mut current) = self.current.lock() {
            if current.as_ref().is_some_and(|(active, _)| *active == stage) {
                if let Some((_, bar)) = current.take() {
                    bar.finish_and_clear();
                }
            }
        }
    }
}
