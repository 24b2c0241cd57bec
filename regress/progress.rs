use std::fmt;

/// Stages reported while running bootstraps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BootstrapProgressStage {
    SingleTask,
    Multitask,
}

impl BootstrapProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::SingleTask => "bootstrap regression",
            Self::Multitask => "multitask bootstrap regression",
        }
    }
}

impl fmt::Display for BootstrapProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting bootstrap iterations as they complete.
pub trait BootstrapProgressObserver {
    fn on_start(&mut self, stage: BootstrapProgressStage, total_bootstraps: usize) {
        let _ = (stage, total_bootstraps);
    }
    fn on_advance(&mut self, stage: BootstrapProgressStage, completed_bootstraps: usize) {
        let _ = (stage, completed_bootstraps);
    }
    fn on_finish(&mut self, stage: BootstrapProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopBootstrapProgress;

impl BootstrapProgressObserver for NoopBootstrapProgress {}
