use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;

use crate::config::{AutoSave, BatchSettings};
use crate::iterator::{CaseIterator, IteratorError};
use crate::table::TableError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("start position {start} is beyond the last case ({count} cases)")]
    StartBeyondEnd { count: usize, start: usize },

    #[error("a batch is already running, reset it before starting another")]
    AlreadyRunning,

    #[error(transparent)]
    Iterator(#[from] IteratorError),

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Outcome of a batch step, reported to the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    CaseLoaded(usize),
    /// The previous case was closed but the target case failed to load. The
    /// position does not advance, so the step can be retried.
    LoadFailed(usize),
    /// Stepping backwards from the first case changes nothing.
    AtFirstCase,
    /// The batch ran past its last case and returned to idle.
    Finished,
    /// No batch is running.
    Idle,
}

/// Wall-clock editing time for one case, with pause support.
#[derive(Debug, Default)]
struct CaseTimer {
    elapsed: Duration,
    started: Option<Instant>,
}

impl CaseTimer {
    fn running() -> Self {
        CaseTimer {
            elapsed: Duration::ZERO,
            started: Some(Instant::now()),
        }
    }

    fn pause(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed += started.elapsed();
        }
    }

    fn resume(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn total(&self) -> Duration {
        let running = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.elapsed + running
    }
}

/// Drives a [`CaseIterator`] through a batch: position, direction, timing
/// and table write-back. Position is `-1` while idle; a batch runs from the
/// configured start case until it steps past the end.
pub struct BatchController {
    iterator: CaseIterator,
    settings: BatchSettings,
    current_idx: isize,
    timer: Option<CaseTimer>,
    mask_out_column: String,
    timing_column: Option<String>,
}

impl BatchController {
    pub fn new(iterator: CaseIterator, settings: BatchSettings) -> Self {
        let mask_out_column = settings.output_column("mask-out");
        let timing_column = settings
            .keep_time
            .then(|| settings.output_column("timing"));
        BatchController {
            iterator,
            settings,
            current_idx: -1,
            timer: None,
            mask_out_column,
            timing_column,
        }
    }

    pub fn iterator(&self) -> &CaseIterator {
        &self.iterator
    }

    pub fn iterator_mut(&mut self) -> &mut CaseIterator {
        &mut self.iterator
    }

    /// Whether a case is currently materialized.
    pub fn is_active(&self) -> bool {
        self.iterator.current().is_some()
    }

    pub fn current_index(&self) -> Option<usize> {
        (self.current_idx >= 0).then_some(self.current_idx as usize)
    }

    /// Begin the batch at `start_position` (1-based, as shown to the user).
    /// Output columns are added up front so every close can write its cells.
    pub fn start(&mut self, start_position: usize) -> Result<BatchEvent, ControllerError> {
        if self.is_active() {
            return Err(ControllerError::AlreadyRunning);
        }
        let count = self.iterator.source().case_count();
        let start = start_position.max(1);
        if count < start {
            return Err(ControllerError::StartBeyondEnd { count, start });
        }

        let table = self.iterator.source_mut().table_mut();
        table.add_column(&self.mask_out_column);
        if let Some(timing) = &self.timing_column {
            table.add_column(timing);
        }

        let index = start - 1;
        match self.iterator.load_case(index) {
            Ok(_) => {
                self.current_idx = index as isize;
                self.timer = Some(CaseTimer::running());
                info!("Batch started with {count} cases at case {start}");
                Ok(BatchEvent::CaseLoaded(index))
            }
            Err(err) => {
                self.current_idx = -1;
                Err(err.into())
            }
        }
    }

    pub fn next_case(&mut self) -> Result<BatchEvent, ControllerError> {
        self.step(1)
    }

    pub fn previous_case(&mut self) -> Result<BatchEvent, ControllerError> {
        self.step(-1)
    }

    fn step(&mut self, delta: isize) -> Result<BatchEvent, ControllerError> {
        if self.current_idx < 0 {
            warn!("No batch is running");
            return Ok(BatchEvent::Idle);
        }

        let new_idx = self.current_idx + delta;
        if new_idx < 0 {
            warn!("Already at the first case");
            return Ok(BatchEvent::AtFirstCase);
        }
        let new_idx = new_idx as usize;
        let count = self.iterator.source().case_count();

        let should_close = new_idx >= count || self.iterator.source().should_close(new_idx);
        self.close_current(should_close)?;

        if new_idx >= count {
            if self.settings.auto_save == AutoSave::BatchEnd {
                self.save_table()?;
            }
            self.current_idx = -1;
            info!("All cases are done");
            return Ok(BatchEvent::Finished);
        }

        match self.iterator.load_case(new_idx) {
            Ok(_) => {
                self.current_idx = new_idx as isize;
                self.timer = Some(CaseTimer::running());
                Ok(BatchEvent::CaseLoaded(new_idx))
            }
            Err(err) => {
                // Position is kept so the same step can be retried once the
                // underlying problem is fixed.
                error!("Failed to load case {}: {err}", new_idx + 1);
                Ok(BatchEvent::LoadFailed(new_idx))
            }
        }
    }

    /// Close the current case, persist masks per the batch settings and
    /// write this case's output cells.
    fn close_current(&mut self, should_close: bool) -> Result<(), ControllerError> {
        if !self.is_active() {
            return Ok(());
        }
        let row = self.current_idx as usize;

        let elapsed = self.timer.take().map(|t| t.total());
        let saved_mask = self.iterator.close_case(
            self.settings.save_loaded_masks,
            self.settings.save_new_masks,
            should_close,
        )?;

        let mask_out_column = self.mask_out_column.clone();
        let timing_column = self.timing_column.clone();
        let table = self.iterator.source_mut().table_mut();
        if let Some(path) = saved_mask {
            table.set(row, &mask_out_column, &path.display().to_string());
        }
        if let (Some(column), Some(elapsed)) = (timing_column, elapsed) {
            table.set(row, &column, &format!("{:.3}", elapsed.as_secs_f64()));
        }

        if self.settings.auto_save == AutoSave::EachCase {
            self.save_table()?;
        }
        Ok(())
    }

    /// Stop the batch: close the current case and return to idle.
    pub fn reset(&mut self) -> Result<(), ControllerError> {
        self.close_current(true)?;
        if self.current_idx >= 0 && self.settings.auto_save == AutoSave::BatchEnd {
            self.save_table()?;
        }
        self.current_idx = -1;
        Ok(())
    }

    pub fn pause_timing(&mut self) {
        if let Some(timer) = &mut self.timer {
            timer.pause();
        }
    }

    pub fn resume_timing(&mut self) {
        if let Some(timer) = &mut self.timer {
            timer.resume();
        }
    }

    /// Write the table back to its backing file. A table that never came
    /// from a file is skipped with a warning; results then only live in the
    /// host's table view.
    pub fn save_table(&mut self) -> Result<(), ControllerError> {
        let table = self.iterator.source_mut().table_mut();
        if !table.has_backing_file() {
            warn!("Table has no backing file, skipping save");
            return Ok(());
        }
        table.save()?;
        Ok(())
    }

    /// Load and close every case once so the host's caches are warm. Only
    /// runs while no batch is active; failures are logged and skipped.
    pub fn preload(&mut self) -> Result<(), ControllerError> {
        if self.is_active() {
            warn!("Cannot preload while a batch is running");
            return Ok(());
        }
        let count = self.iterator.source().case_count();
        for index in 0..count {
            if let Err(err) = self.iterator.load_case(index) {
                warn!("Preload of case {} failed: {err}", index + 1);
                continue;
            }
            self.iterator.scene_mut().process_pending_events();
            self.iterator.close_case(false, false, true)?;
        }
        info!("Preloaded {count} cases");
        Ok(())
    }
}
