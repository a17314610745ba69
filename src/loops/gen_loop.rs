//! Video generation loop.
//!
//! Replays an instruction log against the slide deck, driving the frame
//! sink so every footage time-step gets the slide that was on screen at
//! that moment.

use log::debug;

use crate::io::encoder::FrameSink;
use crate::io::image::{GrayImage, RgbFrame};
use crate::loops::{LoopState, ProcessLoop, SyncError};
use crate::sync::{index_to_timestamp, SyncCode, SyncInstructions};

/// Frames re-encoded between progress callbacks.
const ENCODE_BATCH: u32 = 8;

/// Sync-file driven slide video generator.
pub struct GenLoop<'a> {
    slides: &'a [GrayImage],
    instructions: &'a SyncInstructions,
    cursor: usize,
    timestamp: u32,
    slide: usize,
    sink: Box<dyn FrameSink + 'a>,
    idle: bool,
    processing: bool,
    finished: bool,
    on_finished: Option<Box<dyn FnMut() + 'a>>,
    progress: Option<Box<dyn FnMut() + 'a>>,
}

impl<'a> GenLoop<'a> {
    /// Build the generator and write the opening frame.
    ///
    /// If the first instruction fires at timestamp zero it is pre-applied,
    /// so the video never opens on a slide that was replaced before the
    /// first frame.
    pub fn new(
        slides: &'a [GrayImage],
        instructions: &'a SyncInstructions,
        sink: Box<dyn FrameSink + 'a>,
    ) -> Result<Self, SyncError> {
        let mut slide = 0usize;
        if let Some(first) = instructions.get(0) {
            if first.timestamp == 0 {
                match first.code {
                    SyncCode::Next => slide = 1,
                    SyncCode::GoTo => slide = first.data as usize,
                    _ => {}
                }
            }
        }

        let mut generator = Self {
            slides,
            instructions,
            cursor: 0,
            timestamp: 0,
            slide,
            sink,
            idle: false,
            processing: false,
            finished: false,
            on_finished: None,
            progress: None,
        };
        generator.write_slide()?;
        Ok(generator)
    }

    /// Callback invoked exactly once when the loop completes.
    pub fn on_finished(mut self, callback: impl FnMut() + 'a) -> Self {
        self.on_finished = Some(Box::new(callback));
        self
    }

    /// Cooperative yield callback, invoked between encode batches.
    pub fn with_progress(mut self, callback: impl FnMut() + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    fn write_slide(&mut self) -> Result<(), SyncError> {
        let frame = RgbFrame::from_gray(&self.slides[self.slide]);
        self.sink.write(&frame)?;
        Ok(())
    }

    fn yield_point(&mut self) {
        if let Some(callback) = self.progress.as_mut() {
            callback();
        }
    }

    fn finish(&mut self) {
        self.idle = true;
        if !self.finished {
            self.finished = true;
            if let Some(callback) = self.on_finished.as_mut() {
                callback();
            }
        }
    }

    fn write_frames(&mut self) -> Result<(), SyncError> {
        let Some(instruction) = self.instructions.get(self.cursor).copied() else {
            self.sink.close()?;
            self.finish();
            return Ok(());
        };

        let delta = if instruction.relative {
            instruction.timestamp
        } else {
            instruction.timestamp.saturating_sub(self.timestamp)
        };

        // Overlapping instructions at the same timestamp are skipped
        // outright; executing them would stretch the output, e.g. a
        // thousand same-timestamp records in a two-frame video.
        if delta == 0 {
            self.cursor += 1;
            return Ok(());
        }

        let framerate = self.instructions.framerate();
        let mut remaining = delta - 1;
        let mut frame_index = self.timestamp;

        while remaining > ENCODE_BATCH {
            debug!("encoding... [{}]", index_to_timestamp(frame_index, framerate));
            self.sink.repeat(ENCODE_BATCH)?;
            remaining -= ENCODE_BATCH;
            frame_index += ENCODE_BATCH;
            self.yield_point();
        }
        debug!("encoding... [{}]", index_to_timestamp(frame_index, framerate));
        self.sink.repeat(remaining)?;

        match instruction.code {
            SyncCode::Next => self.slide += 1,
            SyncCode::Previous => self.slide = self.slide.saturating_sub(1),
            SyncCode::GoTo => self.slide = instruction.data as usize,
            SyncCode::End => {}
        }

        // End closes the gap without starting a new slide segment.
        if instruction.code != SyncCode::End {
            self.write_slide()?;
        }

        self.timestamp = if instruction.relative {
            self.timestamp + instruction.timestamp
        } else {
            instruction.timestamp
        };
        self.cursor += 1;
        Ok(())
    }
}

impl ProcessLoop for GenLoop<'_> {
    fn tick(&mut self) -> Result<LoopState, SyncError> {
        if self.processing {
            return Ok(self.state());
        }
        self.processing = true;
        let result = if self.idle {
            Ok(())
        } else {
            self.write_frames()
        };
        self.processing = false;
        result.map(|_| self.state())
    }
}

impl GenLoop<'_> {
    fn state(&self) -> LoopState {
        if self.idle {
            LoopState::Idle
        } else {
            LoopState::Running
        }
    }
}
