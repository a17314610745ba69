//! Tracking scenarios over synthetic footage.
//!
//! Decks are procedurally textured so every slide has a rich, unique corner
//! population, and footage frames show a slide verbatim (the projection
//! fills the frame). That keeps the scenarios focused on the tracker's
//! decisions rather than the detector's robustness.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::sync_loop::SyncLoop;
use super::{LoopState, ProcessLoop};
use crate::features::DetectorParams;
use crate::io::footage::{FootageSource, Result as FootageResult};
use crate::io::image::{GrayImage, RgbFrame};
use crate::sync::{SyncCode, SyncInstructions};

struct TestRng(u64);

impl TestRng {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
    }

    fn next(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn range(&mut self, n: u32) -> u32 {
        self.next() % n.max(1)
    }
}

const FRAME_WIDTH: u32 = 320;
const FRAME_HEIGHT: u32 = 240;

/// Blocky noise plus solid rectangles: plenty of strong corners whose
/// neighborhoods are globally unique for a given seed.
fn textured_slide(seed: u64) -> GrayImage {
    let mut rng = TestRng::new(seed);
    let w = FRAME_WIDTH as usize;
    let h = FRAME_HEIGHT as usize;

    let blocks_x = w.div_ceil(8);
    let blocks_y = h.div_ceil(8);
    let levels: Vec<u8> = (0..blocks_x * blocks_y)
        .map(|_| (100 + rng.range(130)) as u8)
        .collect();

    let mut data = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            data[y * w + x] = levels[(y / 8) * blocks_x + x / 8];
        }
    }

    for _ in 0..18 {
        let rw = 16 + rng.range(48) as usize;
        let rh = 16 + rng.range(48) as usize;
        let x0 = rng.range((w - rw) as u32) as usize;
        let y0 = rng.range((h - rh) as u32) as usize;
        let value = rng.range(256) as u8;
        for y in y0..y0 + rh {
            for x in x0..x0 + rw {
                data[y * w + x] = value;
            }
        }
    }

    GrayImage::new(FRAME_WIDTH, FRAME_HEIGHT, data)
}

fn occlusion_frame() -> GrayImage {
    GrayImage::new(
        FRAME_WIDTH,
        FRAME_HEIGHT,
        vec![128; FRAME_WIDTH as usize * FRAME_HEIGHT as usize],
    )
}

/// Footage whose frame contents follow a fixed schedule of image ids.
struct ScheduledFootage {
    images: Vec<GrayImage>,
    schedule: Vec<usize>,
    cursor: usize,
}

impl ScheduledFootage {
    fn new(images: Vec<GrayImage>, schedule: Vec<usize>) -> Self {
        Self {
            images,
            schedule,
            cursor: 0,
        }
    }
}

impl FootageSource for ScheduledFootage {
    fn frame_count(&self) -> usize {
        self.schedule.len()
    }

    fn fps(&self) -> f64 {
        24.0
    }

    fn width(&self) -> u32 {
        FRAME_WIDTH
    }

    fn height(&self) -> u32 {
        FRAME_HEIGHT
    }

    fn read_next(&mut self) -> FootageResult<Option<RgbFrame>> {
        let Some(&image_id) = self.schedule.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(RgbFrame::from_gray(&self.images[image_id])))
    }

    fn grab_next(&mut self) -> FootageResult<bool> {
        if self.cursor >= self.schedule.len() {
            return Ok(false);
        }
        self.cursor += 1;
        Ok(true)
    }

    fn seek_start(&mut self) -> FootageResult<()> {
        self.cursor = 0;
        Ok(())
    }
}

fn temp_cache(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("slidesync_scenario_{label}_{nanos}.sync"))
}

/// A smaller feature budget keeps the brute-force matching quick without
/// starving the coverage ratios.
fn scenario_params() -> DetectorParams {
    DetectorParams {
        max_features: 350,
        ..DetectorParams::default()
    }
}

/// Run the tracker to completion; returns the instruction log and the
/// highest bad-frame count observed along the way.
fn track(
    label: &str,
    deck: &[GrayImage],
    images: Vec<GrayImage>,
    schedule: Vec<usize>,
) -> (SyncInstructions, u32) {
    let mut footage = ScheduledFootage::new(images, schedule);
    let cache = temp_cache(label);

    let mut tracker = SyncLoop::new(&mut footage, deck, cache.clone(), scenario_params());
    let mut max_bad = 0;
    loop {
        let state = tracker.tick().expect("tracking step");
        max_bad = max_bad.max(tracker.bad_count());
        if state == LoopState::Idle {
            break;
        }
    }

    let instructions = tracker.into_instructions();
    std::fs::remove_file(&cache).ok();
    (instructions, max_bad)
}

fn schedule_of(segments: &[(usize, usize)]) -> Vec<usize> {
    let mut schedule = Vec::new();
    for &(image_id, frames) in segments {
        schedule.extend(std::iter::repeat(image_id).take(frames));
    }
    schedule
}

#[test]
fn static_footage_emits_no_transitions() {
    // Three identical-looking slides; the differential match never weakens,
    // so the candidate search (which could pick any of them) never runs.
    let slide = textured_slide(7);
    let deck = vec![slide.clone(), slide.clone(), slide.clone()];

    let (instructions, _) = track("static", &deck, vec![slide], schedule_of(&[(0, 24)]));
    assert_eq!(instructions.len(), 0);
}

#[test]
fn sequential_slides_emit_next_transitions() {
    let deck: Vec<GrayImage> = (1..=3).map(textured_slide).collect();
    let schedule = schedule_of(&[(0, 24), (1, 24), (2, 24)]);

    let (instructions, _) = track("sequential", &deck, deck.clone(), schedule);

    assert_eq!(instructions.len(), 2);
    let records: Vec<_> = instructions.iter().collect();
    assert_eq!(records[0].code, SyncCode::Next);
    assert_eq!(records[1].code, SyncCode::Next);
    assert!(
        (records[0].timestamp as i64 - 24).abs() <= 8,
        "first transition at {}",
        records[0].timestamp
    );
    assert!(
        (records[1].timestamp as i64 - 48).abs() <= 8,
        "second transition at {}",
        records[1].timestamp
    );
}

#[test]
fn jump_beyond_candidate_window_emits_goto() {
    let deck: Vec<GrayImage> = (11..=16).map(textured_slide).collect();
    // Slide 5 is outside the +/-3 candidate window of slide 0; the tracker
    // has to exhaust its patience and scan the full deck.
    let schedule = schedule_of(&[(0, 24), (5, 120)]);

    let (instructions, max_bad) = track("jump", &deck, deck.clone(), schedule);

    assert_eq!(instructions.len(), 1);
    let record = instructions.get(0).unwrap();
    assert_eq!(record.code, SyncCode::GoTo);
    assert_eq!(record.data, 5);
    assert!(max_bad > 0);
}

#[test]
fn alternating_slides_emit_next_and_previous() {
    let deck: Vec<GrayImage> = (21..=22).map(textured_slide).collect();
    let schedule = schedule_of(&[(0, 16), (1, 16), (0, 16), (1, 16)]);

    let (instructions, _) = track("alternating", &deck, deck.clone(), schedule);

    assert!(instructions.iter().any(|i| i.code == SyncCode::Next));
    assert!(instructions.iter().any(|i| i.code == SyncCode::Previous));
}

#[test]
fn occlusion_is_absorbed_without_transitions() {
    let deck: Vec<GrayImage> = (31..=33).map(textured_slide).collect();
    let mut images = deck.clone();
    images.push(occlusion_frame());

    // 3 coarse frames of slide 0, 20 occluded coarse frames, then the same
    // slide returns.
    let schedule = schedule_of(&[(0, 24), (3, 160), (0, 24)]);

    let (instructions, max_bad) = track("occlusion", &deck, images, schedule);

    assert_eq!(instructions.len(), 0, "occlusion must not emit transitions");
    assert!(max_bad >= 7, "bad count should climb during occlusion");
}

#[test]
fn finished_tracker_writes_a_reusable_cache() {
    let deck: Vec<GrayImage> = (41..=42).map(textured_slide).collect();
    let schedule = schedule_of(&[(0, 16), (1, 16)]);

    let mut footage = ScheduledFootage::new(deck.clone(), schedule);
    let cache = temp_cache("cache");

    let mut tracker = SyncLoop::new(&mut footage, &deck, cache.clone(), scenario_params());
    loop {
        if tracker.tick().expect("tracking step") == LoopState::Idle {
            break;
        }
    }
    let live = tracker.into_instructions();
    assert!(cache.exists());

    // A second run over the same footage short-circuits to the cached log.
    let mut footage = ScheduledFootage::new(deck.clone(), schedule_of(&[(0, 16), (1, 16)]));
    let mut resumed = SyncLoop::new(&mut footage, &deck, cache.clone(), scenario_params());
    let state = resumed.tick().expect("cache load");
    assert_eq!(state, LoopState::Idle);
    assert_eq!(resumed.instructions(), &live);

    std::fs::remove_file(&cache).ok();
}
