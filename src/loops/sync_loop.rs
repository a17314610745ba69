//! Synchronization tracking loop.
//!
//! Processes the footage one coarse frame at a time and infers which slide
//! is on screen and where it sits in the frame. Tracking is differential:
//! each frame is matched against the last promoted keyframe, and only when
//! that match is weak does the loop fall back to scoring slide candidates
//! directly. Transitions between slides are appended to the instruction log
//! as they are observed.

use std::path::PathBuf;

use log::{debug, error, info, warn};

use crate::features::{BinaryDetector, Descriptors, DetectorParams, HammingMatcher, KeyPoint, Match};
use crate::geometry::quad::{self, quad_perspective, Quad};
use crate::geometry::{refine_homography, Homography};
use crate::io::footage::{FootageSource, FrameReader};
use crate::io::image::GrayImage;
use crate::loops::{LoopState, ProcessLoop, SyncError};
use crate::sync::{index_to_timestamp, SyncInstructions};

/// Minimum matches for a pairing to be considered at all.
const MIN_MATCHES: usize = 5;
/// Matches that are convincing regardless of the keypoint-coverage ratios.
const GREAT_MATCHES: usize = 20;
/// Minimum fraction of either keypoint set that must participate in the
/// match when the match count is small.
const MIN_MATCH_RATIO: f64 = 0.1;
/// Lowe ratio-test threshold for descriptor matching.
const MATCH_RATIO: f32 = 0.8;
/// RANSAC reprojection threshold in pixels.
const RANSAC_THRESHOLD: f64 = 2.5;
/// Cost below which a differential match confirms the current slide.
const GOOD_COST: f64 = 20.0;
/// Cost below which a near-miss candidate may be rescued.
const REASONABLE_COST: f64 = 40.0;
/// Cost at and above which a candidate is considered a failed match.
const LARGE_COST: f64 = 1000.0;
/// Pixels of deviation grace for slow camera movement.
const DEVIATION_GRACE: f64 = 5.0;
/// Deformation beyond this many pixels is penalized quadratically; heavy
/// deformation is a strong indicator of a wrong slide.
const DEFORMATION_GRACE: f64 = 5.0;
/// Camera movement that forces a keyframe refresh.
const LARGE_DEVIATION: f64 = 10.0;
const LARGE_DEFORMATION: f64 = 7.0;
/// Plausible slide pose area range in square pixels.
const MIN_POSE_AREA: f64 = 100.0;
const MAX_POSE_AREA: f64 = 25_000_000.0;
/// Consecutive bad frames before the whole deck is scanned.
const FULL_SCAN_AFTER: u32 = 7;
/// After a fruitless full scan the counter backs off by this much, so the
/// expensive scan re-arms every 4 bad frames instead of every frame.
const FULL_SCAN_REARM: u32 = 4;
/// Consecutive near-miss frames required before the previous-pose cost is
/// accepted in place of the reference-pose cost.
const NEAR_STREAK: u32 = 3;

/// Tracker stage, matched at the top of every tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncStage {
    Initialize,
    Track,
    Idle,
}

/// Stateful frame-to-slide tracking loop.
pub struct SyncLoop<'a> {
    footage: FrameReader<'a>,
    slides: &'a [GrayImage],
    cache_path: PathBuf,

    detector: BinaryDetector,
    matcher: HammingMatcher,

    stage: SyncStage,
    slide_features: Vec<(Vec<KeyPoint>, Descriptors)>,

    // Reference snapshot carried across steps.
    slide_index: usize,
    ref_frame: GrayImage,
    ref_frame_keypoints: Vec<KeyPoint>,
    ref_frame_descriptors: Descriptors,
    ref_quad_keypoints: Vec<KeyPoint>,
    ref_quad_descriptors: Descriptors,
    ref_quad_indices: Vec<i32>,
    ref_slidepose: Quad,
    prev_slidepose: Quad,
    near_count: u32,
    bad_count: u32,

    instructions: SyncInstructions,
    framerate: u32,

    processing: bool,
    finished: bool,
    on_finished: Option<Box<dyn FnMut() + 'a>>,
    progress: Option<Box<dyn FnMut() + 'a>>,
}

impl<'a> SyncLoop<'a> {
    pub fn new(
        footage: &'a mut dyn FootageSource,
        slides: &'a [GrayImage],
        cache_path: PathBuf,
        detector_params: DetectorParams,
    ) -> Self {
        let framerate = footage.fps().round() as u32;
        let footage = FrameReader::new(footage);
        Self {
            footage,
            slides,
            cache_path,
            detector: BinaryDetector::new(detector_params),
            matcher: HammingMatcher::new(MATCH_RATIO),
            stage: SyncStage::Initialize,
            slide_features: Vec::new(),
            slide_index: 0,
            ref_frame: GrayImage::empty(),
            ref_frame_keypoints: Vec::new(),
            ref_frame_descriptors: Descriptors::new(),
            ref_quad_keypoints: Vec::new(),
            ref_quad_descriptors: Descriptors::new(),
            ref_quad_indices: Vec::new(),
            ref_slidepose: Quad::default(),
            prev_slidepose: Quad::default(),
            near_count: 0,
            bad_count: 0,
            instructions: SyncInstructions::with_framerate(slides.len() as u32, framerate),
            framerate,
            processing: false,
            finished: false,
            on_finished: None,
            progress: None,
        }
    }

    /// Callback invoked exactly once when the loop completes.
    pub fn on_finished(mut self, callback: impl FnMut() + 'a) -> Self {
        self.on_finished = Some(Box::new(callback));
        self
    }

    /// Cooperative yield callback, invoked after each expensive stage.
    pub fn with_progress(mut self, callback: impl FnMut() + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn instructions(&self) -> &SyncInstructions {
        &self.instructions
    }

    pub fn into_instructions(self) -> SyncInstructions {
        self.instructions
    }

    /// Consecutive weak frames seen; exposed for diagnostics.
    pub fn bad_count(&self) -> u32 {
        self.bad_count
    }

    /// Current best-believed slide (zero-based).
    pub fn slide_index(&self) -> usize {
        self.slide_index
    }

    /// Grayscale image of the current reference keyframe, for host display.
    pub fn reference_frame(&self) -> &GrayImage {
        &self.ref_frame
    }

    /// Pose of the slide within the reference keyframe.
    pub fn slide_pose(&self) -> &Quad {
        &self.ref_slidepose
    }

    /// Reference keypoints and descriptors inside the slide pose, for host
    /// overlays.
    pub fn reference_quad_features(&self) -> (&[KeyPoint], &Descriptors) {
        (&self.ref_quad_keypoints, &self.ref_quad_descriptors)
    }

    fn loop_state(&self) -> LoopState {
        if self.stage == SyncStage::Idle {
            LoopState::Idle
        } else {
            LoopState::Running
        }
    }

    fn finish(&mut self) {
        self.stage = SyncStage::Idle;
        if !self.finished {
            self.finished = true;
            if let Some(callback) = self.on_finished.as_mut() {
                callback();
            }
        }
    }

    fn initialize(&mut self) -> Result<(), SyncError> {
        if self.slides.is_empty() {
            error!("the slide deck is empty");
            self.stage = SyncStage::Idle;
            return Err(SyncError::InitialAlignmentFailed);
        }

        info!("extracting keypoints for {} slides", self.slides.len());
        for slide in self.slides {
            let features = self.detector.detect_and_compute(slide);
            self.slide_features.push(features);
            cooperative_yield(&mut self.progress);
        }

        if self.cache_path.exists() {
            match std::fs::read_to_string(&self.cache_path) {
                Ok(text) => match SyncInstructions::parse(&text) {
                    Ok(parsed) => {
                        info!(
                            "reusing cached synchronization ({} instructions)",
                            parsed.len()
                        );
                        self.instructions = parsed;
                        self.finish();
                        return Ok(());
                    }
                    Err(err) => warn!("can't parse cached instructions: {err}"),
                },
                Err(err) => warn!("can't read cached instructions: {err}"),
            }
        }

        // Match the first frame to find the slide projection in the footage.
        // Non-rewindable sources (realtime streams) are unsupported.
        let Some(first) = self.footage.peek_first()? else {
            error!("footage has no readable frames");
            self.stage = SyncStage::Idle;
            return Err(SyncError::InitialAlignmentFailed);
        };
        let gray = first.to_gray();

        let (frame_keypoints, frame_descriptors) = self.detector.detect_and_compute(&gray);
        cooperative_yield(&mut self.progress);

        let (slide_keypoints, slide_descriptors) = &self.slide_features[0];
        let matches = self.matcher.ratio_match(slide_descriptors, &frame_descriptors);
        cooperative_yield(&mut self.progress);

        let (homography, inliers) =
            refine_homography(slide_keypoints, &frame_keypoints, &matches, RANSAC_THRESHOLD);
        cooperative_yield(&mut self.progress);

        let Some(homography) = homography else {
            error!("can't find a robust matching for the first frame");
            self.stage = SyncStage::Idle;
            return Err(SyncError::InitialAlignmentFailed);
        };
        debug!(
            "initial alignment: {} matches, {} inliers",
            matches.len(),
            inliers.len()
        );

        let slide = &self.slides[0];
        let page = Quad::page(slide.width as f64, slide.height as f64);
        let slidepose = page.perspective(&homography);

        let (quad_keypoints, quad_descriptors, quad_indices) =
            quad_filter(&frame_keypoints, &frame_descriptors, &slidepose);

        self.ref_frame = gray;
        self.ref_frame_keypoints = frame_keypoints;
        self.ref_frame_descriptors = frame_descriptors;
        self.ref_quad_keypoints = quad_keypoints;
        self.ref_quad_descriptors = quad_descriptors;
        self.ref_quad_indices = quad_indices;
        self.ref_slidepose = slidepose;
        self.prev_slidepose = slidepose;

        self.stage = SyncStage::Track;
        Ok(())
    }

    fn track(&mut self) -> Result<(), SyncError> {
        let Some(frame) = self.footage.next_frame()? else {
            let text = self.instructions.serialize();
            std::fs::write(&self.cache_path, text).map_err(|err| SyncError::CacheWrite {
                path: self.cache_path.clone(),
                reason: err.to_string(),
            })?;
            info!(
                "tracking complete: {} instructions cached at {}",
                self.instructions.len(),
                self.cache_path.display()
            );
            self.finish();
            return Ok(());
        };
        let gray = frame.to_gray();

        let (frame_keypoints, frame_descriptors) = self.detector.detect_and_compute(&gray);
        cooperative_yield(&mut self.progress);

        // Differential match against the reference keyframe.
        let matches = self
            .matcher
            .ratio_match(&self.ref_frame_descriptors, &frame_descriptors);
        cooperative_yield(&mut self.progress);

        let (homography, _inliers) = refine_homography(
            &self.ref_frame_keypoints,
            &frame_keypoints,
            &matches,
            RANSAC_THRESHOLD,
        );
        cooperative_yield(&mut self.progress);

        // Approximate the current pose with the reference one projected
        // forward; if the real pose drifts too far away, the reference will
        // be refreshed below to keep future errors small.
        let mut slidepose = quad_perspective(&self.ref_slidepose, homography.as_ref());

        let (quad_keypoints, _quad_descriptors, quad_indices) =
            quad_filter(&frame_keypoints, &frame_descriptors, &slidepose);

        let mut quad_matches = Vec::new();
        for m in &matches {
            let ref_index = self.ref_quad_indices[m.query_idx as usize];
            let quad_index = quad_indices[m.train_idx as usize];
            if ref_index >= 0 && quad_index >= 0 {
                quad_matches.push(Match {
                    query_idx: ref_index as u32,
                    train_idx: quad_index as u32,
                    distance: m.distance,
                });
            }
        }

        let mut new_slide_index = self.slide_index;
        let mut good_match = true;
        let mut make_keyframe = false;
        let mut hard_frame = false;

        let strong = homography.is_some()
            && slide_match(
                &self.ref_quad_keypoints,
                &quad_keypoints,
                &quad_matches,
                homography.as_ref(),
                &self.ref_slidepose,
                &slidepose,
            );

        if strong {
            self.bad_count = 0;
            self.near_count = 0;
        } else {
            // The differential match is weak: check whether other slides
            // explain the frame better.
            hard_frame = true;

            let mut candidates: Vec<usize> = Vec::new();
            if self.bad_count < FULL_SCAN_AFTER {
                let s = self.slide_index as i64;
                for c in [s, s + 1, s - 1, s + 2, s - 2, s + 3, s - 3] {
                    if c >= 0 && (c as usize) < self.slides.len() {
                        candidates.push(c as usize);
                    }
                }
            } else {
                candidates.extend(0..self.slides.len());
                self.bad_count -= FULL_SCAN_REARM;
            }
            cooperative_yield(&mut self.progress);

            let mut best_slide = self.slide_index;
            let mut best_pose = Quad::default();
            let mut best_homography: Option<Homography> = None;
            let mut best_matches: Vec<Match> = Vec::new();
            let mut best_cost = f64::INFINITY;

            for &candidate in &candidates {
                let (slide_keypoints, slide_descriptors) = &self.slide_features[candidate];

                let candidate_matches =
                    self.matcher.ratio_match(slide_descriptors, &frame_descriptors);
                cooperative_yield(&mut self.progress);

                let (h, inliers) = refine_homography(
                    slide_keypoints,
                    &frame_keypoints,
                    &candidate_matches,
                    RANSAC_THRESHOLD,
                );
                cooperative_yield(&mut self.progress);

                let slide = &self.slides[candidate];
                let page = Quad::page(slide.width as f64, slide.height as f64);
                let pose = quad_perspective(&page, h.as_ref());

                let cost = match_cost(
                    slide_keypoints,
                    &frame_keypoints,
                    &inliers,
                    h.as_ref(),
                    &self.ref_slidepose,
                    &pose,
                );

                if cost < best_cost {
                    best_slide = candidate;
                    best_pose = pose;
                    best_homography = h;
                    best_matches = inliers;
                    best_cost = cost;
                }
                cooperative_yield(&mut self.progress);
            }

            // Near-miss rescue: a candidate scored against a stale reference
            // pose can look bad while agreeing perfectly with where the
            // slide was on the previous frame. Accept that reading only
            // after a streak of consistent near-misses.
            if best_cost >= LARGE_COST {
                let (slide_keypoints, _) = &self.slide_features[best_slide];
                let alternative = match_cost(
                    slide_keypoints,
                    &frame_keypoints,
                    &best_matches,
                    best_homography.as_ref(),
                    &self.prev_slidepose,
                    &best_pose,
                );

                if alternative < REASONABLE_COST {
                    self.near_count += 1;
                    if self.near_count >= NEAR_STREAK {
                        best_cost = alternative;
                    }
                } else {
                    self.near_count = 0;
                }
            } else {
                self.near_count = 0;
            }

            if best_cost < LARGE_COST {
                self.bad_count = 0;
            } else {
                // This frame is too bad; skip it and hope the next one is
                // better.
                good_match = false;
                self.bad_count += 1;
            }

            new_slide_index = best_slide;
            slidepose = best_pose;

            if good_match && best_slide != self.slide_index {
                make_keyframe = true;

                let timestamp = self.footage.frame_index();
                let applied = if best_slide == self.slide_index + 1 {
                    self.instructions.next(timestamp, false)
                } else if self.slide_index > 0 && best_slide == self.slide_index - 1 {
                    self.instructions.previous(timestamp, false)
                } else {
                    self.instructions.goto(timestamp, best_slide as u32, false)
                };
                if !applied {
                    debug!("instruction refused at frame {timestamp}");
                }
            }
        }

        let (deviation, deformation) = quad::deviation(&self.ref_slidepose, &slidepose);
        if good_match && (deviation > LARGE_DEVIATION || deformation > LARGE_DEFORMATION) {
            make_keyframe = true;
        }

        info!(
            "frame {} ({} / {}) -- slide {}{}{}",
            self.footage.coarse_index(),
            self.footage.frame_index(),
            index_to_timestamp(self.footage.frame_index(), self.framerate),
            self.slide_index + 1,
            if make_keyframe { "    KF" } else { "" },
            if hard_frame { "    H" } else { "" },
        );

        if make_keyframe {
            self.slide_index = new_slide_index;
            self.ref_frame = gray;
            self.ref_frame_keypoints = frame_keypoints;
            self.ref_frame_descriptors = frame_descriptors;
            self.ref_slidepose = slidepose;
            let (quad_keypoints, quad_descriptors, quad_indices) = quad_filter(
                &self.ref_frame_keypoints,
                &self.ref_frame_descriptors,
                &slidepose,
            );
            self.ref_quad_keypoints = quad_keypoints;
            self.ref_quad_descriptors = quad_descriptors;
            self.ref_quad_indices = quad_indices;
        }

        self.prev_slidepose = slidepose;
        Ok(())
    }
}

impl ProcessLoop for SyncLoop<'_> {
    fn tick(&mut self) -> Result<LoopState, SyncError> {
        if self.processing {
            return Ok(self.loop_state());
        }
        self.processing = true;
        let result = match self.stage {
            SyncStage::Initialize => self.initialize(),
            SyncStage::Track => self.track(),
            SyncStage::Idle => Ok(()),
        };
        self.processing = false;
        result.map(|_| self.loop_state())
    }
}

/// Invoke the cooperative yield callback, if any.
///
/// Free function over the callback slot alone, so yields can happen while
/// other tracker fields are borrowed.
fn cooperative_yield<'a>(progress: &mut Option<Box<dyn FnMut() + 'a>>) {
    if let Some(callback) = progress.as_mut() {
        callback();
    }
}

/// Partition keypoints into those inside the quad.
///
/// Returns the filtered keypoints and descriptors along with a lookup table
/// `m` where `m[i]` is the quad-subset index of keypoint `i`, or -1 when the
/// keypoint lies outside the quad.
pub(crate) fn quad_filter(
    keypoints: &[KeyPoint],
    descriptors: &Descriptors,
    quad: &Quad,
) -> (Vec<KeyPoint>, Descriptors, Vec<i32>) {
    let mut lookup = vec![-1i32; keypoints.len()];
    let mut quad_keypoints = Vec::new();
    let mut quad_descriptors = Descriptors::new();

    let mut next = 0i32;
    for (i, keypoint) in keypoints.iter().enumerate() {
        if quad.inside(keypoint.x as f64, keypoint.y as f64) {
            quad_keypoints.push(*keypoint);
            if let Some(row) = descriptors.get(i) {
                quad_descriptors.push(row);
            }
            lookup[i] = next;
            next += 1;
        }
    }

    (quad_keypoints, quad_descriptors, lookup)
}

/// Cost of matching two frames, blending reprojection error with changes in
/// the slide pose. Infinite when any input invariant is violated.
pub(crate) fn match_cost(
    keypoints1: &[KeyPoint],
    keypoints2: &[KeyPoint],
    matches: &[Match],
    homography: Option<&Homography>,
    slidepose1: &Quad,
    slidepose2: &Quad,
) -> f64 {
    if matches.len() < MIN_MATCHES {
        return f64::INFINITY;
    }

    if !slidepose1.convex_clockwise() || !slidepose2.convex_clockwise() {
        return f64::INFINITY;
    }

    if slidepose1.area() < MIN_POSE_AREA || slidepose2.area() < MIN_POSE_AREA {
        return f64::INFINITY;
    }

    if slidepose1.area() > MAX_POSE_AREA || slidepose2.area() > MAX_POSE_AREA {
        return f64::INFINITY;
    }

    let Some(homography) = homography else {
        return f64::INFINITY;
    };

    let (deviation, deformation) = quad::deviation(slidepose1, slidepose2);
    let deviation_cost = (deviation - DEVIATION_GRACE).max(0.0);
    let deformation_excess = (deformation - DEFORMATION_GRACE).max(0.0);
    let deformation_cost = deformation_excess * deformation_excess;

    let mut reprojection = 0.0;
    let mut usable = matches.len();

    for m in matches {
        let projected = homography.apply(keypoints1[m.query_idx as usize].point());
        let observed = keypoints2[m.train_idx as usize].point();
        let distance = (projected - observed).norm();

        if distance.is_nan() {
            usable -= 1;
        } else {
            reprojection += distance;
        }
    }

    // Some matches may have projected to NaN, so check the count again.
    if usable < MIN_MATCHES {
        return f64::INFINITY;
    }

    reprojection / usable as f64 + deviation_cost + deformation_cost
}

/// Whether the slide regions of two frames agree well enough to confirm the
/// current slide without a candidate search.
pub(crate) fn slide_match(
    keypoints1: &[KeyPoint],
    keypoints2: &[KeyPoint],
    matches: &[Match],
    homography: Option<&Homography>,
    slidepose1: &Quad,
    slidepose2: &Quad,
) -> bool {
    if matches.len() < MIN_MATCHES {
        return false;
    }

    let ratio1 = matches.len() as f64 / keypoints1.len() as f64;
    let ratio2 = matches.len() as f64 / keypoints2.len() as f64;

    if homography.is_none()
        || (matches.len() < GREAT_MATCHES && (ratio1 < MIN_MATCH_RATIO || ratio2 < MIN_MATCH_RATIO))
    {
        return false;
    }

    match_cost(
        keypoints1,
        keypoints2,
        matches,
        homography,
        slidepose1,
        slidepose2,
    ) < GOOD_COST
}
