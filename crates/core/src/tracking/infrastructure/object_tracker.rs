//! Object detection on top of the keypoint tracker.
//!
//! Each frame, candidate objects are retrieved from the visual database
//! with a long-lived [`IncrementalQuery`], matched against the frame's
//! points through their tracks, and accepted only if a homography (or a
//! fundamental matrix) explains enough of the matches. Verified objects
//! tag their inlier points, so following frames carry the match over
//! along each track. Well tracked points close to a verified object can
//! then be learned into it.

use std::time::Instant;

use nalgebra::Matrix3;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::retrieval::histogram::Histogram;
use crate::retrieval::incremental_query::IncrementalQuery;
use crate::retrieval::visual_database::{
    DbKeypoint, ObjectId, VerifyFlags, VisualDatabase, VisualDatabaseError,
};
use crate::shared::frame::Frame;
use crate::tracking::domain::keypoint_detector::KeypointDetector;
use crate::tracking::infrastructure::geometric_verification::{
    homography_inverse, homography_is_plausible, ransac_fundamental, ransac_homography,
    refine_homography, reprojection_error, transform_point, ModelFit, Point, RansacParams,
};
use crate::tracking::infrastructure::keypoint_tracker::{KeypointTracker, QuantizedKeypoint};
use crate::tracks::track_store::{FrameId, KeypointId};

/// Fewer matches than this never verify.
const MIN_CORRESPONDENCES: usize = 10;
/// Weight of a match carried over from the previous frame.
const TRACKED_WEIGHT: f64 = 100.0;
/// Weight of a raw word match, used when no clusters are loaded.
const WORD_WEIGHT: f64 = 0.1;
/// Max distance in pixels between a learned point's back projection and
/// each of its tracked positions.
const LEARN_REPROJECTION: f32 = 3.0;

/// An object verified on one frame. `transform` maps object coordinates
/// to frame coordinates and `inverse` goes back.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectInstance {
    pub object: ObjectId,
    /// Matches consistent with `transform`.
    pub support: usize,
    pub transform: Matrix3<f64>,
    pub inverse: Matrix3<f64>,
}

/// A frame point matched to an object keypoint.
#[derive(Clone, Debug)]
struct Correspondence {
    point: KeypointId,
    object: Point,
    frame: Point,
    weight: f64,
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct ObjectTracker {
    tracker: KeypointTracker,
    db: VisualDatabase,
    query: IncrementalQuery,
    rng: Xoshiro256PlusPlus,
}

impl ObjectTracker {
    pub fn new(tracker: KeypointTracker, db: VisualDatabase) -> Self {
        let rng = Xoshiro256PlusPlus::seed_from_u64(tracker.settings().seed);
        Self {
            tracker,
            db,
            query: IncrementalQuery::new(),
            rng,
        }
    }

    pub fn tracker(&self) -> &KeypointTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut KeypointTracker {
        &mut self.tracker
    }

    pub fn db(&self) -> &VisualDatabase {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut VisualDatabase {
        &mut self.db
    }

    pub fn into_parts(self) -> (KeypointTracker, VisualDatabase) {
        (self.tracker, self.db)
    }

    /// Objects verified on `frame`.
    pub fn instances(&self, frame: FrameId) -> &[ObjectInstance] {
        self.tracker
            .frame_info(frame)
            .map(|f| f.instances.as_slice())
            .unwrap_or_default()
    }

    /// Detects and tracks one frame, then looks for objects in it.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        detector: &mut dyn KeypointDetector,
    ) -> Result<FrameId, Box<dyn std::error::Error>> {
        let id = self.tracker.process_frame(frame, detector)?;
        self.find_objects(id)?;
        Ok(id)
    }

    /// Same as [`process_frame`](Self::process_frame) for keypoints
    /// detected and quantized elsewhere.
    pub fn ingest(
        &mut self,
        index: usize,
        timestamp: i64,
        width: u32,
        height: u32,
        keypoints: Vec<QuantizedKeypoint>,
    ) -> Result<FrameId, VisualDatabaseError> {
        let id = self.tracker.ingest(index, timestamp, width, height, keypoints);
        self.find_objects(id)?;
        Ok(id)
    }

    fn find_objects(&mut self, frame: FrameId) -> Result<(), VisualDatabaseError> {
        let start = Instant::now();
        let instances = self.track_objects(frame);
        let elapsed = elapsed_ms(start);
        let logger = self.tracker.logger_mut();
        logger.timing("objects", elapsed);
        logger.metric("objects", instances.len() as f64);

        if self.tracker.settings().incremental_learning {
            let start = Instant::now();
            let learned = self.incremental_learning(frame)?;
            let elapsed = elapsed_ms(start);
            let logger = self.tracker.logger_mut();
            logger.timing("learn", elapsed);
            logger.metric("learned", learned as f64);
        }
        Ok(())
    }

    /// Verifies every candidate object on `frame`, records the instances
    /// on the frame and returns them.
    pub fn track_objects(&mut self, frame: FrameId) -> Vec<ObjectInstance> {
        let mut instances = Vec::new();
        for object in self.find_candidates(frame) {
            let (correspondences, nb_tracked) = self.get_correspondences(frame, object);
            if let Some(instance) = self.verify(object, correspondences, nb_tracked) {
                log::debug!(
                    "Object {} verified with {} inliers",
                    instance.object,
                    instance.support
                );
                instances.push(instance);
            }
        }
        if let Some(info) = self.tracker.frame_info_mut(frame) {
            info.instances = instances.clone();
        }
        instances
    }

    fn frame_before(&self, frame: FrameId) -> Option<FrameId> {
        let mut order = self.tracker.store().frame_ids();
        order.by_ref().find(|f| *f == frame)?;
        order.next()
    }

    /// Objects seen on the previous frame, followed by the best database
    /// matches for the current one.
    pub fn find_candidates(&mut self, frame: FrameId) -> Vec<ObjectId> {
        let mut candidates: Vec<ObjectId> = self
            .frame_before(frame)
            .and_then(|f| self.tracker.frame_info(f))
            .map(|info| info.instances.iter().map(|i| i.object).collect())
            .unwrap_or_default();

        self.update_query_with_frame(frame);
        let settings = self.tracker.settings();
        let (max_results, threshold) = (settings.max_results, settings.score_threshold);
        let max = max_results + candidates.len();
        let results = self.query.sort_results(self.db.clusters_mut(), max).to_vec();
        for result in results {
            if result.score <= threshold {
                break;
            }
            if let Some(object) = self.db.object_for_cluster(result.key) {
                if !candidates.contains(&object) {
                    candidates.push(object);
                }
            }
        }
        candidates
    }

    /// Sets the object query to the words of `frame`: each track's best
    /// clusters when clusters are loaded, raw visual words otherwise.
    pub fn update_query_with_frame(&mut self, frame: FrameId) {
        let points = self.tracker.store().points_in(frame);
        let words: Histogram = if self.tracker.clusters().is_none() {
            let store = self.tracker.store();
            points
                .iter()
                .filter_map(|k| store.point(*k))
                .map(|p| p.data.word)
                .filter(|w| *w != 0)
                .collect()
        } else {
            let ratio = self.tracker.settings().track_query_ratio;
            let mut words = Vec::new();
            for k in points {
                let tracked = self
                    .tracker
                    .store()
                    .point(k)
                    .is_some_and(|p| p.track().is_some() && p.data.cid != 0);
                if tracked {
                    words.extend(self.tracker.track_results(k, ratio).iter().map(|r| r.id));
                }
            }
            words.into_iter().collect()
        };
        self.query.set(self.db.clusters_mut(), &words);
    }

    /// Matches between the points of `frame` and the keypoints of
    /// `object`, with the number carried over from the previous frame.
    fn get_correspondences(&mut self, frame: FrameId, object: ObjectId) -> (Vec<Correspondence>, usize) {
        let mut correspondences = Vec::new();
        let mut nb_tracked = 0;
        let use_clusters = self.tracker.clusters().is_some();
        let ratio = self.tracker.settings().correspondence_ratio;

        for k in self.tracker.store().points_in(frame) {
            let store = self.tracker.store();
            let Some(p) = store.point(k) else {
                continue;
            };
            let position = (p.u, p.v);
            let prev = p.prev().and_then(|id| store.point(id));
            if let Some(prev) = prev.filter(|q| q.data.object.is_some()) {
                if prev.data.object == Some(object) {
                    if let Some(keypoint) = prev.data.object_keypoint {
                        correspondences.push(Correspondence {
                            point: k,
                            object: keypoint,
                            frame: position,
                            weight: TRACKED_WEIGHT,
                        });
                        nb_tracked += 1;
                    }
                }
                continue;
            }
            if p.data.object.is_some() || !store.track_is_longer(k, 2) {
                continue;
            }

            let Some(target) = self.db.object(object) else {
                return (Vec::new(), 0);
            };
            if !use_clusters {
                if p.data.word == 0 {
                    continue;
                }
                correspondences.extend(target.find_keypoints(p.data.word).iter().map(|kp| {
                    Correspondence {
                        point: k,
                        object: (kp.u, kp.v),
                        frame: position,
                        weight: WORD_WEIGHT,
                    }
                }));
                continue;
            }

            if p.track().is_none() || p.data.cid == 0 {
                continue;
            }
            for result in self.tracker.track_results(k, ratio) {
                let keypoints = target.find_keypoints(result.id);
                if keypoints.is_empty() {
                    continue;
                }
                let clusters = self.db.clusters();
                let idf = if clusters.clusters_containing(result.id) == 0 {
                    1.0
                } else {
                    clusters.idf(result.id)
                };
                correspondences.extend(keypoints.iter().map(|kp| Correspondence {
                    point: k,
                    object: (kp.u, kp.v),
                    frame: position,
                    weight: result.score * idf,
                }));
            }
        }
        (correspondences, nb_tracked)
    }

    /// Fits the object's geometric model to the matches. On success the
    /// inlier points are tagged with the object.
    fn verify(
        &mut self,
        object: ObjectId,
        mut correspondences: Vec<Correspondence>,
        nb_tracked: usize,
    ) -> Option<ObjectInstance> {
        let flags = self.db.object(object)?.flags();
        if !flags.needs_verification() || correspondences.len() < MIN_CORRESPONDENCES {
            return None;
        }
        correspondences.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        let src: Vec<Point> = correspondences.iter().map(|c| c.object).collect();
        let dst: Vec<Point> = correspondences.iter().map(|c| c.frame).collect();

        let settings = self.tracker.settings();
        let few_tracked = nb_tracked < MIN_CORRESPONDENCES;
        let params = RansacParams {
            max_iterations: if few_tracked { 1000 } else { 200 },
            threshold: settings.verify_distance,
            stop_support: if few_tracked { 50 } else { (nb_tracked + 2).max(20) },
        };
        let homography_min = settings.homography_inlier_threshold;
        let fmat_min = settings.fmat_inlier_threshold;
        let (fit, inverse) = if flags.homography() {
            let fit = ransac_homography(&src, &dst, &params, &mut self.rng)?;
            if fit.support() < homography_min || !homography_is_plausible(&fit.model) {
                return None;
            }
            let fit = refine_homography(&src, &dst, fit, params.threshold);
            if fit.support() < homography_min || !homography_is_plausible(&fit.model) {
                return None;
            }
            let inverse = homography_inverse(&fit.model)?;
            (fit, inverse)
        } else {
            let fit = ransac_fundamental(&src, &dst, &params, &mut self.rng)?;
            if fit.support() < fmat_min {
                return None;
            }
            let inverse = fit.model.transpose();
            (fit, inverse)
        };

        let ModelFit { model, inliers } = fit;
        let mut support = 0;
        for i in inliers {
            let c = &correspondences[i];
            let Some(point) = self.tracker.point_mut(c.point) else {
                continue;
            };
            if point.object.is_none() {
                point.object = Some(object);
                point.object_keypoint = Some(c.object);
                support += 1;
            }
        }
        Some(ObjectInstance {
            object,
            support,
            transform: model,
            inverse,
        })
    }

    /// Creates a new object from the points of `frame`, keeping `image`
    /// as its representative view, and indexes it.
    pub fn create_object_from_frame(
        &mut self,
        image: &Frame,
        frame: FrameId,
        comment: &str,
        flags: VerifyFlags,
    ) -> Result<ObjectId, VisualDatabaseError> {
        let store = self.tracker.store();
        let keypoints: Vec<DbKeypoint> = store
            .points_in(frame)
            .into_iter()
            .filter_map(|k| store.point(k))
            .map(|p| DbKeypoint {
                word: self.tracker.object_word(&p.data),
                image: None,
                u: p.u,
                v: p.v,
                scale: p.data.scale,
                orientation: p.data.orientation,
                descriptor: p.data.descriptor.clone(),
            })
            .collect();
        let id = self.db.create_object(comment, flags)?;
        let count = self.db.add_frame(id, image, keypoints)?;
        self.db.add_to_index(id)?;
        log::info!("Created object {id} from {count} keypoints");
        Ok(id)
    }

    /// Deletes every object verified on `frame` from the database and
    /// forgets the frame's object tags. Returns how many were removed.
    pub fn remove_visible_objects_from_db(&mut self, frame: FrameId) -> Result<usize, VisualDatabaseError> {
        let instances = match self.tracker.frame_info_mut(frame) {
            Some(info) => std::mem::take(&mut info.instances),
            None => return Ok(0),
        };
        let mut removed = 0;
        for instance in &instances {
            if self.db.remove_object(instance.object)? {
                removed += 1;
            }
        }
        for k in self.tracker.store().points_in(frame) {
            if let Some(point) = self.tracker.point_mut(k) {
                point.object = None;
                point.object_keypoint = None;
            }
        }
        Ok(removed)
    }

    /// Adds untagged points of `frame` to the verified object they lie
    /// on. A point qualifies when its track is long enough and every
    /// position along it back-projects to the same object location.
    /// Returns the number of keypoints learned.
    pub fn incremental_learning(&mut self, frame: FrameId) -> Result<usize, VisualDatabaseError> {
        if self.instances(frame).is_empty() {
            return Ok(0);
        }
        let mut learned = Vec::new();
        for k in self.tracker.store().points_in(frame) {
            if let Some(found) = self.learnable(frame, k) {
                learned.push(found);
            }
        }
        if learned.is_empty() {
            return Ok(0);
        }

        let (points, batch): (Vec<_>, Vec<_>) = learned
            .into_iter()
            .map(|(k, object, keypoint)| ((k, object, (keypoint.u, keypoint.v)), (object, keypoint)))
            .unzip();
        let stored = self.db.add_keypoints(batch)?;
        let mut count = 0;
        for ((k, object, position), kept) in points.into_iter().zip(stored) {
            if !kept {
                continue;
            }
            if let Some(point) = self.tracker.point_mut(k) {
                point.object = Some(object);
                point.object_keypoint = Some(position);
            }
            count += 1;
        }
        if count > 0 {
            log::debug!("Learned {count} keypoints");
        }
        Ok(count)
    }

    fn learnable(&mut self, frame: FrameId, k: KeypointId) -> Option<(KeypointId, ObjectId, DbKeypoint)> {
        let settings = self.tracker.settings();
        let (min_length, radius, max_points) = (
            settings.learn_track_length,
            settings.learn_radius,
            settings.learn_max_points,
        );
        let store = self.tracker.store();
        let p = store.point(k)?;
        let word = self.tracker.object_word(&p.data);
        if p.data.object.is_some() || p.data.object_keypoint.is_some() || word == 0 {
            return None;
        }
        if store.track_length(k) < min_length {
            return None;
        }

        let r2 = radius * radius;
        let object = store
            .search(frame, p.u, p.v, radius)
            .into_iter()
            .filter_map(|n| store.point(n))
            .filter_map(|n| {
                let d2 = (n.u - p.u).powi(2) + (n.v - p.v).powi(2);
                n.data.object.filter(|_| d2 < r2).map(|o| (o, d2))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(o, _)| o)?;

        let target = self.db.object(object)?;
        if !target.flags().homography() {
            return None;
        }
        let fill = target.keypoint_count() as f32 / max_points.max(1) as f32;
        if fill > self.rng.gen::<f32>() {
            return None;
        }

        let mut positions = Vec::new();
        for c in store.chain(k) {
            let q = store.point(c)?;
            let instance = self.tracker.frame_info(q.frame())?.find_instance(object)?;
            positions.push(((q.u, q.v), instance.transform, instance.inverse));
        }
        let n = positions.len() as f32;
        let (su, sv) = positions.iter().fold((0.0, 0.0), |(su, sv), (at, _, inverse)| {
            let back = transform_point(inverse, *at);
            (su + back.0, sv + back.1)
        });
        let backprojected = (su / n, sv / n);
        let consistent = positions
            .iter()
            .all(|(at, transform, _)| reprojection_error(transform, backprojected, *at) <= LEARN_REPROJECTION);
        if !consistent {
            return None;
        }

        Some((
            k,
            object,
            DbKeypoint {
                word,
                image: None,
                u: backprojected.0,
                v: backprojected.1,
                scale: p.data.scale,
                orientation: p.data.orientation,
                descriptor: p.data.descriptor.clone(),
            },
        ))
    }
}
