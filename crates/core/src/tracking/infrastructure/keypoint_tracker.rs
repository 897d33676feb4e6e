//! Frame-to-frame keypoint tracking with per-track cluster retrieval.
//!
//! Every new frame is detected, quantized into visual words and appended
//! to a [`TrackStore`]. Points of the previous frame are then matched to
//! the new ones by descriptor distance around a constant-velocity
//! prediction. Each track carries an [`IncrementalQuery`] fed by the
//! words of its points, so a point always knows which cluster its track
//! currently resembles most.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::pipeline::pipeline_logger::{NullPipelineLogger, PipelineLogger};
use crate::quantization::kmeans_tree::{squared_distance, QuantizationTree};
use crate::quantization::tree_file::{load_tree, TreeFileError};
use crate::quantization::tree_tables::{load_tree_tables, TreeTableError};
use crate::retrieval::cluster_collection::ClusterCollection;
use crate::retrieval::cluster_file::{load_clusters, ClusterFileError};
use crate::retrieval::cluster_tables::{load_cluster_table, ClusterTableError};
use crate::retrieval::histogram::Histogram;
use crate::retrieval::incremental_query::{IncrementalQuery, QueryResult};
use crate::retrieval::visual_database::ObjectId;
use crate::shared::frame::Frame;
use crate::shared::settings::TrackerSettings;
use crate::storage::domain::table_store::TableStore;
use crate::tracking::domain::keypoint_detector::{DetectedKeypoint, KeypointDetector};
use crate::tracking::infrastructure::object_tracker::ObjectInstance;
use crate::tracks::track_store::{FrameId, KeypointId, TrackHooks, TrackId, TrackStore};

/// A detected keypoint together with its visual word (0 when no tree is loaded).
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedKeypoint {
    pub keypoint: DetectedKeypoint,
    pub word: u32,
}

/// Per-point data kept in the track store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackedPoint {
    pub scale: f32,
    pub orientation: f32,
    pub descriptor: Vec<f32>,
    pub word: u32,
    /// Dense id of the cluster the point's track matches best, or 0.
    pub cid: u32,
    pub cscore: f64,
    /// Object this point was verified on, if any.
    pub object: Option<ObjectId>,
    /// Position of the matching object keypoint, in object coordinates.
    pub object_keypoint: Option<(f32, f32)>,
}

impl TrackedPoint {
    fn from_quantized(q: QuantizedKeypoint) -> Self {
        Self {
            scale: q.keypoint.scale,
            orientation: q.keypoint.orientation,
            descriptor: q.keypoint.descriptor,
            word: q.word,
            ..Self::default()
        }
    }
}

/// Per-frame data kept in the track store.
#[derive(Clone, Debug, Default)]
pub struct FrameInfo {
    pub index: usize,
    pub timestamp: i64,
    /// Objects verified on this frame.
    pub instances: Vec<ObjectInstance>,
}

impl FrameInfo {
    pub fn find_instance(&self, object: ObjectId) -> Option<&ObjectInstance> {
        self.instances.iter().find(|i| i.object == object)
    }
}

pub type TrackQuery = IncrementalQuery;

pub type KeypointStore = TrackStore<TrackedPoint, FrameInfo, TrackQuery>;

/// Feeds point words into the query of the track they join or leave.
struct QueryHooks<'a> {
    clusters: Option<&'a mut ClusterCollection>,
    ratio: f64,
}

impl TrackHooks<TrackedPoint, TrackQuery> for QueryHooks<'_> {
    fn point_added(&mut self, query: &mut TrackQuery, point: &mut TrackedPoint) {
        if point.word == 0 {
            point.cid = 0;
            return;
        }
        let Some(db) = self.clusters.as_deref_mut() else {
            return;
        };
        query.modify(db, point.word, 1);
        match query.sort_results_min_ratio(db, self.ratio).first() {
            Some(best) => {
                point.cid = best.id;
                point.cscore = best.score;
            }
            None => point.cid = 0,
        }
    }

    fn point_removed(&mut self, query: &mut TrackQuery, point: &mut TrackedPoint) {
        if point.word == 0 {
            return;
        }
        if let Some(db) = self.clusters.as_deref_mut() {
            query.modify(db, point.word, -1);
        }
    }
}

/// Quantizes `keypoints` through `tree`, or tags them all with word 0.
///
/// # Panics
/// If a descriptor's dimension differs from the tree's.
pub fn quantize_keypoints(
    tree: Option<&QuantizationTree>,
    keypoints: Vec<DetectedKeypoint>,
) -> Vec<QuantizedKeypoint> {
    keypoints
        .into_iter()
        .map(|keypoint| {
            let word = tree.map_or(0, |t| t.get_id(&keypoint.descriptor));
            QuantizedKeypoint { keypoint, word }
        })
        .collect()
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct KeypointTracker {
    store: KeypointStore,
    tree: Option<Arc<QuantizationTree>>,
    clusters: Option<ClusterCollection>,
    settings: TrackerSettings,
    logger: Box<dyn PipelineLogger>,
}

impl KeypointTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            store: TrackStore::new(settings.bucket_bits),
            tree: None,
            clusters: None,
            settings,
            logger: Box::new(NullPipelineLogger),
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn PipelineLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn store(&self) -> &KeypointStore {
        &self.store
    }

    pub fn logger_mut(&mut self) -> &mut dyn PipelineLogger {
        self.logger.as_mut()
    }

    pub fn tree(&self) -> Option<&Arc<QuantizationTree>> {
        self.tree.as_ref()
    }

    pub fn clusters(&self) -> Option<&ClusterCollection> {
        self.clusters.as_ref()
    }

    /// Word under which a point is filed in object histograms: its cluster
    /// id once clusters are loaded, its raw visual word otherwise.
    pub fn object_word(&self, point: &TrackedPoint) -> u32 {
        if self.clusters.is_some() {
            point.cid
        } else {
            point.word
        }
    }

    pub fn set_tree(&mut self, tree: Arc<QuantizationTree>) {
        self.tree = Some(tree);
    }

    pub fn load_tree_file(
        &mut self,
        path: &Path,
        nb_branches: usize,
        descriptor_size: usize,
    ) -> Result<(), TreeFileError> {
        let tree = load_tree(path, nb_branches, descriptor_size)?;
        self.set_tree(Arc::new(tree));
        Ok(())
    }

    pub fn load_tree_tables(
        &mut self,
        store: &dyn TableStore,
        nb_branches: usize,
        descriptor_size: usize,
    ) -> Result<(), TreeTableError> {
        let tree = load_tree_tables(store, nb_branches, descriptor_size)?;
        self.set_tree(Arc::new(tree));
        Ok(())
    }

    /// Replaces the cluster collection and replays every track query on it.
    pub fn set_clusters(&mut self, mut clusters: ClusterCollection) {
        clusters.set_query_rules(self.settings.query_rules);
        clusters.compute_best_clusters();
        self.clusters = Some(clusters);
        self.rebuild_track_queries();
    }

    pub fn load_clusters_file(&mut self, path: &Path) -> Result<usize, ClusterFileError> {
        let mut clusters = ClusterCollection::new(self.settings.query_rules);
        let loaded = load_clusters(&mut clusters, path)?;
        self.set_clusters(clusters);
        Ok(loaded)
    }

    pub fn load_clusters_table(&mut self, store: &dyn TableStore) -> Result<usize, ClusterTableError> {
        let mut clusters = ClusterCollection::new(self.settings.query_rules);
        let loaded = load_cluster_table(&mut clusters, store)?;
        self.set_clusters(clusters);
        Ok(loaded)
    }

    /// Recomputes every track query from the words of its points and
    /// refreshes the points' best cluster from the result.
    pub fn rebuild_track_queries(&mut self) {
        let ratio = self.settings.track_query_ratio;
        let tracks: Vec<(TrackId, KeypointId)> =
            self.store.tracks().map(|(id, t)| (id, t.head())).collect();
        for (track, head) in tracks {
            let points = self.store.chain(head);
            let words: Histogram = points
                .iter()
                .filter_map(|&k| self.store.point(k).map(|p| p.data.word))
                .filter(|w| *w != 0)
                .collect();
            let Some(t) = self.store.track_mut(track) else {
                continue;
            };
            let best = match self.clusters.as_mut() {
                Some(db) => {
                    t.data.set(db, &words);
                    t.data
                        .sort_results_min_ratio(db, ratio)
                        .first()
                        .map(|r| (r.id, r.score))
                }
                None => {
                    t.data.clear();
                    None
                }
            };
            let (cid, cscore) = best.unwrap_or((0, 0.0));
            for k in points {
                if let Some(p) = self.store.point_mut(k) {
                    p.data.cid = if p.data.word == 0 { 0 } else { cid };
                    p.data.cscore = cscore;
                }
            }
        }
    }

    pub fn quantize(&self, keypoints: Vec<DetectedKeypoint>) -> Vec<QuantizedKeypoint> {
        quantize_keypoints(self.tree.as_deref(), keypoints)
    }

    /// Detects, quantizes and tracks one frame. Returns the new frame's id.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        detector: &mut dyn KeypointDetector,
    ) -> Result<FrameId, Box<dyn std::error::Error>> {
        let start = Instant::now();
        let detected = detector.detect(frame)?;
        self.logger.timing("detect", elapsed_ms(start));

        let start = Instant::now();
        let quantized = self.quantize(detected);
        self.logger.timing("quantize", elapsed_ms(start));

        Ok(self.ingest(
            frame.index(),
            frame.timestamp(),
            frame.width(),
            frame.height(),
            quantized,
        ))
    }

    /// Appends an already quantized frame and links it to the previous one.
    pub fn ingest(
        &mut self,
        index: usize,
        timestamp: i64,
        width: u32,
        height: u32,
        keypoints: Vec<QuantizedKeypoint>,
    ) -> FrameId {
        let start = Instant::now();
        let mut hooks = QueryHooks {
            clusters: self.clusters.as_mut(),
            ratio: self.settings.track_query_ratio,
        };
        self.store.prune_history(self.settings.history_depth, &mut hooks);
        let frame = self.store.add_frame(
            width,
            height,
            FrameInfo {
                index,
                timestamp,
                instances: Vec::new(),
            },
        );
        self.logger.metric("keypoints", keypoints.len() as f64);
        for q in keypoints {
            let (u, v) = (q.keypoint.u, q.keypoint.v);
            self.store.add_point(frame, u, v, TrackedPoint::from_quantized(q));
        }
        if let Some(previous) = self.store.get_nth_frame(1) {
            let matched = link_frames(&mut self.store, &self.settings, &mut hooks, frame, previous);
            self.logger.metric("matches", matched as f64);
        }
        self.logger.timing("track", elapsed_ms(start));
        frame
    }

    /// Links points of `previous` to points of `new`. A candidate claimed
    /// twice is ambiguous and loses its first match too. Returns the number
    /// of links made, before cancellations.
    pub fn track_frames(&mut self, new: FrameId, previous: FrameId) -> usize {
        let mut hooks = QueryHooks {
            clusters: self.clusters.as_mut(),
            ratio: self.settings.track_query_ratio,
        };
        link_frames(&mut self.store, &self.settings, &mut hooks, new, previous)
    }

    /// Drops tracks that ended `history_depth` frames ago.
    pub fn prune_history(&mut self) {
        let mut hooks = QueryHooks {
            clusters: self.clusters.as_mut(),
            ratio: self.settings.track_query_ratio,
        };
        self.store.prune_history(self.settings.history_depth, &mut hooks);
    }

    pub fn clear(&mut self) {
        let mut hooks = QueryHooks {
            clusters: self.clusters.as_mut(),
            ratio: self.settings.track_query_ratio,
        };
        self.store.clear(&mut hooks);
    }

    pub fn latest_frame(&self) -> Option<FrameId> {
        self.store.get_nth_frame(0)
    }

    pub fn previous_frame(&self) -> Option<FrameId> {
        self.store.get_nth_frame(1)
    }

    pub fn point_mut(&mut self, id: KeypointId) -> Option<&mut TrackedPoint> {
        self.store.point_mut(id).map(|p| &mut p.data)
    }

    pub fn frame_info(&self, id: FrameId) -> Option<&FrameInfo> {
        self.store.frame(id).map(|f| &f.data)
    }

    pub fn frame_info_mut(&mut self, id: FrameId) -> Option<&mut FrameInfo> {
        self.store.frame_mut(id).map(|f| &mut f.data)
    }

    /// Clusters the track of `point` resembles, at least `ratio` times the
    /// best score. Empty when no clusters are loaded or the point has no track.
    pub fn track_results(&mut self, point: KeypointId, ratio: f64) -> Vec<QueryResult> {
        let Some(db) = self.clusters.as_mut() else {
            return Vec::new();
        };
        let Some(track) = self.store.point(point).and_then(|p| p.track()) else {
            return Vec::new();
        };
        match self.store.track_mut(track) {
            Some(t) => t.data.sort_results_min_ratio(db, ratio).to_vec(),
            None => Vec::new(),
        }
    }
}

/// Best candidate of `frame` near the motion prediction for `point`.
fn best_match(
    store: &KeypointStore,
    settings: &TrackerSettings,
    point: KeypointId,
    frame: FrameId,
) -> Option<KeypointId> {
    let p = store.point(point)?;
    let (mut pu, mut pv) = (p.u, p.v);
    if let Some(prev) = p.prev().and_then(|k| store.point(k)) {
        pu = 2.0 * p.u - prev.u;
        pv = 2.0 * p.v - prev.v;
    }
    let mut best = None;
    let mut best_d2 = f32::INFINITY;
    for candidate in store.search(frame, pu, pv, settings.max_motion) {
        let Some(c) = store.point(candidate) else {
            continue;
        };
        let d2 = squared_distance(&p.data.descriptor, &c.data.descriptor);
        if d2 < best_d2 {
            best_d2 = d2;
            best = Some(candidate);
        }
    }
    match settings.max_descriptor_distance {
        Some(limit) if best_d2 > limit => None,
        _ => best,
    }
}

fn link_frames(
    store: &mut KeypointStore,
    settings: &TrackerSettings,
    hooks: &mut QueryHooks<'_>,
    new: FrameId,
    previous: FrameId,
) -> usize {
    let mut matched = 0;
    for point in store.points_in(previous) {
        if store.point(point).map_or(true, |p| p.next().is_some()) {
            continue;
        }
        let Some(candidate) = best_match(store, settings, point, new) else {
            continue;
        };
        if store.point(candidate).and_then(|c| c.prev()).is_some() {
            store.unset_match(candidate, hooks);
        } else {
            store.set_match(point, candidate, hooks);
            matched += 1;
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::kmeans_tree::TreeNode;
    use crate::retrieval::query_rules::QueryRules;
    use rstest::rstest;

    /// Emits a scripted list of keypoints per call.
    struct StubDetector {
        frames: Vec<Vec<DetectedKeypoint>>,
        calls: usize,
    }

    impl StubDetector {
        fn new(frames: Vec<Vec<DetectedKeypoint>>) -> Self {
            Self { frames, calls: 0 }
        }
    }

    impl KeypointDetector for StubDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedKeypoint>, Box<dyn std::error::Error>> {
            let out = self.frames.get(self.calls).cloned().ok_or("no more frames")?;
            self.calls += 1;
            Ok(out)
        }
    }

    fn kp(u: f32, v: f32, d: f32) -> DetectedKeypoint {
        DetectedKeypoint::new(u, v, vec![d, 0.0])
    }

    /// Two leaves splitting the first descriptor coordinate at 5.
    fn two_word_tree() -> QuantizationTree {
        let mut root = TreeNode::internal(vec![5.0, 0.0], 2);
        root.children_mut()[0] = Some(Box::new(TreeNode::leaf(1, vec![0.0, 0.0])));
        root.children_mut()[1] = Some(Box::new(TreeNode::leaf(2, vec![10.0, 0.0])));
        QuantizationTree::new(root, 2, 2)
    }

    fn tracker() -> KeypointTracker {
        KeypointTracker::new(TrackerSettings::default())
    }

    fn run(tracker: &mut KeypointTracker, frames: Vec<Vec<DetectedKeypoint>>) -> Vec<FrameId> {
        let n = frames.len();
        let mut detector = StubDetector::new(frames);
        (0..n)
            .map(|i| {
                tracker
                    .process_frame(&Frame::gray(64, 64, 0, i), &mut detector)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_points_are_linked_by_descriptor() {
        let mut t = tracker();
        let ids = run(
            &mut t,
            vec![
                vec![kp(10.0, 10.0, 1.0), kp(12.0, 10.0, 9.0)],
                vec![kp(13.0, 11.0, 1.1), kp(11.0, 11.0, 8.9)],
            ],
        );
        let store = t.store();
        assert_eq!(store.track_count(), 2);
        for k in store.points_in(ids[1]) {
            let p = store.point(k).unwrap();
            let prev = store.point(p.prev().unwrap()).unwrap();
            assert!((p.data.descriptor[0] - prev.data.descriptor[0]).abs() < 0.5);
        }
    }

    #[test]
    fn test_prediction_follows_motion() {
        let mut t = KeypointTracker::new(TrackerSettings {
            max_motion: 5.0,
            bucket_bits: 1,
            ..TrackerSettings::default()
        });
        let ids = run(
            &mut t,
            vec![
                vec![kp(10.0, 10.0, 1.0)],
                vec![kp(14.0, 10.0, 1.0)],
                // Out of reach from the last position, close to the prediction.
                vec![kp(22.0, 10.0, 1.0)],
            ],
        );
        let head = t.store().points_in(ids[2])[0];
        assert_eq!(t.store().track_length(head), 2);
    }

    #[test]
    fn test_doubly_claimed_candidate_is_unlinked() {
        let mut t = tracker();
        let ids = run(
            &mut t,
            vec![
                vec![kp(10.0, 10.0, 1.0), kp(14.0, 10.0, 1.0)],
                vec![kp(12.0, 10.0, 1.0)],
            ],
        );
        let only = t.store().points_in(ids[1])[0];
        assert!(t.store().point(only).unwrap().prev().is_none());
        for k in t.store().points_in(ids[0]) {
            assert!(t.store().point(k).unwrap().next().is_none());
        }
    }

    #[rstest]
    #[case::accepts_close(Some(1.0), 1)]
    #[case::rejects_far(Some(0.01), 0)]
    #[case::nearest_wins(None, 1)]
    fn test_descriptor_acceptance(#[case] limit: Option<f32>, #[case] tracks: usize) {
        let mut t = KeypointTracker::new(TrackerSettings {
            max_descriptor_distance: limit,
            ..TrackerSettings::default()
        });
        run(&mut t, vec![vec![kp(10.0, 10.0, 1.0)], vec![kp(11.0, 10.0, 1.5)]]);
        assert_eq!(t.store().track_count(), tracks);
    }

    #[test]
    fn test_quantize_without_tree_gives_word_zero() {
        let t = tracker();
        let q = t.quantize(vec![kp(0.0, 0.0, 7.0)]);
        assert_eq!(q[0].word, 0);
    }

    #[test]
    fn test_track_query_tags_points_with_best_cluster() {
        let mut t = tracker();
        t.set_tree(Arc::new(two_word_tree()));
        let mut clusters = ClusterCollection::new(QueryRules::NORMALIZED_FREQ);
        clusters.add_cluster(Histogram::from_counts([(1, 5)]));
        clusters.add_cluster(Histogram::from_counts([(2, 5)]));
        t.set_clusters(clusters);

        let ids = run(
            &mut t,
            vec![
                vec![kp(10.0, 10.0, 1.0), kp(40.0, 40.0, 9.0)],
                vec![kp(11.0, 10.0, 1.0), kp(41.0, 40.0, 9.0)],
            ],
        );
        let mut cids: Vec<(u32, u32)> = t
            .store()
            .points_in(ids[1])
            .into_iter()
            .map(|k| {
                let p = &t.store().point(k).unwrap().data;
                (p.word, p.cid)
            })
            .collect();
        cids.sort();
        assert_eq!(cids, vec![(1, 1), (2, 2)]);

        let head = t.store().points_in(ids[1])[0];
        let results = t.track_results(head, 0.7);
        assert_eq!(results.len(), 1);
        approx::assert_relative_eq!(results[0].score, 1.0);
    }

    #[test]
    fn test_loading_clusters_replays_existing_tracks() {
        let mut t = tracker();
        t.set_tree(Arc::new(two_word_tree()));
        let ids = run(&mut t, vec![vec![kp(10.0, 10.0, 9.0)], vec![kp(10.0, 10.0, 9.0)]]);
        let head = t.store().points_in(ids[1])[0];
        assert!(t.track_results(head, 0.5).is_empty());

        let mut clusters = ClusterCollection::default();
        clusters.add_cluster(Histogram::from_counts([(1, 1)]));
        clusters.add_cluster(Histogram::from_counts([(2, 3)]));
        t.set_clusters(clusters);
        let results = t.track_results(head, 0.5);
        assert_eq!(results.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_replacing_clusters_refreshes_point_clusters() {
        let mut t = tracker();
        t.set_tree(Arc::new(two_word_tree()));
        let mut clusters = ClusterCollection::default();
        clusters.add_cluster(Histogram::from_counts([(1, 5)]));
        clusters.add_cluster(Histogram::from_counts([(2, 5)]));
        t.set_clusters(clusters);
        let ids = run(
            &mut t,
            vec![
                vec![kp(10.0, 10.0, 1.0), kp(40.0, 40.0, 9.0)],
                vec![kp(11.0, 10.0, 1.0), kp(41.0, 40.0, 9.0)],
            ],
        );

        let mut swapped = ClusterCollection::default();
        swapped.add_cluster(Histogram::from_counts([(2, 4)]));
        swapped.add_cluster(Histogram::from_counts([(3, 4)]));
        t.set_clusters(swapped);

        let store = t.store();
        for frame in ids {
            for k in store.points_in(frame) {
                let p = &store.point(k).unwrap().data;
                match p.word {
                    1 => assert_eq!((p.cid, p.cscore), (0, 0.0)),
                    2 => {
                        assert_eq!(p.cid, 1);
                        approx::assert_relative_eq!(p.cscore, 1.0);
                    }
                    w => panic!("unexpected word {w}"),
                }
            }
        }
    }

    #[test]
    fn test_history_is_pruned() {
        let mut t = KeypointTracker::new(TrackerSettings {
            history_depth: 2,
            ..TrackerSettings::default()
        });
        // A point seen once, then a separate one that keeps being tracked.
        run(
            &mut t,
            vec![
                vec![kp(50.0, 50.0, 5.0), kp(10.0, 10.0, 1.0)],
                vec![kp(10.0, 10.0, 1.0)],
                vec![kp(10.0, 10.0, 1.0)],
                vec![kp(10.0, 10.0, 1.0)],
            ],
        );
        assert_eq!(t.store().point_count(), 4);
        assert_eq!(t.store().frame_count(), 4);
    }

    #[test]
    fn test_clear_empties_store() {
        let mut t = tracker();
        run(&mut t, vec![vec![kp(1.0, 1.0, 1.0)], vec![kp(1.0, 1.0, 1.0)]]);
        t.clear();
        assert_eq!(t.store().point_count(), 0);
        assert_eq!(t.store().frame_count(), 0);
        assert!(t.latest_frame().is_none());
    }

    #[test]
    fn test_detector_error_propagates() {
        let mut t = tracker();
        let mut detector = StubDetector::new(Vec::new());
        assert!(t.process_frame(&Frame::gray(8, 8, 0, 0), &mut detector).is_err());
        assert_eq!(t.store().frame_count(), 0);
    }
}
