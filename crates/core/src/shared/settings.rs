use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::retrieval::query_rules::QueryRules;
use crate::shared::constants::{
    CORRESPONDENCE_RATIO, DEFAULT_BUCKET_BITS, DEFAULT_HISTORY_DEPTH, DEFAULT_MAX_MOTION,
    TRACK_QUERY_RATIO,
};

/// Tunables for the keypoint and object trackers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub max_motion: f32,
    pub bucket_bits: u32,
    /// Squared descriptor distance above which a frame-to-frame match is
    /// refused. `None` accepts the nearest candidate unconditionally.
    pub max_descriptor_distance: Option<f32>,
    pub history_depth: usize,
    pub query_rules: QueryRules,
    pub track_query_ratio: f64,
    pub correspondence_ratio: f64,
    pub score_threshold: f64,
    pub max_results: usize,
    pub homography_inlier_threshold: usize,
    pub fmat_inlier_threshold: usize,
    pub verify_distance: f32,
    pub incremental_learning: bool,
    pub learn_track_length: usize,
    pub learn_radius: f32,
    pub learn_max_points: usize,
    pub seed: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_motion: DEFAULT_MAX_MOTION,
            bucket_bits: DEFAULT_BUCKET_BITS,
            max_descriptor_distance: None,
            history_depth: DEFAULT_HISTORY_DEPTH,
            query_rules: QueryRules::NORMALIZED_FREQ,
            track_query_ratio: TRACK_QUERY_RATIO,
            correspondence_ratio: CORRESPONDENCE_RATIO,
            score_threshold: 0.0,
            max_results: 3,
            homography_inlier_threshold: 12,
            fmat_inlier_threshold: 20,
            verify_distance: 3.0,
            incremental_learning: true,
            learn_track_length: 5,
            learn_radius: 30.0,
            learn_max_points: 3000,
            seed: 0,
        }
    }
}

impl TrackerSettings {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("vistrack").join("tracker.json"))
    }

    /// Settings from the platform config dir, or defaults when absent or unreadable.
    pub fn load() -> Self {
        Self::config_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    pub fn save(&self) -> io::Result<()> {
        match Self::config_path() {
            Some(path) => self.save_to(&path),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no platform config directory",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tracker_tuning() {
        let s = TrackerSettings::default();
        assert_eq!(s.max_motion, 32.0);
        assert_eq!(s.bucket_bits, 4);
        assert_eq!(s.max_descriptor_distance, None);
        assert_eq!(s.query_rules, QueryRules::NORMALIZED_FREQ);
        assert_eq!(s.max_results, 3);
        assert_eq!(s.homography_inlier_threshold, 12);
        assert_eq!(s.fmat_inlier_threshold, 20);
        assert!(s.incremental_learning);
        assert_eq!(
            (s.learn_track_length, s.learn_radius, s.learn_max_points),
            (5, 30.0, 3000)
        );
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracker.json");
        let settings = TrackerSettings {
            max_motion: 12.5,
            query_rules: QueryRules::IDF_NORMALIZED,
            incremental_learning: false,
            seed: 99,
            ..TrackerSettings::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = TrackerSettings::load_from(&path).unwrap();
        assert_eq!(loaded.max_motion, 12.5);
        assert_eq!(loaded.query_rules, QueryRules::IDF_NORMALIZED);
        assert!(!loaded.incremental_learning);
        assert_eq!(loaded.seed, 99);
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{ "max_results": 7 }"#).unwrap();

        let loaded = TrackerSettings::load_from(&path).unwrap();
        assert_eq!(loaded.max_results, 7);
        assert_eq!(loaded.history_depth, DEFAULT_HISTORY_DEPTH);
    }

    #[test]
    fn test_malformed_json_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "not json").unwrap();

        let err = TrackerSettings::load_from(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
