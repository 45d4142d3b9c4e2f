//! Frame-to-frame association of face regions with live tracks.
//!
//! Greedy nearest-centroid matching: every (track, region) pair that satisfies
//! the association rule is a candidate, candidates are taken in order of
//! increasing centroid distance, and each track and region is used at most once.

use crate::config::TrackingConfig;
use crate::types::FaceRegion;

#[derive(Debug, Default, PartialEq)]
pub struct Association {
    /// `(track index, region index)` pairs.
    pub matched: Vec<(usize, usize)>,
    /// Tracks that received no region this frame.
    pub missed: Vec<usize>,
    /// Regions that overlap no existing track and should spawn one.
    pub spawn: Vec<usize>,
}

fn associable(track: &FaceRegion, region: &FaceRegion, rule: &TrackingConfig) -> bool {
    track.iou(region) >= rule.min_iou
        || track.centroid_distance(region) <= rule.max_centroid_distance
}

pub fn associate(
    tracks: &[FaceRegion],
    regions: &[FaceRegion],
    rule: &TrackingConfig,
) -> Association {
    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for (t, track) in tracks.iter().enumerate() {
        for (r, region) in regions.iter().enumerate() {
            if associable(track, region, rule) {
                candidates.push((track.centroid_distance(region), t, r));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut track_used = vec![false; tracks.len()];
    let mut region_used = vec![false; regions.len()];
    let mut out = Association::default();
    for (_, t, r) in candidates {
        if track_used[t] || region_used[r] {
            continue;
        }
        track_used[t] = true;
        region_used[r] = true;
        out.matched.push((t, r));
    }

    out.missed = (0..tracks.len()).filter(|t| !track_used[*t]).collect();
    // A leftover region overlapping a track that was claimed by a closer
    // region is a duplicate detection of that face, not a new face.
    out.spawn = (0..regions.len())
        .filter(|r| !region_used[*r])
        .filter(|r| !tracks.iter().any(|t| associable(t, &regions[*r], rule)))
        .collect();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> TrackingConfig {
        TrackingConfig::default()
    }

    #[test]
    fn test_nearest_region_wins() {
        let tracks = [FaceRegion::new(100, 100, 80, 80)];
        let regions = [
            FaceRegion::new(130, 100, 80, 80),
            FaceRegion::new(104, 102, 80, 80),
        ];
        let a = associate(&tracks, &regions, &rule());
        assert_eq!(a.matched, vec![(0, 1)]);
        assert!(a.missed.is_empty());
        // Region 0 overlaps the track, so it is not a new face.
        assert!(a.spawn.is_empty());
    }

    #[test]
    fn test_far_region_spawns() {
        let tracks = [FaceRegion::new(0, 0, 60, 60)];
        let regions = [FaceRegion::new(400, 300, 60, 60)];
        let a = associate(&tracks, &regions, &rule());
        assert!(a.matched.is_empty());
        assert_eq!(a.missed, vec![0]);
        assert_eq!(a.spawn, vec![0]);
    }

    #[test]
    fn test_two_faces_two_tracks() {
        let tracks = [FaceRegion::new(0, 0, 60, 60), FaceRegion::new(300, 0, 60, 60)];
        let regions = [FaceRegion::new(305, 3, 60, 60), FaceRegion::new(4, 2, 60, 60)];
        let a = associate(&tracks, &regions, &rule());
        let mut matched = a.matched.clone();
        matched.sort();
        assert_eq!(matched, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn test_no_tracks_all_spawn() {
        let regions = [FaceRegion::new(0, 0, 60, 60), FaceRegion::new(300, 0, 60, 60)];
        let a = associate(&[], &regions, &rule());
        assert_eq!(a.spawn, vec![0, 1]);
    }
}
