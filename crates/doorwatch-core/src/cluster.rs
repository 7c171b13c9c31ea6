//! Density-based clustering of face encodings.

use crate::types::FaceEncoding;

pub const DEFAULT_CLUSTER_EPSILON: f32 = 0.6;

/// DBSCAN over Euclidean distance.
///
/// A point's neighbourhood includes itself, so with `min_samples = 1` every
/// point is a core point and nothing is noise. Points that end up as noise
/// are returned as singleton clusters, since each still represents one face.
/// Clusters are ordered by their lowest member index.
pub fn dbscan(encodings: &[FaceEncoding], eps: f32, min_samples: usize) -> Vec<Vec<usize>> {
    let mut labels: Vec<Option<usize>> = vec![None; encodings.len()];
    let mut visited = vec![false; encodings.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for start in 0..encodings.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let seeds = neighbours(encodings, start, eps);
        if seeds.len() < min_samples {
            continue;
        }

        let cluster_id = clusters.len();
        let mut members = Vec::new();
        let mut queue = seeds;
        let mut head = 0;
        while head < queue.len() {
            let idx = queue[head];
            head += 1;

            if labels[idx].is_none() {
                labels[idx] = Some(cluster_id);
                members.push(idx);
            }
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            let reach = neighbours(encodings, idx, eps);
            if reach.len() >= min_samples {
                queue.extend(reach);
            }
        }
        members.sort_unstable();
        clusters.push(members);
    }

    for (idx, label) in labels.iter().enumerate() {
        if label.is_none() {
            clusters.push(vec![idx]);
        }
    }
    clusters.sort_by_key(|c| c.first().copied());
    clusters
}

fn neighbours(encodings: &[FaceEncoding], idx: usize, eps: f32) -> Vec<usize> {
    let center = &encodings[idx];
    encodings
        .iter()
        .enumerate()
        .filter(|(_, other)| center.distance(other) <= eps)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(values: &[f32]) -> FaceEncoding {
        FaceEncoding::new(values.to_vec())
    }

    #[test]
    fn test_close_encodings_form_one_cluster() {
        let encodings = vec![enc(&[0.0, 0.0]), enc(&[0.2, 0.0]), enc(&[0.0, 0.3])];
        let clusters = dbscan(&encodings, DEFAULT_CLUSTER_EPSILON, 1);
        assert_eq!(clusters, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_distant_encodings_split() {
        let encodings = vec![enc(&[0.0, 0.0]), enc(&[5.0, 5.0]), enc(&[0.1, 0.0]), enc(&[5.0, 5.2])];
        let clusters = dbscan(&encodings, DEFAULT_CLUSTER_EPSILON, 1);
        assert_eq!(clusters, vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn test_chaining_through_core_points() {
        // 0 and 2 are too far apart directly but connect through 1.
        let encodings = vec![enc(&[0.0]), enc(&[0.5]), enc(&[1.0])];
        assert_eq!(dbscan(&encodings, 0.6, 1), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_noise_becomes_singletons() {
        let encodings = vec![enc(&[0.0]), enc(&[0.1]), enc(&[10.0])];
        let clusters = dbscan(&encodings, 0.6, 2);
        assert_eq!(clusters, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_empty_input() {
        assert!(dbscan(&[], 0.6, 1).is_empty());
    }
}
