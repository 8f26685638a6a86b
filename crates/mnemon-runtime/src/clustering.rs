use mnemon_store::cosine_distance;

/// Deterministic k-means over embedding vectors: k-means++-style seeding by
/// farthest point (no randomness, so reruns are stable), then Lloyd
/// iterations. Returns `(centroid, member node ids)` per cluster.
pub fn kmeans(records: &[(String, Vec<f32>)], k: usize, iterations: usize) -> Vec<(Vec<f32>, Vec<String>)> {
    if records.is_empty() || k == 0 {
        return Vec::new();
    }
    let k = k.min(records.len());
    let dimension = records[0].1.len();

    // Seeding: first point, then repeatedly the point farthest from its
    // nearest chosen centroid.
    let mut centroids: Vec<Vec<f32>> = vec![records[0].1.clone()];
    while centroids.len() < k {
        let (farthest, _) = records
            .iter()
            .enumerate()
            .map(|(index, (_, vector))| {
                let nearest = centroids
                    .iter()
                    .map(|c| cosine_distance(vector, c))
                    .fold(f32::INFINITY, f32::min);
                (index, nearest)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or((0, 0.0));
        centroids.push(records[farthest].1.clone());
    }

    let mut assignments: Vec<usize> = vec![0; records.len()];
    for _ in 0..iterations {
        let mut changed = false;
        for (index, (_, vector)) in records.iter().enumerate() {
            let nearest = centroids
                .iter()
                .enumerate()
                .map(|(c, centroid)| (c, cosine_distance(vector, centroid)))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(c, _)| c)
                .unwrap_or(0);
            if assignments[index] != nearest {
                assignments[index] = nearest;
                changed = true;
            }
        }

        for (cluster, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f32>> = records
                .iter()
                .zip(assignments.iter())
                .filter(|(_, a)| **a == cluster)
                .map(|((_, v), _)| v)
                .collect();
            if members.is_empty() {
                continue;
            }
            let mut mean = vec![0.0f32; dimension];
            for vector in &members {
                for (m, v) in mean.iter_mut().zip(vector.iter()) {
                    *m += v;
                }
            }
            for m in mean.iter_mut() {
                *m /= members.len() as f32;
            }
            *centroid = mean;
        }

        if !changed {
            break;
        }
    }

    centroids
        .into_iter()
        .enumerate()
        .map(|(cluster, centroid)| {
            let members = records
                .iter()
                .zip(assignments.iter())
                .filter(|(_, a)| **a == cluster)
                .map(|((id, _), _)| id.clone())
                .collect();
            (centroid, members)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<(String, Vec<f32>)> {
        vec![
            ("a1".into(), vec![1.0, 0.0]),
            ("a2".into(), vec![0.9, 0.1]),
            ("b1".into(), vec![0.0, 1.0]),
            ("b2".into(), vec![0.1, 0.9]),
        ]
    }

    #[test]
    fn test_two_obvious_clusters() {
        let clusters = kmeans(&records(), 2, 10);
        assert_eq!(clusters.len(), 2);

        let sizes: Vec<usize> = clusters.iter().map(|(_, m)| m.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 4);
        assert!(sizes.iter().all(|s| *s == 2));

        // Members of a cluster stay together.
        for (_, members) in &clusters {
            let prefixes: std::collections::HashSet<char> =
                members.iter().filter_map(|m| m.chars().next()).collect();
            assert_eq!(prefixes.len(), 1);
        }
    }

    #[test]
    fn test_deterministic() {
        let a = kmeans(&records(), 2, 10);
        let b = kmeans(&records(), 2, 10);
        assert_eq!(
            a.iter().map(|(_, m)| m.clone()).collect::<Vec<_>>(),
            b.iter().map(|(_, m)| m.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_k_clamped_to_population() {
        let clusters = kmeans(&records()[..2], 8, 5);
        assert_eq!(clusters.len(), 2);
        assert!(kmeans(&[], 3, 5).is_empty());
    }
}
