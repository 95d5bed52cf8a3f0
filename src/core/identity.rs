//! Cross-video face identity clustering.
//!
//! Density-based (DBSCAN-style) clustering over face embeddings. Points are
//! put into a canonical order before clustering so cluster discovery, and
//! therefore `person_N` numbering, is reproducible across runs.

use crate::config::{ClusterSettings, DistanceMetric};
use crate::core::detection::{Detection, Embedding};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("No face embeddings were collected; nothing to cluster")]
    EmptyEmbeddingPool,

    #[error("Unknown person id(s) {ids:?}; valid ids are {valid:?}")]
    UnknownPersonId { ids: Vec<u32>, valid: Vec<u32> },

    #[error("Invalid person selection '{0}'")]
    InvalidSelection(String),
}

/// Location of one face inside the scan results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FaceRef {
    pub video: PathBuf,
    pub frame: usize,
    pub face: usize,
}

/// A face offered to the clustering pass.
#[derive(Debug, Clone)]
pub struct EmbeddedFace<'a> {
    pub face_ref: FaceRef,
    pub detection: &'a Detection,
    pub embedding: &'a Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonCluster {
    pub id: u32,
    pub members: Vec<FaceRef>,
    /// Highest-confidence member, used for the preview image.
    pub representative: FaceRef,
    pub representative_detection: Detection,
    /// Videos this person appears in, in canonical order.
    pub videos: Vec<PathBuf>,
    /// Mean of the members' normalized embeddings, renormalized.
    pub centroid: Vec<f32>,
}

impl PersonCluster {
    pub fn face_count(&self) -> usize {
        self.members.len()
    }

    pub fn preview_name(&self) -> String {
        format!("person_{}.jpg", self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ClusteringData", into = "ClusteringData")]
pub struct Clustering {
    pub clusters: Vec<PersonCluster>,
    /// Faces that belong to a person. Noise faces are absent.
    pub assignments: HashMap<FaceRef, u32>,
    pub noise: usize,
}

/// Persisted form; the assignment index is rebuilt from cluster members.
#[derive(Serialize, Deserialize)]
struct ClusteringData {
    clusters: Vec<PersonCluster>,
    noise: usize,
}

impl From<ClusteringData> for Clustering {
    fn from(data: ClusteringData) -> Self {
        Clustering::from_clusters(data.clusters, data.noise)
    }
}

impl From<Clustering> for ClusteringData {
    fn from(c: Clustering) -> Self {
        ClusteringData {
            clusters: c.clusters,
            noise: c.noise,
        }
    }
}

impl Clustering {
    pub fn from_clusters(clusters: Vec<PersonCluster>, noise: usize) -> Self {
        let assignments = clusters
            .iter()
            .flat_map(|c| c.members.iter().map(move |m| (m.clone(), c.id)))
            .collect();
        Self {
            clusters,
            assignments,
            noise,
        }
    }

    pub fn ids(&self) -> Vec<u32> {
        self.clusters.iter().map(|c| c.id).collect()
    }

    pub fn get(&self, id: u32) -> Option<&PersonCluster> {
        self.clusters.iter().find(|c| c.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Unvisited,
    Noise,
    Cluster(u32),
}

pub struct FaceIdentifier {
    settings: ClusterSettings,
}

impl FaceIdentifier {
    pub fn new(settings: ClusterSettings) -> Self {
        Self { settings }
    }

    pub fn cluster(&self, mut faces: Vec<EmbeddedFace<'_>>) -> Result<Clustering, IdentityError> {
        faces.sort_by(|a, b| a.face_ref.cmp(&b.face_ref));

        let Some(dim) = faces.first().map(|f| f.embedding.dim()) else {
            return Err(IdentityError::EmptyEmbeddingPool);
        };
        let before = faces.len();
        faces.retain(|f| f.embedding.dim() == dim);
        if faces.len() != before {
            warn!(dropped = before - faces.len(), dim, "dropped embeddings with mismatched dimension");
        }

        let points: Vec<Vec<f32>> = faces.iter().map(|f| f.embedding.normalized()).collect();
        let metric = self.settings.metric;
        let radius = self.settings.radius;

        let neighborhoods: Vec<Vec<usize>> = (0..points.len())
            .into_par_iter()
            .map(|i| {
                (0..points.len())
                    .filter(|&j| distance(metric, &points[i], &points[j]) <= radius)
                    .collect()
            })
            .collect();

        let labels = dbscan(&neighborhoods, self.settings.min_neighbors);

        let mut members: Vec<Vec<usize>> = Vec::new();
        let mut noise = 0;
        for (i, label) in labels.iter().enumerate() {
            match *label {
                Label::Cluster(c) => {
                    let c = c as usize;
                    if members.len() <= c {
                        members.resize_with(c + 1, Vec::new);
                    }
                    members[c].push(i);
                }
                _ => noise += 1,
            }
        }

        let mut assignments = HashMap::new();
        let mut clusters = Vec::with_capacity(members.len());
        for (id, indices) in members.into_iter().enumerate() {
            let id = id as u32;
            let mut representative = indices[0];
            for &i in &indices {
                if faces[i].detection.confidence > faces[representative].detection.confidence {
                    representative = i;
                }
            }

            let mut videos: Vec<PathBuf> = Vec::new();
            let mut centroid = vec![0.0f32; dim];
            for &i in &indices {
                assignments.insert(faces[i].face_ref.clone(), id);
                if videos.last() != Some(&faces[i].face_ref.video) {
                    videos.push(faces[i].face_ref.video.clone());
                }
                for (c, v) in centroid.iter_mut().zip(&points[i]) {
                    *c += v;
                }
            }

            clusters.push(PersonCluster {
                id,
                members: indices.iter().map(|&i| faces[i].face_ref.clone()).collect(),
                representative: faces[representative].face_ref.clone(),
                representative_detection: faces[representative].detection.clone(),
                videos,
                centroid: Embedding(centroid).normalized(),
            });
        }

        debug!(faces = faces.len(), persons = clusters.len(), noise, "clustered faces");
        Ok(Clustering {
            clusters,
            assignments,
            noise,
        })
    }
}

/// Standard DBSCAN over precomputed neighbourhoods (each including the point
/// itself). Clusters are numbered in discovery order.
fn dbscan(neighborhoods: &[Vec<usize>], min_neighbors: usize) -> Vec<Label> {
    let mut labels = vec![Label::Unvisited; neighborhoods.len()];
    let mut next_id = 0u32;

    for i in 0..neighborhoods.len() {
        if labels[i] != Label::Unvisited {
            continue;
        }
        if neighborhoods[i].len() < min_neighbors {
            labels[i] = Label::Noise;
            continue;
        }

        let id = next_id;
        next_id += 1;
        labels[i] = Label::Cluster(id);

        let mut queue: VecDeque<usize> = neighborhoods[i].iter().copied().filter(|&j| j != i).collect();
        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Label::Noise => labels[j] = Label::Cluster(id),
                Label::Unvisited => {
                    labels[j] = Label::Cluster(id);
                    if neighborhoods[j].len() >= min_neighbors {
                        queue.extend(neighborhoods[j].iter().copied());
                    }
                }
                Label::Cluster(_) => {}
            }
        }
    }
    labels
}

pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            (1.0 - dot).max(0.0)
        }
    }
}

/// Which people the operator asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    All,
    Ids(Vec<u32>),
}

impl FromStr for Selection {
    type Err = IdentityError;

    /// Parses `all` or a comma separated id list such as `0,2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Selection::All);
        }
        let ids = trimmed
            .split(',')
            .map(|part| {
                let part = part.trim();
                let part = part.strip_prefix("person_").unwrap_or(part);
                part.parse::<u32>()
                    .map_err(|_| IdentityError::InvalidSelection(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Err(IdentityError::InvalidSelection(s.to_string()));
        }
        Ok(Selection::Ids(ids))
    }
}

impl Selection {
    /// Resolve against the known clusters, rejecting unknown ids.
    pub fn resolve(&self, clustering: &Clustering) -> Result<BTreeSet<u32>, IdentityError> {
        let valid = clustering.ids();
        match self {
            Selection::All => Ok(valid.into_iter().collect()),
            Selection::Ids(ids) => {
                let unknown: Vec<u32> = ids.iter().copied().filter(|id| !valid.contains(id)).collect();
                if !unknown.is_empty() {
                    return Err(IdentityError::UnknownPersonId { ids: unknown, valid });
                }
                Ok(ids.iter().copied().collect())
            }
        }
    }
}

/// Decides whether a face belongs to one of the selected people.
#[derive(Debug, Clone)]
pub struct IdentityFilter {
    selected: BTreeSet<u32>,
    centroids: Vec<Vec<f32>>,
    threshold: f32,
    metric: DistanceMetric,
}

impl IdentityFilter {
    pub fn new(clustering: &Clustering, selected: BTreeSet<u32>, settings: &ClusterSettings) -> Self {
        let centroids = clustering
            .clusters
            .iter()
            .filter(|c| selected.contains(&c.id))
            .map(|c| c.centroid.clone())
            .collect();
        Self {
            selected,
            centroids,
            threshold: settings.match_threshold,
            metric: settings.metric,
        }
    }

    pub fn selected(&self) -> &BTreeSet<u32> {
        &self.selected
    }

    /// A clustered face matches when its person is selected. An unclustered
    /// face matches when it lies within the threshold of a selected centroid.
    pub fn matches(&self, person: Option<u32>, embedding: Option<&Embedding>) -> bool {
        match person {
            Some(id) => self.selected.contains(&id),
            None => embedding.is_some_and(|e| {
                let point = e.normalized();
                self.centroids
                    .iter()
                    .any(|c| c.len() == point.len() && distance(self.metric, c, &point) <= self.threshold)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detection::BoundingBox;

    fn detection(confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x1: 0.1, y1: 0.1, x2: 0.3, y2: 0.3 },
            confidence,
            landmarks: None,
            expression: 0.0,
            timestamp: 0.0,
        }
    }

    struct Pool {
        items: Vec<(FaceRef, Detection, Embedding)>,
    }

    impl Pool {
        fn new() -> Self {
            Self { items: Vec::new() }
        }

        fn add(&mut self, video: &str, frame: usize, confidence: f32, v: Vec<f32>) {
            self.items.push((
                FaceRef { video: PathBuf::from(video), frame, face: 0 },
                detection(confidence),
                Embedding(v),
            ));
        }

        fn faces(&self) -> Vec<EmbeddedFace<'_>> {
            self.items
                .iter()
                .map(|(r, d, e)| EmbeddedFace { face_ref: r.clone(), detection: d, embedding: e })
                .collect()
        }
    }

    fn two_people() -> Pool {
        let mut pool = Pool::new();
        pool.add("a.mp4", 0, 0.7, vec![1.0, 0.05, 0.0]);
        pool.add("a.mp4", 1, 0.9, vec![1.0, 0.0, 0.05]);
        pool.add("b.mp4", 0, 0.8, vec![0.0, 1.0, 0.05]);
        pool.add("b.mp4", 3, 0.6, vec![0.05, 1.0, 0.0]);
        pool.add("c.mp4", 2, 0.5, vec![0.98, 0.1, 0.0]);
        pool
    }

    fn partition(c: &Clustering) -> BTreeSet<BTreeSet<FaceRef>> {
        c.clusters
            .iter()
            .map(|p| p.members.iter().cloned().collect())
            .collect()
    }

    #[test]
    fn test_clusters_two_people() {
        let pool = two_people();
        let result = FaceIdentifier::new(ClusterSettings::default()).cluster(pool.faces()).unwrap();

        assert_eq!(result.clusters.len(), 2);
        assert_eq!(result.noise, 0);
        // a.mp4 frame 0 is first in canonical order, so its person is person_0.
        let p0 = result.get(0).unwrap();
        assert_eq!(p0.face_count(), 3);
        assert_eq!(p0.videos, vec![PathBuf::from("a.mp4"), PathBuf::from("c.mp4")]);
        assert_eq!(p0.representative.frame, 1);
        assert_eq!(p0.representative_detection.confidence, 0.9);
        assert_eq!(result.get(1).unwrap().face_count(), 2);
        assert_eq!(p0.preview_name(), "person_0.jpg");
    }

    #[test]
    fn test_clustering_is_deterministic_under_input_order() {
        let pool = two_people();
        let identifier = FaceIdentifier::new(ClusterSettings::default());
        let first = identifier.cluster(pool.faces()).unwrap();

        let mut shuffled = pool.faces();
        shuffled.reverse();
        shuffled.swap(0, 2);
        let second = identifier.cluster(shuffled).unwrap();

        assert_eq!(partition(&first), partition(&second));
        assert_eq!(first.assignments, second.assignments);
    }

    #[test]
    fn test_distinct_embedding_forms_new_cluster() {
        let settings = ClusterSettings { min_neighbors: 1, ..ClusterSettings::default() };
        let identifier = FaceIdentifier::new(settings);
        let mut pool = two_people();
        let before = identifier.cluster(pool.faces()).unwrap();

        pool.add("d.mp4", 0, 0.9, vec![0.0, 0.0, 1.0]);
        let after = identifier.cluster(pool.faces()).unwrap();

        assert_eq!(after.clusters.len(), before.clusters.len() + 1);
        let old = partition(&before);
        let new = partition(&after);
        assert!(old.is_subset(&new));
    }

    #[test]
    fn test_isolated_points_are_noise() {
        let mut pool = two_people();
        pool.add("d.mp4", 0, 0.9, vec![0.0, 0.0, 1.0]);
        let result = FaceIdentifier::new(ClusterSettings::default()).cluster(pool.faces()).unwrap();
        assert_eq!(result.noise, 1);
        assert!(!result.assignments.keys().any(|r| r.video == PathBuf::from("d.mp4")));
    }

    #[test]
    fn test_persisted_clustering_rebuilds_index() {
        let result = FaceIdentifier::new(ClusterSettings::default()).cluster(two_people().faces()).unwrap();
        let json = serde_json::to_string(&result).unwrap();
        let restored: Clustering = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.assignments, result.assignments);
        assert_eq!(restored.ids(), vec![0, 1]);
    }

    #[test]
    fn test_empty_pool_is_error() {
        let result = FaceIdentifier::new(ClusterSettings::default()).cluster(Vec::new());
        assert_eq!(result, Err(IdentityError::EmptyEmbeddingPool));
    }

    #[test]
    fn test_mismatched_dimensions_dropped() {
        let mut pool = two_people();
        pool.add("z.mp4", 0, 0.9, vec![1.0, 0.0]);
        let result = FaceIdentifier::new(ClusterSettings::default()).cluster(pool.faces()).unwrap();
        assert_eq!(result.assignments.len(), 5);
        assert_eq!(result.noise, 0);
    }

    #[test]
    fn test_cosine_metric() {
        let settings = ClusterSettings {
            metric: DistanceMetric::Cosine,
            radius: 0.1,
            ..ClusterSettings::default()
        };
        let result = FaceIdentifier::new(settings).cluster(two_people().faces()).unwrap();
        assert_eq!(result.clusters.len(), 2);
    }

    #[test]
    fn test_selection_parsing() {
        assert_eq!("all".parse::<Selection>().unwrap(), Selection::All);
        assert_eq!(" ALL ".parse::<Selection>().unwrap(), Selection::All);
        assert_eq!("0, 2".parse::<Selection>().unwrap(), Selection::Ids(vec![0, 2]));
        assert_eq!("person_1".parse::<Selection>().unwrap(), Selection::Ids(vec![1]));
        assert!("x,1".parse::<Selection>().is_err());
        assert!("".parse::<Selection>().is_err());
    }

    #[test]
    fn test_selection_rejects_unknown_ids() {
        let result = FaceIdentifier::new(ClusterSettings::default()).cluster(two_people().faces()).unwrap();
        assert_eq!(
            Selection::Ids(vec![1, 7]).resolve(&result),
            Err(IdentityError::UnknownPersonId { ids: vec![7], valid: vec![0, 1] })
        );
        assert_eq!(
            Selection::All.resolve(&result).unwrap(),
            BTreeSet::from([0, 1])
        );
    }

    #[test]
    fn test_filter_matches_members_and_nearby_noise() {
        let result = FaceIdentifier::new(ClusterSettings::default()).cluster(two_people().faces()).unwrap();
        let filter = IdentityFilter::new(&result, BTreeSet::from([0]), &ClusterSettings::default());

        assert!(filter.matches(Some(0), None));
        assert!(!filter.matches(Some(1), Some(&Embedding(vec![1.0, 0.0, 0.0]))));
        assert!(filter.matches(None, Some(&Embedding(vec![0.9, 0.1, 0.1]))));
        assert!(!filter.matches(None, Some(&Embedding(vec![0.0, 0.0, 1.0]))));
        assert!(!filter.matches(None, None));
    }
}
