//! Charging point ranking
//!
//! Blends distance with queue congestion (see [`recarga_core::geo::score`]).
//! Queue lengths are polled from every connected point concurrently; a point
//! that does not answer within the per-query timeout, or before the batch
//! deadline, is ranked with [`UNKNOWN_QUEUE`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use recarga_core::geo::{self, UNKNOWN_QUEUE};
use recarga_core::{PointId, Region};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RankingConfig;
use crate::peer::Peer;
use crate::registry::Registry;

/// One candidate point
#[derive(Debug, Clone, PartialEq)]
pub struct RankingEntry {
    pub point_id: PointId,
    pub distance_km: f64,
    pub queue_length: usize,
    pub score: f64,
}

impl RankingEntry {
    /// Line shown to the vehicle; `position` is 1-based
    pub fn display_line(&self, position: usize) -> String {
        format!(
            "{}. Point ID: {}, Distance: {:.2} km, Queue: {} vehicles",
            position,
            self.point_id,
            self.distance_km,
            geo::display_queue(self.queue_length)
        )
    }
}

/// Render a shortlist as the `ranking-pontos` payload
pub fn format_ranking(entries: &[RankingEntry]) -> String {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| entry.display_line(i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Score every point of the region and keep the best `limit`.
///
/// Points missing from `queues` count as [`UNKNOWN_QUEUE`]. Ties are broken
/// by ascending point id.
pub fn rank_points(
    region: &Region,
    latitude: f64,
    longitude: f64,
    queues: &HashMap<PointId, usize>,
    limit: usize,
) -> Vec<RankingEntry> {
    let mut entries: Vec<RankingEntry> = region
        .points()
        .iter()
        .map(|point| {
            let distance_km = geo::distance_km(latitude, longitude, point.latitude, point.longitude);
            let queue_length = queues.get(&point.id).copied().unwrap_or(UNKNOWN_QUEUE);
            RankingEntry {
                point_id: point.id,
                distance_km,
                queue_length,
                score: geo::score(distance_km, queue_length),
            }
        })
        .collect();

    entries.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.point_id.cmp(&b.point_id)));
    entries.truncate(limit);
    entries
}

/// Ranks points for a vehicle position
pub struct Ranker {
    registry: Arc<Registry>,
    region: Arc<Region>,
    config: RankingConfig,
}

impl Ranker {
    pub fn new(registry: Arc<Registry>, region: Arc<Region>, config: RankingConfig) -> Self {
        Self {
            registry,
            region,
            config,
        }
    }

    /// Poll connected points and return the shortlist
    pub async fn rank(&self, latitude: f64, longitude: f64) -> Vec<RankingEntry> {
        let points = self.registry.all_points();
        let queues = self.collect_queue_lengths(points).await;
        let entries = rank_points(&self.region, latitude, longitude, &queues, self.config.shortlist_len);
        info!(
            "Ranking: {} candidates for ({:.5}, {:.5}), best {:?}",
            entries.len(),
            latitude,
            longitude,
            entries.first().map(|e| e.point_id)
        );
        entries
    }

    /// Query every point concurrently, keeping whatever arrives by the deadline
    pub async fn collect_queue_lengths(&self, points: Vec<(PointId, Arc<Peer>)>) -> HashMap<PointId, usize> {
        let deadline = Instant::now() + self.config.batch_timeout;
        let query_timeout = self.config.query_timeout;

        let mut pending: FuturesUnordered<_> = points
            .into_iter()
            .map(|(id, peer)| async move { (id, peer.query_availability(id, query_timeout).await) })
            .collect();

        let mut queues = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((id, Some(report)))) => {
                    self.registry.record_queue(id, report.queue_length);
                    queues.insert(id, report.queue_length);
                }
                Ok(Some((id, None))) => {
                    debug!("Ranking: no queue length from point {}", id);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Ranking: batch deadline reached with {} queries pending",
                        pending.len()
                    );
                    break;
                }
            }
        }
        queues
    }
}
