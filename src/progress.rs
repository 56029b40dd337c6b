//! Per-user, per-city walking progress.
//!
//! Progress is derived data: it can always be rebuilt from the ordered log of
//! [`WalkedSegment`] records plus the city's catalogue. The aggregator keeps two
//! things per (user, city):
//! - the event log, every applied record including repeat visits
//! - the credited set, each segment id at most once
//!
//! Counters only move when a segment enters the credited set, so applying an
//! event twice leaves [`CityProgress`] unchanged. [`recompute`] replays a log with
//! the same arithmetic in the same order, so it matches incremental application
//! bit for bit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::catalogue::CityCatalogue;
use crate::{completion_percent, CityProgress, Result, SegmentId, WalkedSegment};

/// Credit one event into `progress`. Returns true if the segment was newly credited.
fn credit(
    progress: &mut CityProgress,
    credited: &mut HashSet<SegmentId>,
    event: &WalkedSegment,
    catalogue: Option<&CityCatalogue>,
) -> bool {
    if !credited.insert(event.segment_id) {
        return false;
    }

    let length = match catalogue.and_then(|c| c.length_of(event.segment_id)) {
        Some(length) => length,
        None => {
            warn!(
                "[Progress] segment {} not in catalogue for '{}', credited without distance",
                event.segment_id, event.city_id
            );
            0.0
        }
    };

    progress.segments_walked += 1;
    progress.distance_walked_meters += length;
    progress.completion_percent =
        completion_percent(progress.segments_walked, progress.total_segments);
    progress.last_updated = Some(event.walked_at);
    true
}

/// Rebuild progress for (user, city) from an ordered event history.
///
/// Events for other users or cities are ignored.
pub fn recompute(
    user_id: &str,
    city_id: &str,
    events: &[WalkedSegment],
    catalogue: Option<&CityCatalogue>,
) -> CityProgress {
    let total = catalogue.map(|c| c.total_segments()).unwrap_or(0);
    let mut progress = CityProgress::empty(user_id, city_id, total);
    let mut credited = HashSet::new();

    for event in events
        .iter()
        .filter(|e| e.user_id == user_id && e.city_id == city_id)
    {
        credit(&mut progress, &mut credited, event, catalogue);
    }

    progress
}

#[derive(Debug, Clone)]
struct UserCityState {
    progress: CityProgress,
    credited: HashSet<SegmentId>,
    history: Vec<WalkedSegment>,
}

type StateKey = (String, String);

/// Running totals for every (user, city) seen so far.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    catalogues: HashMap<String, Arc<CityCatalogue>>,
    states: HashMap<StateKey, UserCityState>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a city's catalogue and rebuild that city's totals
    /// from the event logs.
    pub fn set_catalogue(&mut self, catalogue: Arc<CityCatalogue>) {
        let city_id = catalogue.city_id().to_string();
        for ((user_id, state_city), state) in self.states.iter_mut() {
            if *state_city != city_id {
                continue;
            }
            state.progress = recompute(user_id, &city_id, &state.history, Some(catalogue.as_ref()));
        }
        debug!(
            "[Progress] catalogue for '{}' set ({} segments)",
            city_id,
            catalogue.total_segments()
        );
        self.catalogues.insert(city_id, catalogue);
    }

    pub fn catalogue(&self, city_id: &str) -> Option<&Arc<CityCatalogue>> {
        self.catalogues.get(city_id)
    }

    /// Apply one event. Returns true if it credited a new segment; repeat
    /// segments are logged but leave the counters untouched.
    pub fn apply(&mut self, event: &WalkedSegment) -> bool {
        let catalogue = self.catalogues.get(&event.city_id).map(Arc::as_ref);
        let state = self
            .states
            .entry((event.user_id.clone(), event.city_id.clone()))
            .or_insert_with(|| UserCityState {
                progress: CityProgress::empty(
                    &event.user_id,
                    &event.city_id,
                    catalogue.map(|c| c.total_segments()).unwrap_or(0),
                ),
                credited: HashSet::new(),
                history: Vec::new(),
            });

        state.history.push(event.clone());
        credit(&mut state.progress, &mut state.credited, event, catalogue)
    }

    pub fn is_credited(&self, user_id: &str, city_id: &str, segment_id: SegmentId) -> bool {
        self.state(user_id, city_id)
            .map(|s| s.credited.contains(&segment_id))
            .unwrap_or(false)
    }

    fn state(&self, user_id: &str, city_id: &str) -> Option<&UserCityState> {
        self.states
            .get(&(user_id.to_string(), city_id.to_string()))
    }

    /// Current progress. A city with a catalogue but no walks yet reports zero
    /// progress; a city never seen at all reports `None`.
    pub fn progress(&self, user_id: &str, city_id: &str) -> Option<CityProgress> {
        match self.state(user_id, city_id) {
            Some(state) => Some(state.progress.clone()),
            None => self
                .catalogues
                .get(city_id)
                .map(|c| CityProgress::empty(user_id, city_id, c.total_segments())),
        }
    }

    /// Every tracked progress record, sorted by user then city.
    pub fn all_progress(&self) -> Vec<CityProgress> {
        let mut all: Vec<CityProgress> = self.states.values().map(|s| s.progress.clone()).collect();
        all.sort_by(|a, b| (&a.user_id, &a.city_id).cmp(&(&b.user_id, &b.city_id)));
        all
    }

    /// Full event log for (user, city), repeats included, in application order.
    pub fn history(&self, user_id: &str, city_id: &str) -> Vec<WalkedSegment> {
        self.state(user_id, city_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// Credited segment ids in ascending order.
    pub fn credited_segments(&self, user_id: &str, city_id: &str) -> Vec<SegmentId> {
        let mut ids: Vec<SegmentId> = self
            .state(user_id, city_id)
            .map(|s| s.credited.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Rebuild every record from its event log.
    pub fn recompute_all(&self) -> Vec<CityProgress> {
        let rebuild = |((user_id, city_id), state): (&StateKey, &UserCityState)| {
            let catalogue = self.catalogues.get(city_id).map(Arc::as_ref);
            recompute(user_id, city_id, &state.history, catalogue)
        };

        #[cfg(feature = "parallel")]
        let mut all: Vec<CityProgress> = self.states.par_iter().map(rebuild).collect();

        #[cfg(not(feature = "parallel"))]
        let mut all: Vec<CityProgress> = self.states.iter().map(rebuild).collect();

        all.sort_by(|a, b| (&a.user_id, &a.city_id).cmp(&(&b.user_id, &b.city_id)));
        all
    }

    /// Records whose incremental totals differ from a full rebuild. Empty when
    /// everything is consistent.
    pub fn verify_consistency(&self) -> Vec<CityProgress> {
        let incremental = self.all_progress();
        self.recompute_all()
            .into_iter()
            .zip(incremental)
            .filter(|(rebuilt, current)| rebuilt != current)
            .map(|(rebuilt, _)| rebuilt)
            .collect()
    }

    /// All progress records as JSON.
    pub fn progress_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.all_progress())?)
    }

    pub fn record_count(&self) -> usize {
        self.states.len()
    }
}
