//! # Tracking Engine
//!
//! Stateful core that turns GPS fixes into walking credit.
//!
//! ## Architecture
//!
//! The engine owns:
//! - The tracking state machine (`Idle`, `Active`, `Paused`)
//! - Known city boundaries for automatic city detection
//! - Built spatial indexes per city, with the active one published through a
//!   [`SharedIndex`]
//! - The [`ProgressAggregator`] behind a read/write lock, written only here
//! - Subscriber channels for [`TrackingEvent`] notifications
//!
//! Fixes are processed one at a time through [`TrackingEngine::process_fix`]:
//! city check → candidate lookup → matcher → dedup → progress update. Nothing in
//! that pipeline is fatal; recoverable conditions come back as [`Advisory`]
//! values on the [`FixOutcome`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::boundary::BoundaryLocator;
use crate::catalogue::{CityCatalogue, MapDataSource};
use crate::matcher::{match_point_with_epsilon, SegmentMatch};
use crate::progress::ProgressAggregator;
use crate::spatial_index::{SharedIndex, SpatialIndex};
use crate::{
    Advisory, CityBoundary, CityProgress, GpsPoint, Position, Result, RoadSegment,
    TrackingConfig, WalkedSegment, WalkerError,
};

// ============================================================================
// Core Types
// ============================================================================

/// Tracking lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingState {
    /// Not tracking
    Idle,
    /// Consuming the position stream
    Active,
    /// Stream suspended, state retained
    Paused,
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingState::Idle => write!(f, "idle"),
            TrackingState::Active => write!(f, "active"),
            TrackingState::Paused => write!(f, "paused"),
        }
    }
}

/// Engine notifications for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingEvent {
    /// A segment was walked (new credit, or a revisit when revisits are recorded)
    Walked(WalkedSegment),
    /// Progress totals changed for a city
    ProgressUpdated(CityProgress),
    /// A non-fatal condition occurred while processing a fix
    Advisory(Advisory),
    StateChanged(TrackingState),
    /// The active city changed; `manual` is true for explicit overrides
    CityChanged { city_id: Option<String>, manual: bool },
}

/// What happened to a fix at the matching stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome {
    /// Fix was not run through the matcher (not active, no city, no catalogue)
    Skipped,
    /// No segment within the threshold
    NoSegment,
    /// Nearest segment found, but the fix was too inaccurate to credit it
    LowAccuracy(SegmentMatch),
    /// Segment matched but was already credited
    AlreadyCredited(SegmentMatch),
    /// Segment matched and newly credited
    Credited(SegmentMatch),
}

/// Result of processing one fix.
#[derive(Debug, Clone, PartialEq)]
pub struct FixOutcome {
    /// False when the engine was not active and the fix was dropped
    pub processed: bool,
    /// Active city after processing
    pub city_id: Option<String>,
    pub outcome: MatchOutcome,
    /// Event emitted to the progress aggregator, if any
    pub event: Option<WalkedSegment>,
    pub advisories: Vec<Advisory>,
}

impl FixOutcome {
    fn ignored(city_id: Option<String>) -> Self {
        Self {
            processed: false,
            city_id,
            outcome: MatchOutcome::Skipped,
            event: None,
            advisories: Vec::new(),
        }
    }
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub fixes_processed: u64,
    pub fixes_ignored: u64,
    pub segments_credited: u64,
    pub revisits: u64,
    pub advisories: u64,
    pub catalogues_loaded: u32,
    pub known_cities: u32,
    pub active_city: Option<String>,
    pub indexed_cells: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct ActiveCity {
    city_id: String,
    /// Set by an explicit override; never replaced by detection
    manual: bool,
}

// ============================================================================
// Tracking Engine
// ============================================================================

/// The stateful tracking engine for one user on one device.
pub struct TrackingEngine {
    user_id: String,
    config: TrackingConfig,
    state: TrackingState,

    // Map data
    map_data: Box<dyn MapDataSource>,
    locator: BoundaryLocator,
    indexes: HashMap<String, Arc<SpatialIndex>>,
    missing_catalogues: HashSet<String>,
    /// Cities whose source catalogue failed validation; not re-requested
    rejected_catalogues: HashSet<String>,

    // Session state
    active_city: Option<ActiveCity>,
    active_index: Arc<SharedIndex>,
    progress: Arc<RwLock<ProgressAggregator>>,
    last_position: Option<Position>,

    subscribers: Vec<mpsc::Sender<TrackingEvent>>,
    stats: EngineStats,
}

impl TrackingEngine {
    /// Create an engine for `user_id`, loading city boundaries from `map_data`.
    pub fn new(user_id: &str, config: TrackingConfig, map_data: Box<dyn MapDataSource>) -> Result<Self> {
        config.validate()?;
        let locator = BoundaryLocator::from_boundaries(map_data.boundaries());
        info!(
            "[TrackingEngine] Created for '{}' with {} known cities",
            user_id,
            locator.len()
        );

        Ok(Self {
            user_id: user_id.to_string(),
            config,
            state: TrackingState::Idle,
            map_data,
            locator,
            indexes: HashMap::new(),
            missing_catalogues: HashSet::new(),
            rejected_catalogues: HashSet::new(),
            active_city: None,
            active_index: Arc::new(SharedIndex::new()),
            progress: Arc::new(RwLock::new(ProgressAggregator::new())),
            last_position: None,
            subscribers: Vec::new(),
            stats: EngineStats::default(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    // ========================================================================
    // State Machine
    // ========================================================================

    /// Idle/Paused → Active.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            TrackingState::Idle | TrackingState::Paused => self.transition(TrackingState::Active),
            TrackingState::Active => Err(self.invalid("start")),
        }
    }

    /// Active/Paused → Idle. Session data (city, progress) is kept.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            TrackingState::Active | TrackingState::Paused => self.transition(TrackingState::Idle),
            TrackingState::Idle => Err(self.invalid("stop")),
        }
    }

    /// Active → Paused.
    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            TrackingState::Active => self.transition(TrackingState::Paused),
            _ => Err(self.invalid("pause")),
        }
    }

    /// Paused → Active.
    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            TrackingState::Paused => self.transition(TrackingState::Active),
            _ => Err(self.invalid("resume")),
        }
    }

    fn transition(&mut self, next: TrackingState) -> Result<()> {
        info!("[TrackingEngine] {} -> {}", self.state, next);
        self.state = next;
        self.notify(TrackingEvent::StateChanged(next));
        Ok(())
    }

    fn invalid(&self, action: &str) -> WalkerError {
        WalkerError::InvalidTransition {
            action: action.to_string(),
            state: self.state.to_string(),
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to engine events. Dropped receivers are pruned on the next send.
    pub fn subscribe(&mut self) -> mpsc::Receiver<TrackingEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, event: TrackingEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn advise(&mut self, advisory: Advisory, advisories: &mut Vec<Advisory>) {
        advisories.push(advisory.clone());
        self.report(advisory);
    }

    fn report(&mut self, advisory: Advisory) {
        self.stats.advisories += 1;
        self.notify(TrackingEvent::Advisory(advisory));
    }

    // ========================================================================
    // City Selection
    // ========================================================================

    /// Currently active city, if any.
    pub fn active_city(&self) -> Option<&str> {
        self.active_city.as_ref().map(|c| c.city_id.as_str())
    }

    /// Explicitly select the active city, bypassing detection.
    ///
    /// The city must have a known boundary or loadable road data.
    pub fn set_active_city(&mut self, city_id: &str) -> Result<()> {
        let known = self.locator.boundary(city_id).is_some()
            || self.indexes.contains_key(city_id)
            || self.map_data.catalogue(city_id).is_some();
        if !known {
            return Err(WalkerError::UnknownCity {
                city_id: city_id.to_string(),
            });
        }
        self.activate_city(city_id, true);
        Ok(())
    }

    /// Forget the active city; the next fix runs detection again.
    pub fn clear_active_city(&mut self) {
        if self.active_city.take().is_some() {
            self.active_index.clear();
            self.notify(TrackingEvent::CityChanged {
                city_id: None,
                manual: true,
            });
        }
    }

    fn activate_city(&mut self, city_id: &str, manual: bool) {
        let next = ActiveCity {
            city_id: city_id.to_string(),
            manual,
        };
        if self.active_city.as_ref() == Some(&next) {
            return;
        }

        info!(
            "[TrackingEngine] Active city: {} ({})",
            city_id,
            if manual { "manual" } else { "detected" }
        );
        self.active_city = Some(next);

        match self.index_for(city_id) {
            Some(index) => {
                self.active_index.publish(index);
            }
            None => {
                self.active_index.clear();
            }
        }

        self.notify(TrackingEvent::CityChanged {
            city_id: Some(city_id.to_string()),
            manual,
        });
    }

    /// Reload city boundaries from the map-data source. Catalogues previously
    /// rejected as invalid may be requested again afterwards.
    pub fn refresh_boundaries(&mut self) {
        self.rejected_catalogues.clear();
        self.locator = BoundaryLocator::from_boundaries(self.map_data.boundaries());
        debug!("[TrackingEngine] {} boundaries loaded", self.locator.len());
    }

    /// Register a boundary directly, e.g. one fetched after startup.
    pub fn add_boundary(&mut self, boundary: CityBoundary) {
        self.locator.register(boundary);
    }

    // ========================================================================
    // Catalogues & Indexes
    // ========================================================================

    /// Load (or replace) a city's road segments. Builds the index, republishes it
    /// if the city is active, and rebuilds that city's progress totals.
    pub fn load_catalogue(&mut self, city_id: &str, segments: Vec<RoadSegment>) -> Result<()> {
        let catalogue = Arc::new(CityCatalogue::new(city_id, segments)?);
        self.install_catalogue(catalogue);
        Ok(())
    }

    fn install_catalogue(&mut self, catalogue: Arc<CityCatalogue>) -> Arc<SpatialIndex> {
        let city_id = catalogue.city_id().to_string();
        let index = Arc::new(SpatialIndex::build(
            Arc::clone(&catalogue),
            self.config.grid_cell_meters,
        ));

        self.progress
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set_catalogue(catalogue);
        self.indexes.insert(city_id.clone(), Arc::clone(&index));
        self.missing_catalogues.remove(&city_id);
        self.rejected_catalogues.remove(&city_id);
        self.stats.catalogues_loaded += 1;

        if self.active_city() == Some(city_id.as_str()) {
            self.active_index.publish(Arc::clone(&index));
        }
        info!(
            "[TrackingEngine] Catalogue for {} ready ({} cells)",
            city_id,
            index.cell_count()
        );
        index
    }

    /// Cached index for a city, requesting its catalogue from the map-data source
    /// when not yet built.
    fn index_for(&mut self, city_id: &str) -> Option<Arc<SpatialIndex>> {
        if let Some(index) = self.indexes.get(city_id) {
            return Some(Arc::clone(index));
        }
        if self.rejected_catalogues.contains(city_id) {
            return None;
        }

        let segments = self.map_data.catalogue(city_id)?;
        match CityCatalogue::new(city_id, segments) {
            Ok(catalogue) => Some(self.install_catalogue(Arc::new(catalogue))),
            Err(err) => {
                warn!("[TrackingEngine] Rejected catalogue for {}: {}", city_id, err);
                self.rejected_catalogues.insert(city_id.to_string());
                None
            }
        }
    }

    /// Index for the active city: the published one, or a fresh request to the
    /// map-data source if it has not arrived yet.
    fn active_index_for(&mut self, city_id: &str) -> Option<Arc<SpatialIndex>> {
        if let Some(index) = self.active_index.load().filter(|i| i.city_id() == city_id) {
            return Some(index);
        }
        let index = self.index_for(city_id)?;
        self.active_index.publish(Arc::clone(&index));
        Some(index)
    }

    // ========================================================================
    // Fix Processing
    // ========================================================================

    /// Run one fix through the pipeline.
    ///
    /// Fixes are ignored unless the engine is `Active`.
    pub fn process_fix(&mut self, position: &Position) -> FixOutcome {
        if self.state != TrackingState::Active {
            self.stats.fixes_ignored += 1;
            debug!("[TrackingEngine] Fix ignored while {}", self.state);
            return FixOutcome::ignored(self.active_city().map(str::to_string));
        }

        self.stats.fixes_processed += 1;
        let mut advisories = Vec::new();
        let point = position.point();

        if !point.is_valid() {
            self.advise(Advisory::PositionUnavailable, &mut advisories);
            return self.finish(MatchOutcome::Skipped, None, advisories);
        }
        self.last_position = Some(*position);

        // 1. City
        let Some(city_id) = self.resolve_city(&point, &mut advisories) else {
            return self.finish(MatchOutcome::Skipped, None, advisories);
        };

        // 2. Candidates
        let Some(index) = self.active_index_for(&city_id) else {
            if self.missing_catalogues.insert(city_id.clone()) {
                warn!("[TrackingEngine] No road data for {}, matching paused", city_id);
            }
            self.advise(Advisory::CatalogueMissing { city_id }, &mut advisories);
            return self.finish(MatchOutcome::Skipped, None, advisories);
        };
        let candidates = index.candidates_near(&point, self.config.effective_lookup_radius());

        // 3. Match
        let threshold = self.config.max_match_distance_meters;
        let found = match_point_with_epsilon(
            &point,
            candidates,
            threshold,
            self.config.tie_epsilon_meters,
        );

        let Some(found) = found else {
            self.advise(Advisory::NoSegmentWithinThreshold, &mut advisories);
            return self.finish(MatchOutcome::NoSegment, None, advisories);
        };

        // NaN accuracy is never trusted
        if !(position.accuracy_meters <= threshold) {
            self.advise(
                Advisory::LowAccuracyFix {
                    accuracy_meters: position.accuracy_meters,
                },
                &mut advisories,
            );
            return self.finish(MatchOutcome::LowAccuracy(found), None, advisories);
        }

        // 4. Dedup + credit
        let event = WalkedSegment {
            user_id: self.user_id.clone(),
            segment_id: found.segment_id,
            city_id: city_id.clone(),
            walked_at: position.timestamp,
        };
        let already = self
            .progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_credited(&self.user_id, &city_id, found.segment_id);

        if already {
            self.stats.revisits += 1;
            debug!("[TrackingEngine] Segment {} already credited", found.segment_id);
            if !self.config.record_revisits {
                return self.finish(MatchOutcome::AlreadyCredited(found), None, advisories);
            }
            self.apply_event(&event);
            return self.finish(MatchOutcome::AlreadyCredited(found), Some(event), advisories);
        }

        debug!(
            "[TrackingEngine] Credited segment {} at {:.1}m",
            found.segment_id, found.distance_meters
        );
        self.apply_event(&event);
        self.stats.segments_credited += 1;
        self.finish(MatchOutcome::Credited(found), Some(event), advisories)
    }

    /// Determine the city for a fix, switching cities when needed.
    fn resolve_city(&mut self, point: &GpsPoint, advisories: &mut Vec<Advisory>) -> Option<String> {
        if let Some(active) = self.active_city.clone() {
            let left_city = !active.manual
                && self.config.redetect_on_exit
                && self.locator.boundary(&active.city_id).is_some()
                && !self.locator.contains(&active.city_id, point);
            if !left_city {
                return Some(active.city_id);
            }
            info!("[TrackingEngine] Left {}, detecting again", active.city_id);
        }

        match self.locator.locate(point).map(str::to_string) {
            Some(city_id) => {
                self.activate_city(&city_id, false);
                Some(city_id)
            }
            None => {
                // Keep the last known city as fallback; only stop matching here
                self.advise(Advisory::CityUndetermined, advisories);
                None
            }
        }
    }

    fn apply_event(&mut self, event: &WalkedSegment) {
        let progress = {
            let mut aggregator = self.progress.write().unwrap_or_else(|e| e.into_inner());
            aggregator.apply(event);
            aggregator.progress(&event.user_id, &event.city_id)
        };

        self.notify(TrackingEvent::Walked(event.clone()));
        if let Some(progress) = progress {
            self.notify(TrackingEvent::ProgressUpdated(progress));
        }
    }

    fn finish(
        &self,
        outcome: MatchOutcome,
        event: Option<WalkedSegment>,
        advisories: Vec<Advisory>,
    ) -> FixOutcome {
        FixOutcome {
            processed: true,
            city_id: self.active_city().map(str::to_string),
            outcome,
            event,
            advisories,
        }
    }

    /// The position source failed or went silent. Tracking stays active and
    /// resumes as soon as fixes return.
    pub fn position_lost(&mut self) -> Advisory {
        warn!("[TrackingEngine] Position source unavailable");
        self.report(Advisory::PositionUnavailable);
        Advisory::PositionUnavailable
    }

    pub fn last_position(&self) -> Option<Position> {
        self.last_position
    }

    // ========================================================================
    // Progress Queries
    // ========================================================================

    /// Progress for this engine's user in a city.
    pub fn progress(&self, city_id: &str) -> Option<CityProgress> {
        self.progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .progress(&self.user_id, city_id)
    }

    pub fn all_progress(&self) -> Vec<CityProgress> {
        self.progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .all_progress()
    }

    /// Progress records as JSON (for presentation layers).
    pub fn progress_json(&self) -> Result<String> {
        self.progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .progress_json()
    }

    /// Records whose running totals disagree with a rebuild from history.
    pub fn verify_consistency(&self) -> Vec<CityProgress> {
        let drifted = self
            .progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .verify_consistency();
        if !drifted.is_empty() {
            warn!("[TrackingEngine] {} progress records drifted", drifted.len());
        }
        drifted
    }

    /// Shared handle for concurrent progress reads.
    pub fn progress_handle(&self) -> Arc<RwLock<ProgressAggregator>> {
        Arc::clone(&self.progress)
    }

    /// Shared handle to the active city's published index.
    pub fn index_handle(&self) -> Arc<SharedIndex> {
        Arc::clone(&self.active_index)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Replace the configuration. A new grid size rebuilds every cached index.
    pub fn set_config(&mut self, config: TrackingConfig) -> Result<()> {
        config.validate()?;
        let regrid = config.grid_cell_meters != self.config.grid_cell_meters;
        self.config = config;

        if regrid {
            let catalogues: Vec<Arc<CityCatalogue>> = self
                .indexes
                .values()
                .map(|index| Arc::clone(index.catalogue()))
                .collect();
            for catalogue in catalogues {
                self.install_catalogue(catalogue);
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            known_cities: self.locator.len() as u32,
            active_city: self.active_city().map(str::to_string),
            indexed_cells: self
                .active_index
                .load()
                .map(|i| i.cell_count() as u32)
                .unwrap_or(0),
            ..self.stats.clone()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
