//! Road-segment catalogues and the map-data collaborator.
//!
//! A [`CityCatalogue`] is the validated, immutable set of road segments of one
//! city. Catalogues are built once per load and shared behind `Arc` by the
//! spatial index and the progress aggregator.
//!
//! Map data itself (boundaries, segment polylines) is fetched and cached outside
//! this crate; the engine only asks a [`MapDataSource`] for it and reacts when the
//! answer is "not available yet".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{Bounds, CityBoundary, GpsPoint, Result, RoadSegment, SegmentId, WalkerError};

/// Validated road segments of a single city, ordered by segment id.
#[derive(Debug, Clone)]
pub struct CityCatalogue {
    city_id: String,
    segments: Vec<RoadSegment>,
    positions: HashMap<SegmentId, usize>,
    total_length_meters: f64,
    bounds: Option<Bounds>,
}

impl CityCatalogue {
    /// Build a catalogue from already constructed segments.
    ///
    /// # Errors
    /// `CityMismatch` if any segment belongs to another city, `DuplicateSegment`
    /// if two segments share an id.
    pub fn new(city_id: &str, mut segments: Vec<RoadSegment>) -> Result<Self> {
        if let Some(foreign) = segments.iter().find(|s| s.city_id != city_id) {
            return Err(WalkerError::CityMismatch {
                segment_id: foreign.segment_id,
                segment_city: foreign.city_id.clone(),
                catalogue_city: city_id.to_string(),
            });
        }

        segments.sort_by_key(|s| s.segment_id);
        if let Some(pair) = segments
            .windows(2)
            .find(|w| w[0].segment_id == w[1].segment_id)
        {
            return Err(WalkerError::DuplicateSegment {
                segment_id: pair[0].segment_id,
                city_id: city_id.to_string(),
            });
        }

        let positions = segments
            .iter()
            .enumerate()
            .map(|(i, s)| (s.segment_id, i))
            .collect();
        let total_length_meters = segments.iter().map(|s| s.length_meters).sum();
        let bounds = segments
            .iter()
            .map(|s| s.bounds)
            .reduce(|a, b| a.union(&b));

        debug!(
            "[Catalogue] {}: {} segments, {:.0}m of road",
            city_id,
            segments.len(),
            total_length_meters
        );

        Ok(Self {
            city_id: city_id.to_string(),
            segments,
            positions,
            total_length_meters,
            bounds,
        })
    }

    /// Build a catalogue from raw polylines, computing segment lengths.
    pub fn from_polylines(city_id: &str, polylines: Vec<(SegmentId, Vec<GpsPoint>)>) -> Result<Self> {
        #[cfg(feature = "parallel")]
        let segments: Result<Vec<RoadSegment>> = polylines
            .into_par_iter()
            .map(|(id, points)| RoadSegment::new(id, city_id, points))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let segments: Result<Vec<RoadSegment>> = polylines
            .into_iter()
            .map(|(id, points)| RoadSegment::new(id, city_id, points))
            .collect();

        Self::new(city_id, segments?)
    }

    pub fn city_id(&self) -> &str {
        &self.city_id
    }

    /// Segments ordered by id.
    pub fn segments(&self) -> &[RoadSegment] {
        &self.segments
    }

    pub fn get(&self, segment_id: SegmentId) -> Option<&RoadSegment> {
        self.positions.get(&segment_id).map(|&i| &self.segments[i])
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.positions.contains_key(&segment_id)
    }

    pub fn length_of(&self, segment_id: SegmentId) -> Option<f64> {
        self.get(segment_id).map(|s| s.length_meters)
    }

    pub fn total_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    pub fn total_length_meters(&self) -> f64 {
        self.total_length_meters
    }

    /// Bounding box of all segments, `None` for an empty catalogue.
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// External supplier of city boundaries and road-segment data.
pub trait MapDataSource: Send {
    /// All known city boundaries, in detection priority order.
    fn boundaries(&self) -> Vec<CityBoundary>;

    /// Road segments of a city, or `None` when not (yet) available.
    fn catalogue(&self, city_id: &str) -> Option<Vec<RoadSegment>>;
}

#[derive(Debug, Default)]
struct MapDataInner {
    boundaries: Vec<CityBoundary>,
    segments: HashMap<String, Vec<RoadSegment>>,
}

/// In-memory map data. Clones share the same underlying store, so data can be
/// added after the handle has been given to an engine.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMapData {
    inner: Arc<RwLock<MapDataInner>>,
}

impl InMemoryMapData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a city's boundary together with its road segments.
    pub fn add_city(&mut self, boundary: CityBoundary, segments: Vec<RoadSegment>) {
        let city_id = boundary.city_id.clone();
        self.add_boundary(boundary);
        self.set_segments(&city_id, segments);
    }

    /// Add a boundary without road data.
    pub fn add_boundary(&mut self, boundary: CityBoundary) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.boundaries.retain(|b| b.city_id != boundary.city_id);
        inner.boundaries.push(boundary);
    }

    /// Provide (or replace) a city's road segments.
    pub fn set_segments(&mut self, city_id: &str, segments: Vec<RoadSegment>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.segments.insert(city_id.to_string(), segments);
    }

    pub fn remove_segments(&mut self, city_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.segments.remove(city_id);
    }
}

impl MapDataSource for InMemoryMapData {
    fn boundaries(&self) -> Vec<CityBoundary> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.boundaries.clone()
    }

    fn catalogue(&self, city_id: &str) -> Option<Vec<RoadSegment>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.segments.get(city_id).cloned()
    }
}
