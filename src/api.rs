//! HTTP adapter over the risk engine.
//!
//! Endpoints:
//! - GET    /health                    - liveness and hazard count
//! - POST   /api/v1/routing/evaluate   - score one route
//! - POST   /api/v1/routing/compare    - rank candidate routes
//! - POST   /api/v1/routing/plan       - plan every profile on the road graph, then rank
//! - GET    /api/v1/hazards/nearby     - hazards around a point
//! - GET    /api/v1/hazards/types      - active hazards per type
//! - GET    /api/v1/hazards            - hazards filtered by bbox, type, severity
//! - POST   /api/v1/hazards            - upsert hazard records
//! - DELETE /api/v1/hazards/:id        - remove a hazard

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use geo::{Coord, HaversineDistance, Point, Rect};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::compare::{trade_off, RankedRoute, RiskLabel, RouteComparator, TradeOffSummary};
use crate::config::{GridConfig, RouteProfile, ServiceConfig};
use crate::error::EngineError;
use crate::evaluator::{EvaluateOptions, Measure, PenaltyContribution, RiskEvaluator};
use crate::geometry::{check_coord, RouteGeometry};
use crate::graph::NavigationGraph;
use crate::hazard::{HazardId, HazardRecord, HazardType, Severity};
use crate::safety::HazardGrid;
use crate::store::{HazardQuery, InMemoryHazardStore};

// Shared State for concurrency
pub struct AppState {
    pub store: Arc<InMemoryHazardStore>,
    pub comparator: RouteComparator<InMemoryHazardStore>,
    pub network: Option<Arc<NavigationGraph>>,
    pub grid: GridConfig,
    pub profiles: Vec<RouteProfile>,
}

impl AppState {
    pub fn new(
        store: Arc<InMemoryHazardStore>,
        network: Option<Arc<NavigationGraph>>,
        config: &ServiceConfig,
    ) -> Result<Self, EngineError> {
        let evaluator = RiskEvaluator::new(Arc::clone(&store), &config.engine)?;
        let comparator = RouteComparator::new(evaluator, config.engine.labels.clone())?;
        Ok(Self {
            store,
            comparator,
            network,
            grid: config.grid.clone(),
            profiles: config.profiles.clone(),
        })
    }

    fn evaluator(&self) -> &RiskEvaluator<InMemoryHazardStore> {
        self.comparator.evaluator()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    // Allows browser clients on other origins to call the API
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/routing/evaluate", post(evaluate_route))
        .route("/api/v1/routing/compare", post(compare_routes))
        .route("/api/v1/routing/plan", post(plan_routes))
        .route("/api/v1/hazards", get(list_hazards).post(upsert_hazards))
        .route("/api/v1/hazards/nearby", get(nearby_hazards))
        .route("/api/v1/hazards/types", get(hazard_types))
        .route("/api/v1/hazards/:id", delete(delete_hazard))
        .layer(cors)
        .with_state(state)
}

// --- Errors ---

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    NotFound(String),
    NetworkUnavailable,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            ApiError::Engine(EngineError::InvalidGeometry(msg)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_geometry", msg)
            }
            ApiError::Engine(EngineError::InvalidArgument(msg)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_argument", msg)
            }
            ApiError::Engine(EngineError::StoreUnavailable(msg)) => {
                warn!(%msg, "hazard store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    "hazard data temporarily unavailable".to_string(),
                )
            }
            ApiError::Engine(EngineError::Cancelled) => (
                StatusCode::GATEWAY_TIMEOUT,
                "cancelled",
                "hazard query timed out".to_string(),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::NetworkUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "network_unavailable",
                "road network not loaded".to_string(),
            ),
        };
        let body = ErrorBody {
            error: code.to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}

// --- API DTOs ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Deserialize)]
pub struct EvaluateRequest {
    pub route: Vec<[f64; 2]>, // [lon, lat] standard for GeoJSON
    #[serde(default)]
    pub depart_time: Option<DateTime<Utc>>,
    /// Hazard types to steer around and score; every type when omitted.
    #[serde(default)]
    pub avoid: Option<Vec<HazardType>>,
}

#[derive(Deserialize)]
pub struct CompareRequest {
    pub routes: Vec<Vec<[f64; 2]>>,
    #[serde(default)]
    pub depart_time: Option<DateTime<Utc>>,
    /// Hazard types to steer around and score; every type when omitted.
    #[serde(default)]
    pub avoid: Option<Vec<HazardType>>,
}

#[derive(Deserialize)]
pub struct PlanRequest {
    pub origin: Coordinate,
    pub destination: Coordinate,
    #[serde(default)]
    pub depart_time: Option<DateTime<Utc>>,
    /// Hazard types to steer around and score; every type when omitted.
    #[serde(default)]
    pub avoid: Option<Vec<HazardType>>,
}

#[derive(Deserialize)]
pub struct NearbyParams {
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,
}

fn default_radius_km() -> f64 {
    10.0
}

/// `?bbox=min_lon,min_lat,max_lon,max_lat&types=flood,ice&min_severity=severe`
#[derive(Deserialize)]
pub struct HazardListParams {
    #[serde(default)]
    pub bbox: Option<String>,
    #[serde(default)]
    pub types: Option<String>,
    #[serde(default)]
    pub min_severity: Option<Severity>,
}

impl HazardListParams {
    fn query(&self) -> Result<HazardQuery, EngineError> {
        let bbox = self.bbox.as_deref().map(parse_bbox).transpose()?;
        let hazard_types = self
            .types
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .filter(|t| !t.trim().is_empty())
                    .map(str::parse::<HazardType>)
                    .collect::<Result<BTreeSet<_>, _>>()
            })
            .transpose()?;
        Ok(HazardQuery {
            bbox,
            hazard_types,
            min_severity: self.min_severity,
        })
    }
}

fn parse_bbox(raw: &str) -> Result<Rect<f64>, EngineError> {
    let parts = raw
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| EngineError::InvalidArgument(format!("bbox {raw:?} is not four numbers")))?;
    let [min_lon, min_lat, max_lon, max_lat] = parts[..] else {
        return Err(EngineError::InvalidArgument(format!(
            "bbox {raw:?} must be min_lon,min_lat,max_lon,max_lat"
        )));
    };
    check_coord(min_lon, min_lat)?;
    check_coord(max_lon, max_lat)?;
    if min_lon > max_lon || min_lat > max_lat {
        return Err(EngineError::InvalidArgument(format!(
            "bbox {raw:?} has min above max"
        )));
    }
    Ok(Rect::new(
        Coord { x: min_lon, y: min_lat },
        Coord { x: max_lon, y: max_lat },
    ))
}

#[derive(Serialize, Deserialize)]
pub struct ContributionView {
    pub hazard_id: HazardId,
    pub hazard_type: HazardType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    pub penalty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&PenaltyContribution> for ContributionView {
    fn from(c: &PenaltyContribution) -> Self {
        let (overlap_m, distance_m) = match c.measure {
            Measure::Overlap(m) => (Some(m), None),
            Measure::Proximity(m) => (None, Some(m)),
        };
        Self {
            hazard_id: c.hazard.id,
            hazard_type: c.hazard.hazard_type,
            severity: c.hazard.severity,
            overlap_m,
            distance_m,
            penalty: c.penalty,
            source: c.hazard.source.clone(),
            description: c.hazard.description.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct RouteRiskView {
    pub rank: usize,
    pub input_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub score: f64,
    pub label: RiskLabel,
    pub length_m: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Vec<[f64; 2]>>,
    pub risk_factors: BTreeMap<HazardType, f64>,
    pub contributions: Vec<ContributionView>,
}

impl From<&RankedRoute> for RouteRiskView {
    fn from(r: &RankedRoute) -> Self {
        Self {
            rank: r.rank,
            input_index: r.input_index,
            profile: None,
            score: r.risk.score,
            label: r.label,
            length_m: r.route.length_m(),
            geometry: None,
            risk_factors: r.risk.risk_factors(),
            contributions: r.risk.contributions.iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct EvaluateResponse {
    pub score: f64,
    pub label: RiskLabel,
    pub length_m: f64,
    pub risk_factors: BTreeMap<HazardType, f64>,
    pub contributions: Vec<ContributionView>,
}

#[derive(Serialize)]
pub struct CompareResponse {
    pub routes: Vec<RouteRiskView>,
    pub trade_off: Option<TradeOffSummary>,
}

#[derive(Serialize)]
pub struct NearbyResponse {
    pub hazards: Vec<ContributionView>,
    pub total_count: usize,
}

#[derive(Serialize)]
pub struct HazardListResponse {
    pub hazards: Vec<HazardRecord>,
    pub total_count: usize,
}

#[derive(Serialize)]
pub struct TypesResponse {
    pub types: BTreeMap<HazardType, usize>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct UpsertResponse {
    pub accepted: usize,
}

fn parse_routes(raw: Vec<Vec<[f64; 2]>>) -> Result<Vec<RouteGeometry>, ApiError> {
    raw.into_iter()
        .enumerate()
        .map(|(i, vertices)| {
            RouteGeometry::new(vertices).map_err(|e| match e {
                EngineError::InvalidGeometry(msg) => {
                    EngineError::InvalidGeometry(format!("route {i}: {msg}"))
                }
                other => other,
            })
        })
        .collect::<Result<_, _>>()
        .map_err(ApiError::from)
}

fn options_at(
    depart_time: Option<DateTime<Utc>>,
    avoid: Option<Vec<HazardType>>,
) -> EvaluateOptions {
    let options = EvaluateOptions::at(depart_time.unwrap_or_else(Utc::now));
    match avoid {
        Some(types) => options.with_hazard_types(types),
        None => options,
    }
}

// --- Handlers ---

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let hazards = state.store.len()?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "hazards": hazards,
        "network_loaded": state.network.is_some(),
    })))
}

async fn evaluate_route(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    let route = RouteGeometry::new(payload.route)?;
    let risk = state
        .evaluator()
        .evaluate_with(&route, options_at(payload.depart_time, payload.avoid))
        .await?;

    Ok(Json(EvaluateResponse {
        score: risk.score,
        label: state.comparator.label(risk.score),
        length_m: route.length_m(),
        risk_factors: risk.risk_factors(),
        contributions: risk.contributions.iter().map(Into::into).collect(),
    }))
}

async fn compare_routes(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CompareRequest>,
) -> Result<Json<CompareResponse>, ApiError> {
    let routes = parse_routes(payload.routes)?;
    let ranked = state
        .comparator
        .compare_with(routes, options_at(payload.depart_time, payload.avoid))
        .await?;

    Ok(Json(CompareResponse {
        routes: ranked.iter().map(Into::into).collect(),
        trade_off: trade_off(&ranked),
    }))
}

async fn plan_routes(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PlanRequest>,
) -> Result<Json<CompareResponse>, ApiError> {
    let network = state.network.as_ref().ok_or(ApiError::NetworkUnavailable)?;
    let origin = [payload.origin.lon, payload.origin.lat];
    let destination = [payload.destination.lon, payload.destination.lat];
    for [lon, lat] in [origin, destination] {
        check_coord(lon, lat)?;
    }
    let options = options_at(payload.depart_time, payload.avoid);

    // 1. Paint hazards around the origin/destination corridor
    let a = Point::new(origin[0], origin[1]);
    let b = Point::new(destination[0], destination[1]);
    let centre = Point::new((a.x() + b.x()) / 2.0, (a.y() + b.y()) / 2.0);
    let radius_m = a.haversine_distance(&b) / 2.0 + state.grid.corridor_margin_m;
    let nearby = state
        .evaluator()
        .hazards_near(centre, radius_m, options.clone())
        .await?;
    let grid = HazardGrid::rasterize(
        nearby.iter().map(|c| c.hazard.as_ref()),
        state.evaluator().model(),
        &state.grid,
    )?;

    // 2. One candidate per profile
    let mut profiles = Vec::new();
    let mut candidates = Vec::new();
    for profile in &state.profiles {
        match network.plan(origin, destination, profile.alpha, &grid) {
            Ok(Some(planned)) => {
                profiles.push(profile.name.clone());
                candidates.push(planned.geometry);
            }
            Ok(None) => {}
            Err(e) => warn!(profile = %profile.name, error = %e, "profile planning failed"),
        }
    }
    if candidates.is_empty() {
        return Err(ApiError::NotFound(
            "no route between origin and destination".to_string(),
        ));
    }
    info!(
        candidates = candidates.len(),
        hazards = nearby.len(),
        cells = grid.len(),
        "planned route candidates"
    );

    // 3. Rank them
    let ranked = state.comparator.compare_with(candidates, options).await?;
    let routes = ranked
        .iter()
        .map(|r| RouteRiskView {
            profile: profiles.get(r.input_index).cloned(),
            geometry: Some(r.route.vertices().collect()),
            ..RouteRiskView::from(r)
        })
        .collect();

    Ok(Json(CompareResponse {
        routes,
        trade_off: trade_off(&ranked),
    }))
}

async fn nearby_hazards(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NearbyParams>,
) -> Result<Json<NearbyResponse>, ApiError> {
    if !(0.1..=100.0).contains(&params.radius_km) {
        return Err(EngineError::InvalidArgument(format!(
            "radius_km must be between 0.1 and 100, got {}",
            params.radius_km
        ))
        .into());
    }
    let hazards = state
        .evaluator()
        .hazards_near(
            Point::new(params.lon, params.lat),
            params.radius_km * 1_000.0,
            EvaluateOptions::default(),
        )
        .await?;

    Ok(Json(NearbyResponse {
        total_count: hazards.len(),
        hazards: hazards.iter().map(Into::into).collect(),
    }))
}

async fn list_hazards(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HazardListParams>,
) -> Result<Json<HazardListResponse>, ApiError> {
    let query = params.query()?;
    let hazards: Vec<HazardRecord> = state
        .store
        .list(&query, Utc::now())?
        .iter()
        .map(|record| HazardRecord::clone(record))
        .collect();
    Ok(Json(HazardListResponse {
        total_count: hazards.len(),
        hazards,
    }))
}

async fn hazard_types(State(state): State<Arc<AppState>>) -> Result<Json<TypesResponse>, ApiError> {
    let types = state.store.type_summary(Utc::now())?;
    Ok(Json(TypesResponse {
        total: types.values().sum(),
        types,
    }))
}

async fn upsert_hazards(
    State(state): State<Arc<AppState>>,
    Json(records): Json<Vec<HazardRecord>>,
) -> Result<Json<UpsertResponse>, ApiError> {
    let accepted = state.store.upsert_many(records)?;
    Ok(Json(UpsertResponse { accepted }))
}

async fn delete_hazard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<HazardId>,
) -> Result<StatusCode, ApiError> {
    match state.store.remove(id)? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::NotFound(format!("hazard {id} not found"))),
    }
}
