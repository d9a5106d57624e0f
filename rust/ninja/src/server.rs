use crate::{
    auth::Caller,
    config::AppConfig,
    db::{self, PgPool},
    error::{Result, ServiceError},
    fetcher::{acl::AclRules, CompiledQuery, EventWindow, FetchOptions, QueryEngine, DEFAULT_LIMIT},
    query::Catalog,
    quota::{self, history, plan::PricingPlan, RateLimiter},
    representation::{Dataset, Representation},
    state::AppState,
    time::parse_date_time,
};
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderValue, Method},
    middleware,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use serde_with::{serde_as, NoneAsEmptyString};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

const ROOT_DOCUMENT: &str = include_str!("../resources/root.json");
const OPENAPI_DOCUMENT: &str = include_str!("../resources/openapi3.yml");

const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BUCKET_IDLE_TTL: Duration = Duration::from_secs(600);

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let pool = db::connect_pool(&config).await?;
        Self::with_pool(config, pool)
    }

    /// Wires the shared state around an existing pool.
    pub fn with_pool(config: AppConfig, pool: PgPool) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let catalog = Arc::new(Catalog::standard()?);
        let acl = Arc::new(match &config.acl_rules_dir {
            Some(dir) => AclRules::from_dir(dir.clone()),
            None => AclRules::bundled(),
        });
        let engine = QueryEngine::new(pool, Arc::clone(&config), catalog, acl);
        let quota = Arc::new(RateLimiter::new(config.quota.clone()));
        let state = AppState::new(Arc::clone(&config), engine, quota);

        Ok(Self { config, state })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(Self::root))
            .route("/apispec", get(Self::apispec))
            .route("/healthz", get(Self::health))
            .route("/:repr", get(Self::list_types))
            .route("/:repr/:types", get(Self::by_types))
            .route("/:repr/:types/:segment", get(Self::by_datatypes))
            .route("/:repr/:types/:datatypes/:segment", get(Self::latest_or_window))
            .route("/:repr/:types/:datatypes/:from/:to", get(Self::history))
            .fallback(Self::not_found)
            .with_state(self.state.clone())
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                quota::layer::enforce,
            ))
            .layer(cors(&self.config))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        spawn_bucket_sweeper(Arc::clone(&self.state.quota));
        info!(%addr, "ninja listening");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    async fn health() -> Json<Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn root(State(state): State<AppState>) -> impl IntoResponse {
        (
            [(header::CONTENT_TYPE, "application/json;charset=UTF-8")],
            ROOT_DOCUMENT.replace("__URL__", &state.config.base_url),
        )
    }

    async fn apispec(State(state): State<AppState>) -> impl IntoResponse {
        (
            [(header::CONTENT_TYPE, "application/yaml;charset=UTF-8")],
            OPENAPI_DOCUMENT.replace("__ODH_SERVER_URL__", &state.config.host_url),
        )
    }

    async fn not_found() -> ServiceError {
        ServiceError::NotFound("no route matches the requested path".into())
    }

    async fn list_types(
        State(state): State<AppState>,
        Path(repr): Path<String>,
    ) -> Result<Json<Vec<Value>>> {
        let representation: Representation = repr.parse()?;
        let rows = state.engine.list_types(representation, &repr).await?;
        Ok(Json(rows))
    }

    /// `/{repr}/{types}`: stations, edges or events of the given types.
    async fn by_types(
        State(state): State<AppState>,
        Extension(caller): Extension<Caller>,
        Path((repr, types)): Path<(String, String)>,
        query: QueryParams,
    ) -> Result<Json<Value>> {
        let params = unpack(query)?;
        let options = params.options(repr.parse()?, &caller);
        let fetcher = state.engine.fetcher(&options);
        let compiled = match options.representation.dataset {
            Dataset::Node => fetcher.stations(&types)?,
            Dataset::Edge => fetcher.edges(&types)?,
            Dataset::Event => fetcher.events(&types, EventWindow::All)?,
        };
        respond(&state, compiled, &options, params.timezone()).await
    }

    /// `/{repr}/{types}/{datatypes}` for nodes, `/{repr}/{origins}/{latest|from}`
    /// for events.
    async fn by_datatypes(
        State(state): State<AppState>,
        Extension(caller): Extension<Caller>,
        Path((repr, types, segment)): Path<(String, String, String)>,
        query: QueryParams,
    ) -> Result<Json<Value>> {
        let params = unpack(query)?;
        let options = params.options(repr.parse()?, &caller);
        let fetcher = state.engine.fetcher(&options);
        let compiled = match options.representation.dataset {
            Dataset::Event => fetcher.events(&types, event_window(&segment)?)?,
            Dataset::Node | Dataset::Edge => fetcher.stations_and_types(&types, &segment)?,
        };
        respond(&state, compiled, &options, params.timezone()).await
    }

    /// Latest measurements, station metadata history, or events within `[from, to]`.
    async fn latest_or_window(
        State(state): State<AppState>,
        Extension(caller): Extension<Caller>,
        Extension(plan): Extension<PricingPlan>,
        Path((repr, types, datatypes, segment)): Path<(String, String, String, String)>,
        query: QueryParams,
    ) -> Result<Json<Value>> {
        let params = unpack(query)?;
        let options = params.options(repr.parse()?, &caller);
        let fetcher = state.engine.fetcher(&options);

        let compiled = if options.representation.is_event() {
            let window = EventWindow::Between(parse_date_time(&datatypes)?, parse_date_time(&segment)?);
            fetcher.events(&types, window)?
        } else if datatypes == "metadata" && segment == "history" {
            let from = params.from.as_deref().map(parse_date_time).transpose()?;
            let to = params.to.as_deref().map(parse_date_time).transpose()?;
            if let Some(from) = from {
                history::check(&state.config.quota, plan, from, to)?;
            }
            fetcher.stations_metadata_history(&types, from, to)?
        } else if segment == "latest" {
            fetcher.measurements(&types, &datatypes, None)?
        } else {
            return Err(ServiceError::NotFound(format!(
                "'{segment}' is neither 'latest' nor a time window"
            )));
        };
        respond(&state, compiled, &options, params.timezone()).await
    }

    async fn history(
        State(state): State<AppState>,
        Extension(caller): Extension<Caller>,
        Extension(plan): Extension<PricingPlan>,
        Path((repr, types, datatypes, from, to)): Path<(String, String, String, String, String)>,
        query: QueryParams,
    ) -> Result<Json<Value>> {
        let params = unpack(query)?;
        let options = params.options(repr.parse()?, &caller);
        let from = parse_date_time(&from)?;
        let to = parse_date_time(&to)?;
        history::check(&state.config.quota, plan, from, Some(to))?;

        let compiled = state
            .engine
            .fetcher(&options)
            .measurements(&types, &datatypes, Some((from, to)))?;
        respond(&state, compiled, &options, params.timezone()).await
    }
}

type QueryParams = std::result::Result<Query<RequestParams>, QueryRejection>;

/// Query string of a data request. Empty values count as absent.
#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RequestParams {
    #[serde_as(as = "NoneAsEmptyString")]
    pub limit: Option<i64>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub offset: Option<i64>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub select: Option<String>,
    #[serde(rename = "where")]
    #[serde_as(as = "NoneAsEmptyString")]
    pub filter: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub shownull: Option<bool>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub distinct: Option<bool>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub timezone: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub from: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub to: Option<String>,
}

impl RequestParams {
    pub fn options(&self, representation: Representation, caller: &Caller) -> FetchOptions {
        FetchOptions {
            representation,
            limit: self.limit.unwrap_or(DEFAULT_LIMIT),
            offset: self.offset.unwrap_or(0),
            select: self.select.clone(),
            filter: self.filter.clone(),
            show_null: self.shownull.unwrap_or(false),
            distinct: self.distinct.unwrap_or(true),
            roles: caller.roles.clone(),
        }
    }

    pub fn timezone(&self) -> &str {
        self.timezone.as_deref().unwrap_or("UTC")
    }
}

fn unpack(query: QueryParams) -> Result<RequestParams> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ServiceError::InvalidParameter(rejection.body_text()))
}

fn event_window(segment: &str) -> Result<EventWindow> {
    if segment == "latest" {
        return Ok(EventWindow::Latest);
    }
    parse_date_time(segment).map(EventWindow::From)
}

async fn respond(
    state: &AppState,
    compiled: CompiledQuery,
    options: &FetchOptions,
    timezone: &str,
) -> Result<Json<Value>> {
    let data = state.engine.execute(compiled, timezone).await?;
    Ok(Json(json!({
        "offset": options.offset,
        "limit": options.limit,
        "data": data,
    })))
}

fn cors(config: &AppConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any);
    match &config.allowed_origins {
        Some(origins) => layer.allow_origin(AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )),
        None => layer.allow_origin(Any),
    }
}

fn spawn_bucket_sweeper(quota: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BUCKET_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let evicted = quota.evict_idle(BUCKET_IDLE_TTL);
            if evicted > 0 {
                debug!(evicted, remaining = quota.len(), "evicted idle rate-limit buckets");
            }
        }
    });
}
