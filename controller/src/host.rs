use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use feeder_common::{
    default_schedules, ActuatorError, AlarmScheduler, Clock, ClockError, FeedActuator,
    FeederStatus, ManualFeedRequest, RuntimeConfig, Schedule, ScheduleStore, StoreError,
    MAX_SCHEDULES,
};

type Scheduler = AlarmScheduler<SoftClock, ServoLogActuator>;

const MAX_MANUAL_PORTIONS: u8 = 10;

#[derive(Clone)]
struct AppState {
    scheduler: Arc<Mutex<Scheduler>>,
    schedules: Arc<Mutex<Vec<Schedule>>>,
    timezone: Arc<StdMutex<String>>,
    store: Arc<Mutex<AppStore>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize)]
struct NetworkConfigView {
    #[serde(rename = "apSsid")]
    ap_ssid: String,
    #[serde(rename = "apPassSet")]
    ap_pass_set: bool,
    hostname: String,
    #[serde(rename = "httpPort")]
    http_port: u16,
}

#[derive(Debug, Deserialize)]
struct NetworkConfigUpdate {
    #[serde(rename = "apSsid")]
    ap_ssid: String,
    #[serde(rename = "apPass", default)]
    ap_pass: Option<String>,
    hostname: String,
    #[serde(rename = "httpPort")]
    http_port: u16,
}

/// Software stand-in for the DS3231: wall time comes from the system clock in
/// the configured timezone, the single alarm register is a field, and the
/// fired flag latches once wall time passes the armed instant — surviving
/// until explicitly acknowledged, exactly like the hardware A1F bit.
struct SoftClock {
    timezone: Arc<StdMutex<String>>,
    alarm: Option<DateTime<FixedOffset>>,
    fired: AtomicBool,
}

impl SoftClock {
    fn new(timezone: Arc<StdMutex<String>>) -> Self {
        Self {
            timezone,
            alarm: None,
            fired: AtomicBool::new(false),
        }
    }

    fn time_synced(&self) -> bool {
        self.timezone.lock().unwrap().parse::<Tz>().is_ok()
    }
}

impl Clock for SoftClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let timezone = self.timezone.lock().unwrap().clone();
        match timezone.parse::<Tz>() {
            Ok(tz) => {
                let local = Utc::now().with_timezone(&tz);
                local.with_timezone(&local.offset().fix())
            }
            Err(_) => Utc::now().fixed_offset(),
        }
    }

    fn set_alarm(&mut self, at: DateTime<FixedOffset>) -> Result<(), ClockError> {
        self.alarm = Some(at);
        Ok(())
    }

    fn clear_alarm(&mut self) -> Result<(), ClockError> {
        self.alarm = None;
        Ok(())
    }

    fn alarm_fired(&self) -> bool {
        if let Some(at) = self.alarm {
            if self.now() >= at {
                self.fired.store(true, Ordering::Relaxed);
            }
        }
        self.fired.load(Ordering::Relaxed)
    }

    fn clear_alarm_flag(&mut self) {
        self.fired.store(false, Ordering::Relaxed);
    }
}

/// Logs dispensing instead of driving servos, but models the busy window so
/// the scheduler's busy-handling paths behave like on the device.
struct ServoLogActuator {
    feed_hold_ms: u64,
    feeding_until: Option<Instant>,
}

impl ServoLogActuator {
    fn new(feed_hold_ms: u64) -> Self {
        Self {
            feed_hold_ms,
            feeding_until: None,
        }
    }
}

impl FeedActuator for ServoLogActuator {
    fn feed(&mut self, portion_units: u8) -> Result<(), ActuatorError> {
        if self.is_feeding() {
            return Err(ActuatorError::Busy);
        }

        let hold = self.feed_hold_ms.saturating_mul(portion_units as u64);
        self.feeding_until = Some(Instant::now() + Duration::from_millis(hold));
        info!("dispensing {portion_units} portion(s) (simulated, {hold}ms)");
        Ok(())
    }

    fn is_feeding(&self) -> bool {
        self.feeding_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

/// JSON files under `FEEDER_DATA_DIR` (default `./.feeder`); missing files
/// yield defaults so a fresh checkout boots with the factory schedule set.
struct AppStore {
    runtime_path: PathBuf,
    schedules_path: PathBuf,
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("FEEDER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.feeder"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
            schedules_path: data_dir.join("schedules.json"),
        }
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match std::fs::read(&self.runtime_path) {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        if let Some(parent) = self.runtime_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        std::fs::write(&self.runtime_path, payload)?;
        Ok(())
    }

    fn save_all_schedules(&self, schedules: &[Schedule]) -> Result<(), StoreError> {
        if let Some(parent) = self.schedules_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        let payload = serde_json::to_vec_pretty(schedules)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        std::fs::write(&self.schedules_path, payload)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }
}

impl ScheduleStore for AppStore {
    fn load_all(&self) -> Result<Vec<Schedule>, StoreError> {
        match std::fs::read(&self.schedules_path) {
            Ok(raw) => serde_json::from_slice::<Vec<Schedule>>(&raw)
                .map_err(|err| StoreError::Backend(err.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(default_schedules()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn save(&mut self, index: usize, schedule: &Schedule) -> Result<(), StoreError> {
        let mut schedules = self.load_all()?;
        if index >= schedules.len() {
            return Err(StoreError::IndexOutOfRange(index));
        }
        schedules[index] = *schedule;
        self.save_all_schedules(&schedules)
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.feeder.sanitize();

    let schedules = store.load_all().unwrap_or_else(|err| {
        warn!("failed to load schedules from store: {err:#}");
        default_schedules()
    });

    let timezone = Arc::new(StdMutex::new(runtime.timezone.clone()));
    let clock = SoftClock::new(timezone.clone());
    let actuator = ServoLogActuator::new(runtime.feeder.feed_hold_ms);

    let mut scheduler = AlarmScheduler::new(clock, actuator);
    scheduler.on_config_changed(&schedules);

    let app_state = AppState {
        scheduler: Arc::new(Mutex::new(scheduler)),
        schedules: Arc::new(Mutex::new(schedules)),
        timezone,
        store: Arc::new(Mutex::new(store)),
    };

    spawn_scheduler_loop(app_state.clone(), runtime.feeder.poll_interval_ms);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/schedules",
            get(handle_get_schedules).put(handle_put_schedules),
        )
        .route("/api/feed", post(handle_manual_feed))
        .route("/api/time", get(handle_get_time))
        .route("/api/timezone", put(handle_put_timezone))
        .route(
            "/api/network",
            get(handle_get_network).put(handle_put_network),
        )
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("FEEDER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.http_port);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind feeder server at {addr}"))?;

    info!("feeder listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_scheduler_loop(app_state: AppState, poll_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(poll_interval_ms));

        loop {
            interval.tick().await;
            let mut scheduler = app_state.scheduler.lock().await;
            scheduler.poll();
        }
    });
}

async fn build_status(state: &AppState) -> FeederStatus {
    let scheduler = state.scheduler.lock().await;
    let (armed, next_alarm_epoch) = FeederStatus::arm_state_fields(scheduler.state());
    let now = scheduler.clock().now();
    let next_schedule_id = scheduler
        .horizon()
        .next_future(now)
        .map(|occurrence| occurrence.schedule_id);
    let pending = scheduler.horizon().valid_count();
    let is_feeding = scheduler.actuator().is_feeding();
    let time_synced = scheduler.clock().time_synced();
    drop(scheduler);

    let enabled_schedules = state
        .schedules
        .lock()
        .await
        .iter()
        .filter(|s| s.enabled)
        .count();

    let (timezone, portion_unit_grams) = {
        let timezone = state.timezone.lock().unwrap().clone();
        let store = state.store.lock().await;
        let grams = store
            .load_runtime_config()
            .map(|runtime| runtime.feeder.portion_unit_grams)
            .unwrap_or(12);
        (timezone, grams)
    };

    FeederStatus {
        armed,
        next_alarm_epoch,
        next_schedule_id,
        enabled_schedules,
        pending_occurrences: pending,
        is_feeding,
        time_synced,
        timezone,
        now_epoch: now.timestamp(),
        portion_unit_grams,
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_status(&state).await)
}

async fn handle_get_schedules(State(state): State<AppState>) -> impl IntoResponse {
    let schedules = state.schedules.lock().await.clone();
    Json(schedules)
}

async fn handle_put_schedules(
    State(state): State<AppState>,
    Json(schedules): Json<Vec<Schedule>>,
) -> impl IntoResponse {
    if schedules.len() > MAX_SCHEDULES {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("at most {MAX_SCHEDULES} schedules are supported"),
        );
    }
    if let Some(bad) = schedules.iter().find(|s| !s.validate()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("schedule {} has invalid fields", bad.id),
        );
    }

    let mut enabled_ids: Vec<u8> = schedules.iter().filter(|s| s.enabled).map(|s| s.id).collect();
    enabled_ids.sort_unstable();
    let unique_before = enabled_ids.len();
    enabled_ids.dedup();
    if enabled_ids.len() != unique_before {
        return error_response(
            StatusCode::BAD_REQUEST,
            "enabled schedules must have unique ids",
        );
    }

    {
        let store = state.store.lock().await;
        if let Err(err) = store.save_all_schedules(&schedules) {
            warn!("failed to persist schedules: {err}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist schedules",
            );
        }
    }

    {
        let mut active = state.schedules.lock().await;
        *active = schedules.clone();
    }

    // Manual contract: every schedule mutation is followed by a rebuild.
    {
        let mut scheduler = state.scheduler.lock().await;
        scheduler.on_config_changed(&schedules);
    }

    handle_get_schedules(State(state)).await.into_response()
}

async fn handle_manual_feed(
    State(state): State<AppState>,
    Json(request): Json<ManualFeedRequest>,
) -> impl IntoResponse {
    if request.portions == 0 || request.portions > MAX_MANUAL_PORTIONS {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("portions must be between 1 and {MAX_MANUAL_PORTIONS}"),
        );
    }

    let result = {
        let mut scheduler = state.scheduler.lock().await;
        scheduler.actuator_mut().feed(request.portions)
    };

    match result {
        Ok(()) => handle_get_status(State(state)).await.into_response(),
        Err(ActuatorError::Busy) => {
            error_response(StatusCode::CONFLICT, "A feeding is already in progress")
        }
        Err(err) => {
            warn!("manual feed failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Feed actuation failed")
        }
    }
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.scheduler.lock().await;
    let time_synced = scheduler.clock().time_synced();
    let now_epoch = scheduler.clock().now().timestamp();
    drop(scheduler);

    let timezone = state.timezone.lock().unwrap().clone();
    Json(TimeStatus {
        time_synced,
        timezone,
        now_epoch,
    })
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    Json(update): Json<TimezoneUpdate>,
) -> impl IntoResponse {
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }

    {
        let mut timezone = state.timezone.lock().unwrap();
        *timezone = update.timezone;
    }

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    // The wall clock moved under the horizon; rebuild against the new base.
    {
        let schedules = state.schedules.lock().await.clone();
        let mut scheduler = state.scheduler.lock().await;
        scheduler.on_config_changed(&schedules);
    }

    handle_get_time(State(state)).await.into_response()
}

async fn handle_get_network(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    let runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load network config from store: {err:#}");
        RuntimeConfig::default()
    });
    Json(build_network_config_view(&runtime))
}

async fn handle_put_network(
    State(state): State<AppState>,
    Json(update): Json<NetworkConfigUpdate>,
) -> impl IntoResponse {
    if update.ap_ssid.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "apSsid cannot be empty");
    }
    if update.http_port == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "httpPort must be between 1 and 65535",
        );
    }

    let store = state.store.lock().await;
    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load existing runtime config for update: {err:#}");
        RuntimeConfig::default()
    });

    runtime.network.ap_ssid = update.ap_ssid;
    if let Some(pass) = update.ap_pass {
        runtime.network.ap_pass = pass;
    }
    runtime.network.hostname = update.hostname;
    runtime.network.http_port = update.http_port;

    if let Err(err) = store.save_runtime_config(&runtime) {
        warn!("failed to persist network config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist network settings",
        );
    }

    Json(build_network_config_view(&runtime)).into_response()
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let timezone = state.timezone.lock().unwrap().clone();
    let store = state.store.lock().await;
    let mut runtime = store.load_runtime_config()?;
    runtime.timezone = timezone;
    store.save_runtime_config(&runtime)
}

fn build_network_config_view(runtime: &RuntimeConfig) -> NetworkConfigView {
    NetworkConfigView {
        ap_ssid: runtime.network.ap_ssid.clone(),
        ap_pass_set: !runtime.network.ap_pass.is_empty(),
        hostname: runtime.network.hostname.clone(),
        http_port: runtime.network.http_port,
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
