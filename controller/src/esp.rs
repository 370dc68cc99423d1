use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, Configuration},
};
use esp_idf_hal::{
    gpio::{AnyOutputPin, InterruptType, Output, OutputPin, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use feeder_common::{
    default_schedules, ActuatorError, AlarmScheduler, Clock, ClockError, DebouncedButton,
    FeedActuator, FeederStatus, ManualFeedRequest, RuntimeConfig, Schedule, ScheduleStore,
    StoreError, MAX_SCHEDULES,
};

type Scheduler = AlarmScheduler<Ds3231Clock, ServoFeeder>;

const NVS_NAMESPACE: &str = "feeder";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_SCHEDULES_KEY: &str = "schedules_json";
const MAX_HTTP_BODY: usize = 4096;
const MAX_MANUAL_PORTIONS: u8 = 10;

const DS3231_ADDR: u8 = 0x68;
const REG_SECONDS: u8 = 0x00;
const REG_ALARM1_SECONDS: u8 = 0x07;
const REG_CONTROL: u8 = 0x0E;
const REG_STATUS: u8 = 0x0F;
const CONTROL_A1IE: u8 = 0b0000_0001;
const CONTROL_INTCN: u8 = 0b0000_0100;
const STATUS_A1F: u8 = 0b0000_0001;
const STATUS_OSF: u8 = 0b1000_0000;
const I2C_TIMEOUT_MS: u32 = 50;

// Main-loop tick; button sampling and servo phases need finer granularity
// than the scheduler poll interval.
const LOOP_TICK_MS: u64 = 20;
const BUTTON_DEBOUNCE_MS: u64 = 50;

// Servo sequencing, mirroring the mechanical timing of the dispenser drum.
const SERVO_POWER_ON_MS: u64 = 100;
const SERVO_MOVE_MS: u64 = 620;
const FEED_WAIT_MS: u64 = 1_000;
const SERVO_OPEN_ANGLE: u32 = 180;
const SERVO_CLOSED_ANGLE: u32 = 0;

const INDEX_HTML: &str = include_str!("../web/index.html");

#[derive(Clone)]
struct SharedState {
    scheduler: Arc<Mutex<Scheduler>>,
    schedules: Arc<Mutex<Vec<Schedule>>>,
    timezone: Arc<Mutex<String>>,
    portion_unit_grams: u8,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

/// DS3231 over I2C. Wall time lives in the RTC's registers as local time;
/// Alarm 1 is the single pending wake slot. The INT line latches `fired`
/// from the ISR; the status register's A1F bit is additionally polled so a
/// match that happened while interrupts were quiesced (sleep transitions) is
/// still observed.
struct Ds3231Clock {
    i2c: Arc<Mutex<I2cDriver<'static>>>,
    timezone: Arc<Mutex<String>>,
    fired: Arc<AtomicBool>,
}

impl Ds3231Clock {
    fn new(
        i2c: Arc<Mutex<I2cDriver<'static>>>,
        timezone: Arc<Mutex<String>>,
        fired: Arc<AtomicBool>,
    ) -> Self {
        Self {
            i2c,
            timezone,
            fired,
        }
    }

    fn offset(&self) -> FixedOffset {
        let timezone = self.timezone.lock().unwrap().clone();
        match timezone.parse::<Tz>() {
            Ok(tz) => Utc::now().with_timezone(&tz).offset().fix(),
            Err(_) => Utc.fix(),
        }
    }

    fn read_register(&self, register: u8) -> Result<u8, ClockError> {
        let mut i2c = self.i2c.lock().unwrap();
        let mut value = [0_u8; 1];
        i2c.write_read(DS3231_ADDR, &[register], &mut value, I2C_TIMEOUT_MS)
            .map_err(|err| ClockError::Bus(err.to_string()))?;
        Ok(value[0])
    }

    fn write_register(&self, register: u8, value: u8) -> Result<(), ClockError> {
        let mut i2c = self.i2c.lock().unwrap();
        i2c.write(DS3231_ADDR, &[register, value], I2C_TIMEOUT_MS)
            .map_err(|err| ClockError::Bus(err.to_string()))
    }

    fn read_datetime(&self) -> Result<DateTime<FixedOffset>, ClockError> {
        let mut raw = [0_u8; 7];
        {
            let mut i2c = self.i2c.lock().unwrap();
            i2c.write_read(DS3231_ADDR, &[REG_SECONDS], &mut raw, I2C_TIMEOUT_MS)
                .map_err(|err| ClockError::Bus(err.to_string()))?;
        }

        let second = bcd_to_dec(raw[0] & 0x7F) as u32;
        let minute = bcd_to_dec(raw[1] & 0x7F) as u32;
        let hour = bcd_to_dec(raw[2] & 0x3F) as u32;
        let day = bcd_to_dec(raw[4] & 0x3F) as u32;
        let month = bcd_to_dec(raw[5] & 0x1F) as u32;
        let year = 2000 + bcd_to_dec(raw[6]) as i32;

        let date = NaiveDate::from_ymd_opt(year, month, day).ok_or(ClockError::InvalidTime)?;
        let naive = date
            .and_hms_opt(hour, minute, second)
            .ok_or(ClockError::InvalidTime)?;

        self.offset()
            .from_local_datetime(&naive)
            .single()
            .ok_or(ClockError::InvalidTime)
    }

    fn write_datetime(&self, at: DateTime<FixedOffset>) -> Result<(), ClockError> {
        let local = at.with_timezone(&self.offset());
        let payload = [
            REG_SECONDS,
            dec_to_bcd(local.second() as u8),
            dec_to_bcd(local.minute() as u8),
            dec_to_bcd(local.hour() as u8),
            dec_to_bcd(local.weekday().num_days_from_sunday() as u8 + 1),
            dec_to_bcd(local.day() as u8),
            dec_to_bcd(local.month() as u8),
            dec_to_bcd((local.year() - 2000).clamp(0, 99) as u8),
        ];

        {
            let mut i2c = self.i2c.lock().unwrap();
            i2c.write(DS3231_ADDR, &payload, I2C_TIMEOUT_MS)
                .map_err(|err| ClockError::Bus(err.to_string()))?;
        }

        // A freshly written time is authoritative; clear the oscillator-stop
        // flag so the RTC reads as synced again.
        let status = self.read_register(REG_STATUS)?;
        self.write_register(REG_STATUS, status & !STATUS_OSF)
    }

    /// The oscillator-stop flag latches when the RTC lost power; until a
    /// time write clears it, the register contents are not trustworthy.
    fn time_synced(&self) -> bool {
        match self.read_register(REG_STATUS) {
            Ok(status) => status & STATUS_OSF == 0,
            Err(_) => false,
        }
    }
}

impl Clock for Ds3231Clock {
    fn now(&self) -> DateTime<FixedOffset> {
        match self.read_datetime() {
            Ok(now) => now,
            Err(err) => {
                warn!("rtc read failed, falling back to system time: {err}");
                Utc::now().with_timezone(&self.offset())
            }
        }
    }

    fn set_alarm(&mut self, at: DateTime<FixedOffset>) -> Result<(), ClockError> {
        let local = at.with_timezone(&self.offset());

        // Alarm 1 with all A1M bits clear: match seconds, minutes, hours and
        // day-of-month. The horizon never arms more than 7 days out, so a
        // date match cannot alias to a past day.
        let payload = [
            REG_ALARM1_SECONDS,
            dec_to_bcd(local.second() as u8),
            dec_to_bcd(local.minute() as u8),
            dec_to_bcd(local.hour() as u8),
            dec_to_bcd(local.day() as u8),
        ];
        {
            let mut i2c = self.i2c.lock().unwrap();
            i2c.write(DS3231_ADDR, &payload, I2C_TIMEOUT_MS)
                .map_err(|err| ClockError::Bus(err.to_string()))?;
        }

        // Acknowledge any stale match before enabling the interrupt.
        let status = self.read_register(REG_STATUS)?;
        self.write_register(REG_STATUS, status & !STATUS_A1F)?;
        self.write_register(REG_CONTROL, CONTROL_INTCN | CONTROL_A1IE)
    }

    fn clear_alarm(&mut self) -> Result<(), ClockError> {
        let control = self.read_register(REG_CONTROL)?;
        self.write_register(REG_CONTROL, control & !CONTROL_A1IE)
    }

    fn alarm_fired(&self) -> bool {
        if self.fired.load(Ordering::Relaxed) {
            return true;
        }

        match self.read_register(REG_STATUS) {
            Ok(status) if status & STATUS_A1F != 0 => {
                self.fired.store(true, Ordering::Relaxed);
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!("rtc status poll failed: {err}");
                false
            }
        }
    }

    fn clear_alarm_flag(&mut self) {
        self.fired.store(false, Ordering::Relaxed);
        match self.read_register(REG_STATUS) {
            Ok(status) => {
                if let Err(err) = self.write_register(REG_STATUS, status & !STATUS_A1F) {
                    warn!("failed to clear rtc alarm flag: {err}");
                }
            }
            Err(err) => warn!("failed to read rtc status for flag clear: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedPhase {
    Idle,
    PowerOn,
    Opening,
    Waiting,
    Closing,
}

/// Servo dispenser: transistor-gated supply plus one LEDC channel. `feed`
/// only queues the sequence; `pump` advances it from the main loop so no
/// phase ever blocks the scheduler.
struct ServoFeeder {
    servo: LedcDriver<'static>,
    power: PinDriver<'static, AnyOutputPin, Output>,
    phase: FeedPhase,
    phase_since: Instant,
    cycles_remaining: u8,
}

impl ServoFeeder {
    fn new(servo: LedcDriver<'static>, power: PinDriver<'static, AnyOutputPin, Output>) -> Self {
        Self {
            servo,
            power,
            phase: FeedPhase::Idle,
            phase_since: Instant::now(),
            cycles_remaining: 0,
        }
    }

    fn set_angle(&mut self, angle: u32) {
        // 0.5ms..2.5ms pulse inside a 20ms frame.
        let max_duty = self.servo.get_max_duty();
        let min = max_duty / 40;
        let span = max_duty / 10;
        let duty = min + span * angle.min(180) / 180;
        if let Err(err) = self.servo.set_duty(duty) {
            warn!("servo duty update failed: {err}");
        }
    }

    fn enter(&mut self, phase: FeedPhase) {
        self.phase = phase;
        self.phase_since = Instant::now();
    }

    fn phase_elapsed(&self, ms: u64) -> bool {
        self.phase_since.elapsed() >= Duration::from_millis(ms)
    }

    /// Advance the dispensing state machine; call every main-loop iteration.
    fn pump(&mut self) {
        match self.phase {
            FeedPhase::Idle => {}
            FeedPhase::PowerOn => {
                if self.phase_elapsed(SERVO_POWER_ON_MS) {
                    self.set_angle(SERVO_OPEN_ANGLE);
                    self.enter(FeedPhase::Opening);
                }
            }
            FeedPhase::Opening => {
                if self.phase_elapsed(SERVO_MOVE_MS) {
                    self.enter(FeedPhase::Waiting);
                }
            }
            FeedPhase::Waiting => {
                if self.phase_elapsed(FEED_WAIT_MS) {
                    self.set_angle(SERVO_CLOSED_ANGLE);
                    self.enter(FeedPhase::Closing);
                }
            }
            FeedPhase::Closing => {
                if self.phase_elapsed(SERVO_MOVE_MS) {
                    self.cycles_remaining = self.cycles_remaining.saturating_sub(1);
                    if self.cycles_remaining > 0 {
                        self.set_angle(SERVO_OPEN_ANGLE);
                        self.enter(FeedPhase::Opening);
                    } else {
                        if let Err(err) = self.power.set_low() {
                            warn!("servo power-down failed: {err}");
                        }
                        self.enter(FeedPhase::Idle);
                        info!("feed sequence complete");
                    }
                }
            }
        }
    }
}

impl FeedActuator for ServoFeeder {
    fn feed(&mut self, portion_units: u8) -> Result<(), ActuatorError> {
        if self.is_feeding() {
            return Err(ActuatorError::Busy);
        }

        self.power
            .set_high()
            .map_err(|err| ActuatorError::Hardware(err.to_string()))?;
        self.cycles_remaining = portion_units.max(1);
        self.enter(FeedPhase::PowerOn);
        info!("feed sequence started: {portion_units} portion(s)");
        Ok(())
    }

    fn is_feeding(&self) -> bool {
        self.phase != FeedPhase::Idle
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.feeder.sanitize();

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let i2c = I2cDriver::new(
        peripherals.i2c0,
        pins.gpio8,
        pins.gpio9,
        &I2cConfig::new().baudrate(100_u32.kHz().into()),
    )
    .context("failed to initialize RTC I2C bus")?;
    let i2c = Arc::new(Mutex::new(i2c));

    let alarm_flag = Arc::new(AtomicBool::new(false));
    let mut rtc_int = PinDriver::input(pins.gpio4)?;
    rtc_int.set_pull(Pull::Up)?;
    rtc_int.set_interrupt_type(InterruptType::NegEdge)?;
    {
        let flag = alarm_flag.clone();
        // ISR only latches the flag; all horizon and register work happens
        // in the main loop poll.
        unsafe {
            rtc_int.subscribe(move || {
                flag.store(true, Ordering::Relaxed);
            })?;
        }
    }
    rtc_int.enable_interrupt()?;

    let timezone = Arc::new(Mutex::new(runtime.timezone.clone()));
    let clock = Ds3231Clock::new(i2c, timezone.clone(), alarm_flag);

    let servo_timer = LedcTimerDriver::new(
        peripherals.ledc.timer0,
        &TimerConfig::default()
            .frequency(50_u32.Hz())
            .resolution(Resolution::Bits14),
    )?;
    let servo = LedcDriver::new(peripherals.ledc.channel0, servo_timer, pins.gpio3)?;
    let power = PinDriver::output(pins.gpio5.downgrade_output())?;
    let feeder = ServoFeeder::new(servo, power);

    // Manual feed button, active low.
    let mut feed_button_pin = PinDriver::input(pins.gpio6)?;
    feed_button_pin.set_pull(Pull::Up)?;
    let mut feed_button = DebouncedButton::new(Duration::from_millis(BUTTON_DEBOUNCE_MS));

    let schedules = nvs_store.load_all().unwrap_or_else(|err| {
        warn!("failed to load schedules from NVS: {err}");
        default_schedules()
    });

    let mut scheduler = AlarmScheduler::new(clock, feeder);
    scheduler.on_config_changed(&schedules);

    let shared_state = SharedState {
        scheduler: Arc::new(Mutex::new(scheduler)),
        schedules: Arc::new(Mutex::new(schedules)),
        timezone,
        portion_unit_grams: runtime.feeder.portion_unit_grams,
    };

    let wifi = start_access_point(peripherals.modem, sys_loop, nvs_partition, &runtime)?;
    let server = create_http_server(shared_state.clone(), nvs_store)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    let poll_interval = Duration::from_millis(runtime.feeder.poll_interval_ms);
    let tick = Duration::from_millis(LOOP_TICK_MS);
    let boot = Instant::now();
    let mut last_poll = Instant::now();
    loop {
        let clicked = feed_button.update(feed_button_pin.is_low(), boot.elapsed());
        {
            let mut scheduler = shared_state.scheduler.lock().unwrap();
            if clicked {
                match scheduler.actuator_mut().feed(1) {
                    Ok(()) => info!("manual feed triggered from button"),
                    Err(ActuatorError::Busy) => warn!("button press ignored: feeding in progress"),
                    Err(err) => warn!("button feed failed: {err}"),
                }
            }
            if last_poll.elapsed() >= poll_interval {
                last_poll = Instant::now();
                scheduler.poll();
            }
            scheduler.actuator_mut().pump();
        }
        rtc_int.enable_interrupt()?;
        thread::sleep(tick);
    }
}

fn start_access_point(
    modem: esp_idf_hal::modem::Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    runtime: &RuntimeConfig,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;

    let ssid = runtime
        .network
        .ap_ssid
        .as_str()
        .try_into()
        .map_err(|_| anyhow!("AP SSID too long"))?;
    let password = runtime
        .network
        .ap_pass
        .as_str()
        .try_into()
        .map_err(|_| anyhow!("AP password too long"))?;

    let auth_method = if runtime.network.ap_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid,
        password,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;
    info!("access point `{}` started", runtime.network.ap_ssid);
    Ok(wifi)
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/schedules", Method::Get, move |req| {
            let schedules = state.schedules.lock().unwrap().clone();
            write_json(req, &schedules)
        })?;
    }

    {
        let state = state.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/schedules", Method::Put, move |mut req| {
            let body = read_body(&mut req)?;
            let Ok(schedules) = serde_json::from_slice::<Vec<Schedule>>(&body) else {
                return write_error(req, 400, "Invalid schedule payload");
            };
            if schedules.len() > MAX_SCHEDULES {
                return write_error(req, 400, "Too many schedules");
            }
            if schedules.iter().any(|s| !s.validate()) {
                return write_error(req, 400, "Schedule has invalid fields");
            }

            if let Err(err) = nvs_store.save_all_schedules(&schedules) {
                warn!("failed to persist schedules: {err}");
                return write_error(req, 500, "Failed to persist schedules");
            }

            {
                let mut active = state.schedules.lock().unwrap();
                *active = schedules.clone();
            }

            // Manual contract: every schedule mutation triggers a rebuild.
            {
                let mut scheduler = state.scheduler.lock().unwrap();
                scheduler.on_config_changed(&schedules);
            }

            write_json(req, &schedules)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/feed", Method::Post, move |mut req| {
            let body = read_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<ManualFeedRequest>(&body) else {
                return write_error(req, 400, "Invalid feed payload");
            };
            if request.portions == 0 || request.portions > MAX_MANUAL_PORTIONS {
                return write_error(req, 400, "portions out of range");
            }

            let result = {
                let mut scheduler = state.scheduler.lock().unwrap();
                scheduler.actuator_mut().feed(request.portions)
            };

            match result {
                Ok(()) => {
                    let status = build_status(&state);
                    write_json(req, &status)
                }
                Err(ActuatorError::Busy) => {
                    write_error(req, 409, "A feeding is already in progress")
                }
                Err(err) => {
                    warn!("manual feed failed: {err}");
                    write_error(req, 500, "Feed actuation failed")
                }
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time", Method::Get, move |req| {
            let (time_synced, now_epoch) = {
                let scheduler = state.scheduler.lock().unwrap();
                let synced = scheduler.clock().time_synced();
                (synced, scheduler.clock().now().timestamp())
            };
            let timezone = state.timezone.lock().unwrap().clone();
            write_json(
                req,
                &TimeStatus {
                    time_synced,
                    timezone,
                    now_epoch,
                },
            )
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time", Method::Put, move |mut req| {
            let body = read_body(&mut req)?;
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) else {
                return write_error(req, 400, "Invalid time payload");
            };
            let Some(epoch) = value.get("epoch").and_then(|v| v.as_i64()) else {
                return write_error(req, 400, "Missing 'epoch' field");
            };
            let Some(at) = DateTime::from_timestamp(epoch, 0) else {
                return write_error(req, 400, "Epoch out of range");
            };

            let schedules = state.schedules.lock().unwrap().clone();
            let mut scheduler = state.scheduler.lock().unwrap();
            if let Err(err) = scheduler.clock().write_datetime(at.fixed_offset()) {
                warn!("failed to set rtc time: {err}");
                return write_error(req, 500, "Failed to write RTC time");
            }

            // Time jumped under the horizon; everything derived is stale.
            scheduler.on_config_changed(&schedules);
            drop(scheduler);

            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    Ok(server)
}

fn build_status(state: &SharedState) -> FeederStatus {
    let scheduler = state.scheduler.lock().unwrap();
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
        .unwrap()
        .iter()
        .filter(|s| s.enabled)
        .count();
    let timezone = state.timezone.lock().unwrap().clone();

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
        portion_unit_grams: state.portion_unit_grams,
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_all_schedules(&self, schedules: &[Schedule]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let payload =
            serde_json::to_string(schedules).map_err(|err| StoreError::Backend(err.to_string()))?;
        nvs.set_str(NVS_SCHEDULES_KEY, &payload)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

impl ScheduleStore for NvsStore {
    fn load_all(&self) -> Result<Vec<Schedule>, StoreError> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut buffer = vec![0_u8; 4096];

        match nvs
            .get_str(NVS_SCHEDULES_KEY, &mut buffer)
            .map_err(|err| StoreError::Backend(err.to_string()))?
        {
            Some(value) => serde_json::from_str::<Vec<Schedule>>(value)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(default_schedules()),
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

fn read_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    if req.content_len().unwrap_or(0) as usize > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        let read = req.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() > MAX_HTTP_BODY {
            return Err(anyhow!("request body too large"));
        }
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn bcd_to_dec(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

fn dec_to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}
