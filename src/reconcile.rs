//! One driver cycle: reconnect, read, exchange, write.
//!
//! Device values only reach the [`Slate`] when a device actually reported
//! them, and a target is only written when the Slate already holds an observed
//! value for it that differs. A device that keeps failing is dropped and
//! retried on the reconnect interval.

use crate::device::{DeviceClient, DeviceConnector, DeviceError, DeviceKind, FieldMap};
use crate::exchange::TargetExchange;
use heat_protocol::channel::{estimated_heater_watts, names, ChannelValue, Slate};
use heat_protocol::logging::should_log_failure;
use heat_protocol::sync::{TargetVector, TransportError, BATTERY_CHARGE_POWER};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Absent,
    Initializing,
    Connected,
    Failing,
}

/// Where a target field is written: device, and the device field that is
/// also the Slate channel holding its observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRoute {
    pub target: &'static str,
    pub device: DeviceKind,
    pub channel: &'static str,
}

pub const WRITE_ROUTES: [WriteRoute; 6] = [
    WriteRoute {
        target: names::HEATER_TARGET_TEMP,
        device: DeviceKind::Heater,
        channel: names::HEATER_TARGET_TEMP,
    },
    WriteRoute {
        target: names::HEATER_POWER,
        device: DeviceKind::Heater,
        channel: names::HEATER_POWER,
    },
    WriteRoute {
        target: names::HEATER_OSCILLATION,
        device: DeviceKind::Heater,
        channel: names::HEATER_OSCILLATION,
    },
    WriteRoute {
        target: names::HEATER_DISPLAY,
        device: DeviceKind::Heater,
        channel: names::HEATER_DISPLAY,
    },
    WriteRoute {
        target: names::PLUG_ON,
        device: DeviceKind::Plug,
        channel: names::PLUG_ON,
    },
    WriteRoute {
        target: BATTERY_CHARGE_POWER,
        device: DeviceKind::Battery,
        channel: names::BATTERY_AC_CHARGE_WATTS,
    },
];

pub fn route_for(target: &str) -> Option<&'static WriteRoute> {
    WRITE_ROUTES.iter().find(|r| r.target == target)
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    pub reconnect_interval: u64,
    pub failure_threshold: u32,
    pub device_timeout: Duration,
    pub exchange_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            reconnect_interval: 30,
            failure_threshold: 5,
            device_timeout: Duration::from_secs(5),
            exchange_timeout: Duration::from_secs(10),
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(DeviceError::Timeout))
}

pub struct DeviceSlot {
    kind: DeviceKind,
    connector: Box<dyn DeviceConnector>,
    client: Option<Box<dyn DeviceClient>>,
    state: HandleState,
    failures: u32,
    read_every: u64,
}

impl DeviceSlot {
    pub fn new(kind: DeviceKind, connector: Box<dyn DeviceConnector>, read_every: u64) -> DeviceSlot {
        DeviceSlot {
            kind,
            connector,
            client: None,
            state: HandleState::Absent,
            failures: 0,
            read_every: read_every.max(1),
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn is_due(&self, cycle: u64) -> bool {
        cycle % self.read_every == 0
    }

    async fn connect(&mut self, limit: Duration) -> bool {
        self.state = HandleState::Initializing;
        match with_timeout(limit, self.connector.connect()).await {
            Ok(client) => {
                self.client = Some(client);
                self.state = HandleState::Connected;
                self.failures = 0;
                info!(device = %self.kind, "device connected");
                true
            }
            Err(e) => {
                self.state = HandleState::Absent;
                warn!(device = %self.kind, "device connect failed: {}", e);
                false
            }
        }
    }

    fn record_success(&mut self) {
        if self.state == HandleState::Failing {
            info!(device = %self.kind, failures = self.failures, "device recovered");
        }
        self.failures = 0;
        self.state = HandleState::Connected;
    }

    /// Counts a failure and drops the handle at `threshold`. Returns true when dropped.
    fn record_failure(&mut self, op: &str, error: &DeviceError, threshold: u32) -> bool {
        self.failures += 1;
        if should_log_failure(self.failures) {
            warn!(device = %self.kind, failures = self.failures, "{} error: {}", op, error);
        }
        if self.failures >= threshold {
            warn!(device = %self.kind, failures = self.failures, "too many failures, dropping handle");
            self.client = None;
            self.state = HandleState::Absent;
            return true;
        }
        self.state = HandleState::Failing;
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Applied,
    ControlDisabled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub reconnected: Vec<DeviceKind>,
    pub reads_ok: Vec<DeviceKind>,
    pub reads_failed: Vec<DeviceKind>,
    pub dropped: Vec<DeviceKind>,
    pub exchange: ExchangeOutcome,
    pub writes: Vec<(&'static str, ChannelValue)>,
    pub write_failures: usize,
}

impl CycleReport {
    fn new(cycle: u64) -> CycleReport {
        CycleReport {
            cycle,
            reconnected: Vec::new(),
            reads_ok: Vec::new(),
            reads_failed: Vec::new(),
            dropped: Vec::new(),
            exchange: ExchangeOutcome::Failed("not attempted".to_string()),
            writes: Vec::new(),
            write_failures: 0,
        }
    }
}

fn derive_heater_watts(fields: &FieldMap, slate: &mut Slate) {
    let level = fields
        .get(names::HEATER_ACTIVE_HEAT_LEVEL)
        .and_then(Option::as_ref)
        .and_then(ChannelValue::as_str);
    if let Some(watts) = level.and_then(estimated_heater_watts) {
        slate.set(names::HEATER_POWER_WATTS, ChannelValue::Int(watts));
    }
}

pub struct Reconciler<E> {
    slots: Vec<DeviceSlot>,
    exchange: E,
    slate: Slate,
    cycle: u64,
    config: ReconcileConfig,
    exchange_failures: u32,
}

impl<E: TargetExchange> Reconciler<E> {
    pub fn new(slots: Vec<DeviceSlot>, exchange: E, config: ReconcileConfig) -> Reconciler<E> {
        Reconciler {
            slots,
            exchange,
            slate: Slate::new(),
            cycle: 0,
            config,
            exchange_failures: 0,
        }
    }

    pub fn slate(&self) -> &Slate {
        &self.slate
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn slot(&self, kind: DeviceKind) -> Option<&DeviceSlot> {
        self.slots.iter().find(|s| s.kind == kind)
    }

    /// Initial connection attempt for every device. Failures are left for the
    /// reconnect interval.
    pub async fn start(&mut self) -> Vec<DeviceKind> {
        let mut connected = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.connect(self.config.device_timeout).await {
                connected.push(slot.kind);
            }
        }
        connected
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let cycle = self.cycle;
        let mut report = CycleReport::new(cycle);

        if cycle % self.config.reconnect_interval.max(1) == 0 {
            for slot in self.slots.iter_mut().filter(|s| s.client.is_none()) {
                info!(device = %slot.kind, cycle, "retrying device");
                if slot.connect(self.config.device_timeout).await {
                    report.reconnected.push(slot.kind);
                }
            }
        }

        self.read_devices(&mut report).await;

        let targets = match self.exchange_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                report.exchange = ExchangeOutcome::Failed(e.to_string());
                return report;
            }
        };

        if !targets.driver_control_enabled {
            debug!(cycle, "driver control disabled, skipping writes");
            report.exchange = ExchangeOutcome::ControlDisabled;
            return report;
        }
        report.exchange = ExchangeOutcome::Applied;
        self.apply_targets(&targets, &mut report).await;
        report
    }

    async fn read_devices(&mut self, report: &mut CycleReport) {
        let cycle = self.cycle;
        let threshold = self.config.failure_threshold;
        for slot in self.slots.iter_mut() {
            if !slot.is_due(cycle) {
                continue;
            }
            let Some(client) = slot.client.as_ref() else {
                continue;
            };
            let result = with_timeout(self.config.device_timeout, client.read())
                .await
                .and_then(|fields| {
                    if fields.is_empty() {
                        Err(DeviceError::EmptyResponse)
                    } else {
                        Ok(fields)
                    }
                });
            match result {
                Ok(fields) => {
                    if slot.kind == DeviceKind::Heater {
                        derive_heater_watts(&fields, &mut self.slate);
                    }
                    let updated = self.slate.apply_reading(fields);
                    debug!(device = %slot.kind, updated, "read");
                    slot.record_success();
                    report.reads_ok.push(slot.kind);
                }
                Err(e) => {
                    report.reads_failed.push(slot.kind);
                    if slot.record_failure("read", &e, threshold) {
                        report.dropped.push(slot.kind);
                    }
                }
            }
        }
    }

    async fn exchange_targets(&mut self) -> Result<TargetVector, TransportError> {
        let result = tokio::time::timeout(self.config.exchange_timeout, self.exchange.exchange(&self.slate))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        match result {
            Ok(response) => {
                if self.exchange_failures > 0 {
                    info!(failures = self.exchange_failures, "target exchange recovered");
                }
                self.exchange_failures = 0;
                Ok(response.targets)
            }
            Err(e) => {
                self.exchange_failures += 1;
                if should_log_failure(self.exchange_failures) {
                    warn!(failures = self.exchange_failures, "target exchange failed: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn apply_targets(&mut self, targets: &TargetVector, report: &mut CycleReport) {
        let threshold = self.config.failure_threshold;
        for (field, value) in targets.commands() {
            let Some(route) = route_for(field) else {
                continue;
            };
            let Some(slot) = self.slots.iter_mut().find(|s| s.kind == route.device) else {
                continue;
            };
            let Some(client) = slot.client.as_ref() else {
                continue;
            };
            // Never observed: writing would be blind.
            let Some(current) = self.slate.get(route.channel) else {
                continue;
            };
            if *current == value {
                continue;
            }

            match with_timeout(self.config.device_timeout, client.write(route.channel, &value)).await {
                Ok(()) => {
                    info!(device = %slot.kind, field = route.channel, %value, "set");
                    slot.record_success();
                    self.slate.set(route.channel, value.clone());
                    report.writes.push((route.target, value));
                }
                Err(e) => {
                    report.write_failures += 1;
                    if slot.record_failure(&format!("set {}", route.channel), &e, threshold) {
                        report.dropped.push(slot.kind);
                    }
                }
            }
        }
    }
}
