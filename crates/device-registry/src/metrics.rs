use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct RegistryMetrics {
    pub connected_devices: IntGauge,
    pub readings: IntCounter,
    pub invalid_readings: IntCounter,
    pub rejected_logins: IntCounter,
    pub admission_rejected: IntCounter,
    pub internal_faults: IntCounter,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub dev: RegistryMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let connected_devices =
            IntGauge::new("thermo_connected_devices", "Devices currently logged in")
                .map_err(|e| format!("metrics init error: {e}"))?;
        let readings = IntCounter::new("thermo_readings_total", "Readings committed")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let invalid_readings = IntCounter::new(
            "thermo_invalid_readings_total",
            "Readings with at least one out-of-range field",
        )
        .map_err(|e| format!("metrics init error: {e}"))?;
        let rejected_logins =
            IntCounter::new("thermo_rejected_logins_total", "Duplicate logins rejected")
                .map_err(|e| format!("metrics init error: {e}"))?;
        let admission_rejected = IntCounter::new(
            "thermo_admission_rejected_total",
            "Connections closed at the admission cap",
        )
        .map_err(|e| format!("metrics init error: {e}"))?;
        let internal_faults =
            IntCounter::new("thermo_internal_faults_total", "Commands that faulted")
                .map_err(|e| format!("metrics init error: {e}"))?;
        let dev = RegistryMetrics {
            connected_devices,
            readings,
            invalid_readings,
            rejected_logins,
            admission_rejected,
            internal_faults,
        };
        let _ = registry.register(Box::new(dev.connected_devices.clone()));
        let _ = registry.register(Box::new(dev.readings.clone()));
        let _ = registry.register(Box::new(dev.invalid_readings.clone()));
        let _ = registry.register(Box::new(dev.rejected_logins.clone()));
        let _ = registry.register(Box::new(dev.admission_rejected.clone()));
        let _ = registry.register(Box::new(dev.internal_faults.clone()));
        Ok(Self { registry, dev })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
