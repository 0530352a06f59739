use crate::clock::{Clock, SystemClock};
use crate::error::{RegistryError, Result};
use crate::metrics::RegistryMetrics;
use crate::types::{
    EntrySummary, ReadingEvent, RegistryEntry, RegistryReply, ReplySender, TimestampedReading,
};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use telemetry_wire::{decode_fields, Identity, MeasurementRecord, MEASUREMENT_FRAME_LEN};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

type ReadingCallback = Arc<dyn Fn(&ReadingEvent) + Send + Sync>;

struct Inner {
    entries: Mutex<HashMap<Identity, RegistryEntry>>,
    clock: Arc<dyn Clock>,
    metrics: Option<RegistryMetrics>,
    on_reading: Option<ReadingCallback>,
}

/// Who is connected, and their most recent reading.
///
/// Cloning yields another handle to the same map. Mutations are meant to be
/// driven by a single [`RegistryService`](crate::RegistryService); every
/// access, reads included, goes through the same mutex.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
pub struct RegistryBuilder {
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<RegistryMetrics>,
    on_reading: Option<ReadingCallback>,
}

impl RegistryBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn metrics(mut self, metrics: RegistryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Called after every committed reading, outside the map lock.
    pub fn on_reading<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ReadingEvent) + Send + Sync + 'static,
    {
        self.on_reading = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> DeviceRegistry {
        DeviceRegistry {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                metrics: self.metrics,
                on_reading: self.on_reading,
            }),
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DeviceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn metrics(&self) -> Option<&RegistryMetrics> {
        self.inner.metrics.as_ref()
    }

    /// Admit `identity`, answering on `reply`.
    ///
    /// A second login for a connected identity gets `Kill` on its own channel;
    /// the existing entry is left alone.
    pub fn register(&self, identity: Identity, reply: ReplySender) -> Result<()> {
        self.guarded("register", || {
            let mut entries = self.lock();
            if entries.contains_key(&identity) {
                drop(entries);
                deliver(&reply, RegistryReply::Kill, identity);
                if let Some(m) = self.metrics() {
                    m.rejected_logins.inc();
                }
                return Err(RegistryError::AlreadyRegistered(identity));
            }
            entries.insert(
                identity,
                RegistryEntry {
                    reply: reply.clone(),
                    connected_at: self.inner.clock.now_epoch_nanos(),
                    last: None,
                },
            );
            self.update_gauge(entries.len());
            drop(entries);

            deliver(&reply, RegistryReply::Welcome, identity);
            info!(%identity, "device logged in");
            Ok(())
        })
    }

    pub fn deregister(&self, identity: Identity) -> Result<()> {
        self.guarded("deregister", || {
            let mut entries = self.lock();
            if entries.remove(&identity).is_none() {
                return Err(RegistryError::UnknownDevice(identity));
            }
            self.update_gauge(entries.len());
            drop(entries);
            info!(%identity, "device logged out");
            Ok(())
        })
    }

    /// Remove `identity` and tell its session to stop.
    pub fn evict(&self, identity: Identity) -> Result<()> {
        self.guarded("evict", || {
            let mut entries = self.lock();
            let entry = entries
                .remove(&identity)
                .ok_or(RegistryError::UnknownDevice(identity))?;
            self.update_gauge(entries.len());
            drop(entries);
            deliver(&entry.reply, RegistryReply::Kill, identity);
            info!(%identity, "device evicted");
            Ok(())
        })
    }

    /// Decode `payload` and store it as the latest reading for `identity`.
    ///
    /// The frame is decoded into a fresh record. Out-of-range fields keep the
    /// record's default and the reading is still stored; the call then returns
    /// `MeasurementInvalid` naming those fields.
    pub fn handle_reading(&self, identity: Identity, payload: &[u8]) -> Result<()> {
        self.guarded("handle_reading", || {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(&identity)
                .ok_or(RegistryError::UnknownDevice(identity))?;

            let frame: &[u8; MEASUREMENT_FRAME_LEN] =
                payload
                    .try_into()
                    .map_err(|_| RegistryError::InternalFault {
                        op: "handle_reading",
                        message: format!(
                            "payload is {} bytes, expected {MEASUREMENT_FRAME_LEN}",
                            payload.len()
                        ),
                    })?;

            let mut reading = MeasurementRecord::default();
            let invalid = decode_fields(frame, &mut reading);
            let stamped = TimestampedReading {
                timestamp_epoch: self.inner.clock.now_epoch_nanos(),
                reading,
            };
            entry.last = Some(stamped);
            drop(entries);

            if let Some(m) = self.metrics() {
                m.readings.inc();
                if !invalid.is_empty() {
                    m.invalid_readings.inc();
                }
            }
            if let Some(callback) = &self.inner.on_reading {
                callback(&ReadingEvent {
                    identity,
                    timestamp_epoch: stamped.timestamp_epoch,
                    reading,
                });
            }

            if invalid.is_empty() {
                Ok(())
            } else {
                Err(RegistryError::MeasurementInvalid {
                    identity,
                    fields: invalid,
                })
            }
        })
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_connected(&self, identity: Identity) -> bool {
        self.lock().contains_key(&identity)
    }

    pub fn lookup(&self, identity: Identity) -> Option<EntrySummary> {
        self.lock()
            .get(&identity)
            .map(|entry| summarize(identity, entry))
    }

    /// Copy of the latest reading, if the device is connected and has sent one.
    pub fn last_reading(&self, identity: Identity) -> Option<(i64, MeasurementRecord)> {
        self.lock()
            .get(&identity)
            .and_then(|entry| entry.last)
            .map(|last| (last.timestamp_epoch, last.reading))
    }

    pub fn snapshot(&self) -> Vec<EntrySummary> {
        let mut out: Vec<EntrySummary> = self
            .lock()
            .iter()
            .map(|(identity, entry)| summarize(*identity, entry))
            .collect();
        out.sort_by_key(|s| s.identity);
        out
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Identity, RegistryEntry>> {
        // A panic while holding the lock leaves the map itself consistent:
        // every mutation is a single insert/remove/assignment.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update_gauge(&self, len: usize) {
        if let Some(m) = self.metrics() {
            m.connected_devices.set(i64::try_from(len).unwrap_or(i64::MAX));
        }
    }

    /// Run one mutation, turning a panic into an error for that call only.
    fn guarded<T>(&self, op: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(op, %message, "registry command faulted");
                if let Some(m) = self.metrics() {
                    m.internal_faults.inc();
                }
                Err(RegistryError::InternalFault { op, message })
            }
        }
    }
}

fn summarize(identity: Identity, entry: &RegistryEntry) -> EntrySummary {
    EntrySummary {
        identity,
        connected_at: entry.connected_at,
        last_reading_at: entry.last.map(|l| l.timestamp_epoch),
    }
}

fn deliver(reply: &ReplySender, message: RegistryReply, identity: Identity) {
    match reply.try_send(message) {
        Ok(()) => debug!(%identity, ?message, "reply sent"),
        Err(TrySendError::Full(_)) => warn!(%identity, ?message, "reply channel full, dropped"),
        Err(TrySendError::Closed(_)) => debug!(%identity, ?message, "session already gone"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
