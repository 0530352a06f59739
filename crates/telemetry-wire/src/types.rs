use core::fmt;
use serde::{Deserialize, Serialize};

/// Size of the login frame: fifteen raw decimal digits.
pub const IDENTITY_FRAME_LEN: usize = 15;

/// Size of a measurement frame: five big-endian f64 values.
pub const MEASUREMENT_FRAME_LEN: usize = 40;

/// Largest value a 15-digit identity can take.
pub const IDENTITY_MAX: u64 = 999_999_999_999_999;

/// Checksum-validated device identifier (IMEI style, check digit included).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(u64);

impl Identity {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<Identity> for u64 {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}", self.0)
    }
}

/// The five measurement channels, in wire order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Temperature,
    Altitude,
    Latitude,
    Longitude,
    BatteryLevel,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Temperature,
        Field::Altitude,
        Field::Latitude,
        Field::Longitude,
        Field::BatteryLevel,
    ];

    /// Byte offset of this field inside a measurement frame.
    pub const fn offset(self) -> usize {
        self.index() * 8
    }

    /// Inclusive valid range.
    pub const fn range(self) -> (f64, f64) {
        match self {
            Field::Temperature => (-300.0, 300.0),
            Field::Altitude => (-20_000.0, 20_000.0),
            Field::Latitude => (-90.0, 90.0),
            Field::Longitude => (-180.0, 180.0),
            Field::BatteryLevel => (0.0, 100.0),
        }
    }

    pub fn contains(self, value: f64) -> bool {
        let (min, max) = self.range();
        value >= min && value <= max
    }

    pub const fn name(self) -> &'static str {
        match self {
            Field::Temperature => "temperature",
            Field::Altitude => "altitude",
            Field::Latitude => "latitude",
            Field::Longitude => "longitude",
            Field::BatteryLevel => "battery_level",
        }
    }

    const fn index(self) -> usize {
        match self {
            Field::Temperature => 0,
            Field::Altitude => 1,
            Field::Latitude => 2,
            Field::Longitude => 3,
            Field::BatteryLevel => 4,
        }
    }

    pub(crate) const fn bit(self) -> u8 {
        1 << self.index()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Most recent values reported by a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRecord {
    pub temperature: f64,
    pub altitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub battery_level: f64,
}

impl MeasurementRecord {
    pub fn get(&self, field: Field) -> f64 {
        match field {
            Field::Temperature => self.temperature,
            Field::Altitude => self.altitude,
            Field::Latitude => self.latitude,
            Field::Longitude => self.longitude,
            Field::BatteryLevel => self.battery_level,
        }
    }

    pub fn set(&mut self, field: Field, value: f64) {
        match field {
            Field::Temperature => self.temperature = value,
            Field::Altitude => self.altitude = value,
            Field::Latitude => self.latitude = value,
            Field::Longitude => self.longitude = value,
            Field::BatteryLevel => self.battery_level = value,
        }
    }

    /// Random in-range values, as sent by the simulator.
    #[cfg(feature = "sim")]
    pub fn random<R: rand::Rng + ?Sized>(rng: &mut R) -> Self {
        let mut record = Self::default();
        for field in Field::ALL {
            let (min, max) = field.range();
            record.set(field, rng.gen_range(min..=max));
        }
        record
    }
}

/// Set of fields rejected by the last decode.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InvalidFields(u8);

impl InvalidFields {
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn contains(&self, field: Field) -> bool {
        self.0 & field.bit() != 0
    }

    pub(crate) fn insert(&mut self, field: Field) {
        self.0 |= field.bit();
    }

    pub fn iter(&self) -> impl Iterator<Item = Field> + '_ {
        Field::ALL.into_iter().filter(|f| self.contains(*f))
    }
}

impl fmt::Display for InvalidFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for field in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(field.name())?;
            first = false;
        }
        Ok(())
    }
}
