use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("invalid coordinate: lat={0}, lon={1}")]
    InvalidCoordinate(f64, f64),
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

typed_id!(DispatchId);
typed_id!(MessageId);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn millis_until(self, later: Self) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

/// Validated geographic coordinates
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLatLon")]
pub struct LatLon {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct RawLatLon {
    lat: f64,
    lon: f64,
}

impl TryFrom<RawLatLon> for LatLon {
    type Error = ModelError;

    fn try_from(raw: RawLatLon) -> Result<Self, Self::Error> {
        Self::new(raw.lat, raw.lon)
    }
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Result<Self, ModelError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(ModelError::InvalidCoordinate(lat, lon));
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(ModelError::InvalidCoordinate(lat, lon));
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    /// Great-circle distance in meters.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        const EPSILON: f64 = 1e-10;

        if (self.lat - other.lat).abs() < EPSILON && (self.lon - other.lon).abs() < EPSILON {
            return 0.0;
        }

        let lat1_rad = self.lat.to_radians();
        let lat2_rad = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lon = (other.lon - self.lon).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();

        let result = EARTH_RADIUS_M * c;
        if result.is_finite() {
            result
        } else {
            f64::MAX
        }
    }
}

// --- Stops and actions ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Approaching,
    Arrived,
    Departed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_id: i32,
    pub stop_id: i32,
    pub action_type: ActionType,
    #[serde(default)]
    pub radius_feet: u32,
    #[serde(default)]
    pub eta: Option<UnixTimeMs>,
    #[serde(default)]
    pub driver_form_id: Option<i32>,
    #[serde(default)]
    pub forced_form_id: Option<i32>,
    #[serde(default)]
    pub response_sent: bool,
}

impl Action {
    pub fn new(stop_id: i32, action_id: i32, action_type: ActionType) -> Self {
        Self {
            action_id,
            stop_id,
            action_type,
            radius_feet: 0,
            eta: None,
            driver_form_id: None,
            forced_form_id: None,
            response_sent: false,
        }
    }

    pub fn with_eta(mut self, eta: UnixTimeMs) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_driver_form(mut self, form_id: i32) -> Self {
        self.driver_form_id = Some(form_id);
        self
    }

    pub fn has_form(&self) -> bool {
        self.driver_form_id.is_some() || self.forced_form_id.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub stop_id: i32,
    pub dispatch_id: DispatchId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sequenced: i32,
    /// 0 = live, 1 = soft-deleted
    #[serde(default)]
    pub deleted: i32,
    #[serde(default)]
    pub completed_time: Option<UnixTimeMs>,
    #[serde(default)]
    pub location: Option<LatLon>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Stop {
    pub fn new(stop_id: i32, dispatch_id: impl Into<DispatchId>) -> Self {
        Self {
            stop_id,
            dispatch_id: dispatch_id.into(),
            name: String::new(),
            sequenced: 1,
            deleted: 0,
            completed_time: None,
            location: None,
            actions: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_deleted(mut self, deleted: i32) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn with_location(mut self, location: LatLon) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted == 1
    }

    pub fn is_completed(&self) -> bool {
        self.completed_time.is_some()
    }

    pub fn action(&self, action_type: ActionType) -> Option<&Action> {
        self.actions.iter().find(|a| a.action_type == action_type)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    pub disp_id: DispatchId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trip_start_time: Option<UnixTimeMs>,
    #[serde(default)]
    pub created_time: UnixTimeMs,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub stops_count_of_dispatch: u32,
}

impl Dispatch {
    pub fn new(disp_id: impl Into<DispatchId>, name: impl Into<String>) -> Self {
        Self {
            disp_id: disp_id.into(),
            name: name.into(),
            trip_start_time: None,
            created_time: UnixTimeMs::default(),
            is_completed: false,
            is_active: false,
            stops_count_of_dispatch: 0,
        }
    }

    pub fn with_stop_count(mut self, count: u32) -> Self {
        self.stops_count_of_dispatch = count;
        self
    }
}
