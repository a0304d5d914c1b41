//! Business configuration: schedules, breaks, holidays and the service/agent
//! catalog, loaded as one immutable, versioned snapshot.
//!
//! Structural mistakes (unknown time zone, zero capacity, duplicate ids) are
//! rejected at load. Schedule ranges are only parsed here; whether they make
//! sense is decided by the schedule resolver, which treats a bad day as closed.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Weekday};
use chrono_tz::Tz;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use tracing::warn;

use crate::limits::*;
use crate::model::{AgentId, Ms, ServiceId, MINUTE_MS};

const MINUTES_PER_DAY: u32 = 24 * 60;

fn yes() -> bool {
    true
}

fn one() -> u32 {
    1
}

fn default_slot_step() -> u32 {
    15
}

fn default_horizon_days() -> u32 {
    90
}

fn default_lock_timeout_ms() -> u64 {
    250
}

/// Parse `"HH:MM"` into minutes since midnight. `"24:00"` is accepted as an end.
pub fn parse_time_of_day(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

fn de_time_of_day<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let s = String::deserialize(d)?;
    parse_time_of_day(&s).ok_or_else(|| de::Error::custom(format!("invalid time of day: {s:?}")))
}

fn de_timezone<'de, D: Deserializer<'de>>(d: D) -> Result<Tz, D::Error> {
    let s = String::deserialize(d)?;
    s.parse::<Tz>()
        .map_err(|e| de::Error::custom(format!("invalid time zone {s:?}: {e}")))
}

/// `[start, end)` in minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeRange {
    #[serde(deserialize_with = "de_time_of_day")]
    pub start: u32,
    #[serde(deserialize_with = "de_time_of_day")]
    pub end: u32,
    #[serde(default = "yes")]
    pub enabled: bool,
}

impl TimeRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            enabled: true,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end && self.end <= MINUTES_PER_DAY
    }
}

/// True when every range is well formed and no two ranges overlap.
pub fn ranges_well_formed(ranges: &[TimeRange]) -> bool {
    if !ranges.iter().all(TimeRange::is_well_formed) {
        return false;
    }
    let mut sorted: Vec<&TimeRange> = ranges.iter().collect();
    sorted.sort_by_key(|r| r.start);
    sorted.windows(2).all(|w| w[0].end <= w[1].start)
}

/// Working hours per weekday. A missing day is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeeklySchedule {
    #[serde(default)]
    pub mon: Vec<TimeRange>,
    #[serde(default)]
    pub tue: Vec<TimeRange>,
    #[serde(default)]
    pub wed: Vec<TimeRange>,
    #[serde(default)]
    pub thu: Vec<TimeRange>,
    #[serde(default)]
    pub fri: Vec<TimeRange>,
    #[serde(default)]
    pub sat: Vec<TimeRange>,
    #[serde(default)]
    pub sun: Vec<TimeRange>,
}

impl WeeklySchedule {
    pub fn day(&self, weekday: Weekday) -> &[TimeRange] {
        match weekday {
            Weekday::Mon => &self.mon,
            Weekday::Tue => &self.tue,
            Weekday::Wed => &self.wed,
            Weekday::Thu => &self.thu,
            Weekday::Fri => &self.fri,
            Weekday::Sat => &self.sat,
            Weekday::Sun => &self.sun,
        }
    }

    fn days(&self) -> [(Weekday, &[TimeRange]); 7] {
        [
            (Weekday::Mon, &self.mon),
            (Weekday::Tue, &self.tue),
            (Weekday::Wed, &self.wed),
            (Weekday::Thu, &self.thu),
            (Weekday::Fri, &self.fri),
            (Weekday::Sat, &self.sat),
            (Weekday::Sun, &self.sun),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    pub id: ServiceId,
    #[serde(default)]
    pub name: Option<String>,
    pub duration_minutes: u32,
    #[serde(default)]
    pub buffer_before_minutes: u32,
    #[serde(default)]
    pub buffer_after_minutes: u32,
    #[serde(default = "one")]
    pub capacity: u32,
    #[serde(default = "yes")]
    pub uses_global_schedule: bool,
    #[serde(default)]
    pub schedule: Option<WeeklySchedule>,
    #[serde(default = "yes")]
    pub active: bool,
}

impl Service {
    /// Duration plus both buffers.
    pub fn occupied_minutes(&self) -> u32 {
        self.duration_minutes
            .saturating_add(self.buffer_before_minutes)
            .saturating_add(self.buffer_after_minutes)
    }

    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn buffer_before_ms(&self) -> Ms {
        self.buffer_before_minutes as Ms * MINUTE_MS
    }

    pub fn buffer_after_ms(&self) -> Ms {
        self.buffer_after_minutes as Ms * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub schedule: Option<WeeklySchedule>,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub services: BTreeSet<ServiceId>,
}

impl Agent {
    pub fn performs(&self, service_id: ServiceId) -> bool {
        self.services.contains(&service_id)
    }
}

/// One-off break for one agent on one date.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentBreak {
    pub agent_id: AgentId,
    pub date: NaiveDate,
    #[serde(deserialize_with = "de_time_of_day")]
    pub start: u32,
    #[serde(deserialize_with = "de_time_of_day")]
    pub end: u32,
}

impl AgentBreak {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// Closed date range, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Holiday {
    #[serde(default)]
    pub name: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Matches every year on the same month/day range; may wrap New Year.
    #[serde(default)]
    pub recurring_yearly: bool,
    /// `None` closes everyone.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

impl Holiday {
    pub fn covers(&self, date: NaiveDate, agent_id: Option<AgentId>) -> bool {
        if self.agent_id.is_some() && self.agent_id != agent_id {
            return false;
        }
        if !self.recurring_yearly {
            return self.start <= date && date <= self.end;
        }
        let key = |d: NaiveDate| d.month() * 100 + d.day();
        let (from, to, k) = (key(self.start), key(self.end), key(date));
        if from <= to {
            from <= k && k <= to
        } else {
            k >= from || k <= to
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Monotonic; a reload must carry a higher version.
    pub version: u64,
    /// Business time zone. Local schedule times are read in this zone.
    #[serde(deserialize_with = "de_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_slot_step")]
    pub slot_step_minutes: u32,
    #[serde(default = "default_horizon_days")]
    pub booking_horizon_days: u32,
    #[serde(default = "default_lock_timeout_ms")]
    pub reservation_lock_timeout_ms: u64,
    /// Global weekly schedule.
    #[serde(default)]
    pub schedule: WeeklySchedule,
    /// Global breaks, repeated every day.
    #[serde(default)]
    pub breaks: Vec<TimeRange>,
    #[serde(default)]
    pub holidays: Vec<Holiday>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub agent_breaks: Vec<AgentBreak>,
}

impl Configuration {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Configuration =
            toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        config.warn_malformed_ranges();
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::from_toml_str(&contents)
    }

    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn slot_step_ms(&self) -> Ms {
        self.slot_step_minutes as Ms * MINUTE_MS
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_lock_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SLOT_STEP_MINUTES..=MAX_SLOT_STEP_MINUTES).contains(&self.slot_step_minutes) {
            return Err(ConfigError::Invalid(format!(
                "slot_step_minutes must be within {MIN_SLOT_STEP_MINUTES}..={MAX_SLOT_STEP_MINUTES}, got {}",
                self.slot_step_minutes
            )));
        }
        if self.booking_horizon_days == 0 || self.booking_horizon_days > MAX_BOOKING_HORIZON_DAYS {
            return Err(ConfigError::Invalid(format!(
                "booking_horizon_days must be within 1..={MAX_BOOKING_HORIZON_DAYS}"
            )));
        }
        if self.reservation_lock_timeout_ms == 0
            || self.reservation_lock_timeout_ms > MAX_LOCK_TIMEOUT_MS
        {
            return Err(ConfigError::Invalid(format!(
                "reservation_lock_timeout_ms must be within 1..={MAX_LOCK_TIMEOUT_MS}"
            )));
        }

        let mut service_ids = HashSet::new();
        for s in &self.services {
            if !service_ids.insert(s.id) {
                return Err(ConfigError::Invalid(format!("duplicate service id {}", s.id)));
            }
            if s.capacity == 0 {
                return Err(ConfigError::Invalid(format!("service {}: capacity must be >= 1", s.id)));
            }
            if s.duration_minutes == 0 {
                return Err(ConfigError::Invalid(format!("service {}: duration must be > 0", s.id)));
            }
            let occupied = s
                .duration_minutes
                .checked_add(s.buffer_before_minutes)
                .and_then(|m| m.checked_add(s.buffer_after_minutes));
            if occupied.is_none_or(|m| m > MAX_OCCUPIED_MINUTES) {
                return Err(ConfigError::Invalid(format!(
                    "service {}: duration plus buffers exceeds one day",
                    s.id
                )));
            }
        }

        let mut agent_ids = HashSet::new();
        for a in &self.agents {
            if !agent_ids.insert(a.id) {
                return Err(ConfigError::Invalid(format!("duplicate agent id {}", a.id)));
            }
            if let Some(unknown) = a.services.iter().find(|id| !service_ids.contains(*id)) {
                return Err(ConfigError::Invalid(format!(
                    "agent {} performs unknown service {unknown}",
                    a.id
                )));
            }
        }

        for b in &self.agent_breaks {
            if !agent_ids.contains(&b.agent_id) {
                return Err(ConfigError::Invalid(format!("break for unknown agent {}", b.agent_id)));
            }
        }
        for h in &self.holidays {
            if !h.recurring_yearly && h.start > h.end {
                return Err(ConfigError::Invalid(format!(
                    "holiday {} ends before it starts",
                    h.name.as_deref().unwrap_or("<unnamed>")
                )));
            }
        }
        Ok(())
    }

    /// Ranges that will close their day at resolve time are worth a log line now.
    fn warn_malformed_ranges(&self) {
        let check = |owner: String, schedule: &WeeklySchedule| {
            for (weekday, ranges) in schedule.days() {
                if !ranges_well_formed(ranges) {
                    warn!(version = self.version, "{owner}: malformed hours on {weekday}, day will be closed");
                }
            }
        };
        check("global schedule".into(), &self.schedule);
        for s in &self.services {
            if let Some(schedule) = &s.schedule {
                check(format!("service {}", s.id), schedule);
            }
        }
        for a in &self.agents {
            if let Some(schedule) = &a.schedule {
                check(format!("agent {}", a.id), schedule);
            }
        }
        if !ranges_well_formed(&self.breaks) {
            warn!(version = self.version, "malformed global breaks, every day will be closed");
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String, std::io::Error),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read config {path}: {e}"),
            ConfigError::Parse(e) => write!(f, "invalid config: {e}"),
            ConfigError::Invalid(e) => write!(f, "config rejected: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
