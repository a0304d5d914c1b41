//! Schedule resolution: which parts of a local date are open for a
//! (service, agent) pair, as UTC spans.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::config::{ranges_well_formed, Configuration, TimeRange, WeeklySchedule};
use crate::model::*;

use super::availability::free_windows;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Local wall-clock minute on `date` as UTC ms. `1440` is midnight of the
/// next day. `None` when the local time falls in a DST gap. In a DST fold
/// the earlier instant wins.
pub fn local_minute_to_ms(tz: &Tz, date: NaiveDate, minute: u32) -> Option<Ms> {
    let (date, minute) = if minute >= MINUTES_PER_DAY {
        (date.succ_opt()?, minute - MINUTES_PER_DAY)
    } else {
        (date, minute)
    };
    let time = NaiveTime::from_hms_opt(minute / 60, minute % 60, 0)?;
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

pub fn ms_to_local(tz: &Tz, ms: Ms) -> Option<NaiveDateTime> {
    tz.timestamp_millis_opt(ms).single().map(|dt| dt.naive_local())
}

/// Open windows for `date`, sorted and disjoint. Empty means closed.
///
/// The weekly source is picked whole: the service's own schedule when it
/// opts out of the global one, else the agent's override, else global.
/// Anything malformed along the way closes the day.
pub fn resolve_windows(
    config: &Configuration,
    service_id: ServiceId,
    agent_id: Option<AgentId>,
    date: NaiveDate,
) -> Vec<Span> {
    let Some(service) = config.service(service_id).filter(|s| s.active) else {
        return Vec::new();
    };
    let agent = match agent_id {
        Some(id) => match config.agent(id) {
            Some(a) if a.active && a.performs(service_id) => Some(a),
            _ => return Vec::new(),
        },
        None => None,
    };

    let source: &WeeklySchedule = if !service.uses_global_schedule {
        match &service.schedule {
            Some(s) => s,
            None => {
                tracing::debug!(service_id, "service opts out of global schedule but has none");
                return Vec::new();
            }
        }
    } else {
        agent
            .and_then(|a| a.schedule.as_ref())
            .unwrap_or(&config.schedule)
    };

    let hours = enabled(source.day(date.weekday()));
    if hours.is_empty() {
        return Vec::new();
    }
    if !ranges_well_formed(&hours) {
        tracing::debug!(service_id, ?agent_id, %date, "malformed working hours, closed");
        return Vec::new();
    }

    if config.holidays.iter().any(|h| h.covers(date, agent_id)) {
        return Vec::new();
    }

    let mut breaks = enabled(&config.breaks);
    if let Some(agent_id) = agent_id {
        breaks.extend(
            config
                .agent_breaks
                .iter()
                .filter(|b| b.agent_id == agent_id && b.date == date)
                .map(|b| b.range()),
        );
    }
    if !breaks.iter().all(TimeRange::is_well_formed) {
        tracing::debug!(service_id, ?agent_id, %date, "malformed break, closed");
        return Vec::new();
    }

    let tz = &config.timezone;
    let mut open = Vec::with_capacity(hours.len());
    for r in &hours {
        // A window with an endpoint in a DST gap is dropped.
        if let (Some(start), Some(end)) = (
            local_minute_to_ms(tz, date, r.start),
            local_minute_to_ms(tz, date, r.end),
        ) && start < end
        {
            open.push(Span::new(start, end));
        }
    }

    let mut closed = Vec::with_capacity(breaks.len());
    for r in &breaks {
        match (
            local_minute_to_ms(tz, date, r.start),
            local_minute_to_ms(tz, date, r.end),
        ) {
            (Some(start), Some(end)) if start < end => closed.push(Span::new(start, end)),
            (Some(_), Some(_)) => {}
            // Cannot subtract a break we cannot place.
            _ => return Vec::new(),
        }
    }

    free_windows(open, closed)
}

fn enabled(ranges: &[TimeRange]) -> Vec<TimeRange> {
    ranges.iter().filter(|r| r.enabled).copied().collect()
}
