//! Parsing of the `PERCH_EVENT_LIST` contract.
//!
//! The list is a `;`-separated sequence of event requests. Each request is
//! an event name, optionally followed by `@THRESHOLD` (a sampling period in
//! the event's own unit) or `@fFREQ` (samples per second).

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    pub name: String,
    pub how: SampleBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleBy {
    /// Take a sample every `period` events.
    Period(u64),
    /// Aim for `hz` samples per second.
    Frequency(u64),
    /// Let the source pick its default.
    Default,
}

impl EventSpec {
    pub fn new(name: &str, how: SampleBy) -> Self {
        EventSpec {
            name: name.to_string(),
            how,
        }
    }
}

pub fn parse_event_list(list: &str) -> Vec<EventSpec> {
    list.split(';')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .filter_map(parse_event)
        .collect()
}

fn parse_event(token: &str) -> Option<EventSpec> {
    let (name, spec) = match token.split_once('@') {
        None => return Some(EventSpec::new(token, SampleBy::Default)),
        Some((name, spec)) => (name, spec),
    };
    if name.is_empty() {
        log::warn!("ignoring malformed event request {token:?}");
        return None;
    }
    let how = if let Some(freq) = spec.strip_prefix('f') {
        SampleBy::Frequency(freq.parse().ok()?)
    } else {
        SampleBy::Period(spec.parse().ok()?)
    };
    match how {
        SampleBy::Period(0) | SampleBy::Frequency(0) => {
            log::warn!("ignoring event request {token:?} with zero rate");
            None
        }
        how => Some(EventSpec::new(name, how)),
    }
}
