use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::phone::split_country_code;

pub const UNKNOWN_CARRIER: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Country,
    Carrier,
    Subscriber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub value: String,
    pub label: Option<String>,
}

impl Segment {
    fn new(kind: SegmentKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            label: None,
        }
    }
}

pub trait CarrierSegmentation: Send + Sync {
    fn segment(&self, e164: &str) -> Vec<Segment>;
}

#[derive(Debug, Clone)]
pub struct PrefixTableSegmentation {
    country_code: String,
    prefixes: Vec<(String, String)>,
}

impl PrefixTableSegmentation {
    pub fn new(country_code: &str, prefixes: &[(&str, &str)]) -> Self {
        let mut prefixes: Vec<(String, String)> = prefixes
            .iter()
            .map(|(prefix, carrier)| (prefix.to_string(), carrier.to_string()))
            .collect();
        // longest prefix first so "07" wins over "0"
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            country_code: country_code.to_string(),
            prefixes,
        }
    }

    pub fn ivory_coast() -> Self {
        Self::new(
            "225",
            &[
                ("07", "Orange"),
                ("08", "Orange"),
                ("09", "Orange"),
                ("05", "MTN"),
                ("06", "MTN"),
                ("01", "Moov"),
                ("02", "Moov"),
                ("03", "Moov"),
            ],
        )
    }

    pub fn senegal() -> Self {
        Self::new(
            "221",
            &[
                ("77", "Orange"),
                ("78", "Orange"),
                ("76", "Free"),
                ("70", "Expresso"),
                ("75", "Promobile"),
            ],
        )
    }

    pub fn country_code(&self) -> &str {
        &self.country_code
    }
}

impl CarrierSegmentation for PrefixTableSegmentation {
    fn segment(&self, e164: &str) -> Vec<Segment> {
        let digits = e164.trim_start_matches('+');
        let Some(national) = digits.strip_prefix(self.country_code.as_str()) else {
            return CountryOnlySegmentation.segment(e164);
        };

        let mut segments = vec![Segment::new(SegmentKind::Country, self.country_code.clone())];
        match self
            .prefixes
            .iter()
            .find(|(prefix, _)| national.starts_with(prefix.as_str()))
        {
            Some((prefix, carrier)) => {
                segments.push(Segment {
                    kind: SegmentKind::Carrier,
                    value: prefix.clone(),
                    label: Some(carrier.clone()),
                });
                segments.push(Segment::new(SegmentKind::Subscriber, &national[prefix.len()..]));
            }
            None => {
                segments.push(Segment::new(SegmentKind::Carrier, UNKNOWN_CARRIER));
                segments.push(Segment::new(SegmentKind::Subscriber, national));
            }
        }
        segments
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CountryOnlySegmentation;

impl CarrierSegmentation for CountryOnlySegmentation {
    fn segment(&self, e164: &str) -> Vec<Segment> {
        let digits = e164.trim_start_matches('+');
        let mut segments = Vec::with_capacity(3);
        let national = match split_country_code(digits) {
            Some((code, national)) => {
                segments.push(Segment::new(SegmentKind::Country, code));
                national
            }
            None => digits,
        };
        segments.push(Segment::new(SegmentKind::Carrier, UNKNOWN_CARRIER));
        segments.push(Segment::new(SegmentKind::Subscriber, national));
        segments
    }
}

#[derive(Clone, Default)]
pub struct SegmentationRegistry {
    strategies: HashMap<String, Arc<dyn CarrierSegmentation>>,
}

impl SegmentationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("225", Arc::new(PrefixTableSegmentation::ivory_coast()));
        registry.register("221", Arc::new(PrefixTableSegmentation::senegal()));
        registry
    }

    pub fn register(&mut self, country_code: &str, strategy: Arc<dyn CarrierSegmentation>) {
        self.strategies.insert(country_code.to_string(), strategy);
    }

    fn strategy_for(&self, digits: &str) -> Option<&Arc<dyn CarrierSegmentation>> {
        (1..=3)
            .rev()
            .filter(|len| digits.len() > *len)
            .find_map(|len| self.strategies.get(&digits[..len]))
    }
}

impl CarrierSegmentation for SegmentationRegistry {
    fn segment(&self, e164: &str) -> Vec<Segment> {
        let digits = e164.trim_start_matches('+');
        match self.strategy_for(digits) {
            Some(strategy) => strategy.segment(e164),
            None => CountryOnlySegmentation.segment(e164),
        }
    }
}
