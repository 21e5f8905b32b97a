use bulk_dispatch::segment::{
    CarrierSegmentation, CountryOnlySegmentation, PrefixTableSegmentation, Segment, SegmentKind,
    SegmentationRegistry, UNKNOWN_CARRIER,
};
use std::sync::Arc;

fn values(segments: &[Segment]) -> Vec<(SegmentKind, &str)> {
    segments.iter().map(|s| (s.kind, s.value.as_str())).collect()
}

#[test]
fn test_ivory_coast_orange_prefix() {
    let segments = PrefixTableSegmentation::ivory_coast().segment("+2250701020304");
    assert_eq!(
        values(&segments),
        vec![
            (SegmentKind::Country, "225"),
            (SegmentKind::Carrier, "07"),
            (SegmentKind::Subscriber, "01020304"),
        ]
    );
    assert_eq!(segments[1].label.as_deref(), Some("Orange"));
}

#[test]
fn test_ivory_coast_mtn_and_moov() {
    let strategy = PrefixTableSegmentation::ivory_coast();
    assert_eq!(strategy.segment("+2250544332211")[1].label.as_deref(), Some("MTN"));
    assert_eq!(strategy.segment("+2250144332211")[1].label.as_deref(), Some("Moov"));
}

#[test]
fn test_unmatched_prefix_is_unknown_carrier() {
    let segments = PrefixTableSegmentation::ivory_coast().segment("+2252722445566");
    assert_eq!(
        values(&segments),
        vec![
            (SegmentKind::Country, "225"),
            (SegmentKind::Carrier, UNKNOWN_CARRIER),
            (SegmentKind::Subscriber, "2722445566"),
        ]
    );
    assert!(segments[1].label.is_none());
}

#[test]
fn test_prefix_table_for_other_country_falls_back() {
    let segments = PrefixTableSegmentation::ivory_coast().segment("+221771234567");
    assert_eq!(segments[0].value, "221");
    assert_eq!(segments[1].value, UNKNOWN_CARRIER);
}

#[test]
fn test_country_only_segmentation() {
    let segments = CountryOnlySegmentation.segment("+33612345678");
    assert_eq!(
        values(&segments),
        vec![
            (SegmentKind::Country, "33"),
            (SegmentKind::Carrier, UNKNOWN_CARRIER),
            (SegmentKind::Subscriber, "612345678"),
        ]
    );
}

#[test]
fn test_registry_picks_strategy_by_country() {
    let registry = SegmentationRegistry::with_defaults();
    let senegal = registry.segment("+221771234567");
    assert_eq!(senegal[1].value, "77");
    assert_eq!(senegal[1].label.as_deref(), Some("Orange"));
    assert_eq!(senegal[2].value, "1234567");

    let ivory = registry.segment("+2250601020304");
    assert_eq!(ivory[1].label.as_deref(), Some("MTN"));
}

#[test]
fn test_registry_falls_back_to_country_only() {
    let registry = SegmentationRegistry::with_defaults();
    let segments = registry.segment("+442079460958");
    assert_eq!(segments[0].value, "44");
    assert_eq!(segments[1].value, UNKNOWN_CARRIER);
}

#[test]
fn test_registry_accepts_custom_strategy() {
    let mut registry = SegmentationRegistry::new();
    registry.register(
        "234",
        Arc::new(PrefixTableSegmentation::new("234", &[("803", "MTN"), ("80", "Other")])),
    );
    let segments = registry.segment("+2348031234567");
    assert_eq!(segments[1].value, "803");
    assert_eq!(segments[1].label.as_deref(), Some("MTN"));
    assert_eq!(segments[2].value, "1234567");
}
