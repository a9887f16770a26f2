//! Decides which listings of a freshly fetched page are new for a saved search.

use listwatch_core::{Listing, Watermark};

/// Upper bound on listings reported per search and run when the anchor is known.
pub const MAX_NEW_LISTINGS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    /// No watermark, or its anchor is no longer on the page: restart tracking
    /// from whatever the source ranks first.
    Resync,
    /// Anchor located: everything strictly newer than the recorded instant.
    Incremental,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub mode: DetectionMode,
    /// Most recent first. The head, if any, is the next watermark.
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn detect_new(&self, listings: &[Listing], watermark: Option<&Watermark>) -> Vec<Listing> {
        self.detect(listings, watermark).listings
    }

    pub fn detect(&self, listings: &[Listing], watermark: Option<&Watermark>) -> Detection {
        let organic: Vec<&Listing> = listings.iter().filter(|l| !l.is_sponsored()).collect();

        let anchor = watermark.filter(|w| organic.iter().any(|l| l.id == w.offer_id));
        let Some(anchor) = anchor else {
            return Detection {
                mode: DetectionMode::Resync,
                listings: organic.first().map(|l| vec![(*l).clone()]).unwrap_or_default(),
            };
        };

        let threshold = anchor.instant_millis();
        let mut ranked: Vec<(f64, &Listing)> = organic
            .into_iter()
            .map(|l| (l.instant_millis(), l))
            .collect();
        // Stable sort: equal instants keep their fetch order.
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let listings = ranked
            .into_iter()
            .filter(|(instant, _)| *instant > threshold)
            .take(MAX_NEW_LISTINGS)
            .map(|(_, l)| l.clone())
            .collect();

        Detection {
            mode: DetectionMode::Incremental,
            listings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use listwatch_core::{Promotion, RawTimestamp};

    fn listing(id: &str, modified: Option<&str>) -> Listing {
        Listing {
            id: id.to_string(),
            modified_at: modified.map(RawTimestamp::from),
            ..Default::default()
        }
    }

    fn highlighted(id: &str, modified: &str) -> Listing {
        Listing {
            promotion: Some(Promotion {
                highlighted: true,
                ..Default::default()
            }),
            ..listing(id, Some(modified))
        }
    }

    fn watermark(offer_id: &str, modified: &str) -> Watermark {
        Watermark::from_listing(&listing(offer_id, Some(modified)))
    }

    fn ids(listings: &[Listing]) -> Vec<&str> {
        listings.iter().map(|l| l.id.as_str()).collect()
    }

    fn scenario_page() -> Vec<Listing> {
        vec![
            listing("known-offer", Some("2026-03-01T10:00:00+02:00")),
            listing("offer-2", Some("2026-03-01T12:10:00+02:00")),
            listing("offer-3", Some("2026-03-01T11:50:00+02:00")),
            listing("offer-4", Some("2026-03-01T13:00:00+02:00")),
            listing("offer-5", Some("2026-03-01T12:50:00+02:00")),
            listing("offer-6", Some("2026-03-01T12:00:00+02:00")),
            listing("offer-7", Some("2026-03-01T14:00:00+02:00")),
            highlighted("highlighted-offer", "2026-03-01T15:00:00+02:00"),
            listing("old-offer", Some("2026-03-01T09:59:00+02:00")),
        ]
    }

    #[test]
    fn incremental_detection_sorts_filters_and_caps() {
        let detector = ChangeDetector::default();
        let mark = watermark("known-offer", "2026-03-01T10:00:00+02:00");

        let detection = detector.detect(&scenario_page(), Some(&mark));

        assert_eq!(detection.mode, DetectionMode::Incremental);
        assert_eq!(
            ids(&detection.listings),
            vec!["offer-7", "offer-4", "offer-5", "offer-2", "offer-6"]
        );
    }

    #[test]
    fn missing_anchor_resyncs_to_first_listing_in_fetch_order() {
        let detector = ChangeDetector::default();
        let page = vec![
            listing("older-first", Some("2026-03-01T08:00:00Z")),
            listing("newer-second", Some("2026-03-01T18:00:00Z")),
        ];
        let mark = watermark("gone", "2026-03-01T09:00:00Z");

        let detection = detector.detect(&page, Some(&mark));
        assert_eq!(detection.mode, DetectionMode::Resync);
        assert_eq!(ids(&detection.listings), vec!["older-first"]);

        assert_eq!(ids(&detector.detect_new(&page, None)), vec!["older-first"]);
    }

    #[test]
    fn resync_skips_sponsored_head_and_sponsored_anchor() {
        let detector = ChangeDetector::default();
        let page = vec![
            highlighted("promo", "2026-03-01T20:00:00Z"),
            listing("organic", Some("2026-03-01T08:00:00Z")),
        ];

        assert_eq!(ids(&detector.detect_new(&page, None)), vec!["organic"]);

        // An anchor that is now promoted no longer counts as found.
        let mark = watermark("promo", "2026-03-01T07:00:00Z");
        let detection = detector.detect(&page, Some(&mark));
        assert_eq!(detection.mode, DetectionMode::Resync);
        assert_eq!(ids(&detection.listings), vec!["organic"]);
    }

    #[test]
    fn nothing_newer_than_anchor_yields_empty() {
        let detector = ChangeDetector::default();
        let page = vec![
            listing("a", Some("2026-03-01T09:00:00Z")),
            listing("anchor", Some("2026-03-01T10:00:00Z")),
            listing("b", Some("2026-03-01T10:00:00Z")),
        ];
        let mark = watermark("anchor", "2026-03-01T10:00:00Z");

        let detection = detector.detect(&page, Some(&mark));
        assert_eq!(detection.mode, DetectionMode::Incremental);
        assert!(detection.listings.is_empty());
    }

    #[test]
    fn unparsable_or_missing_timestamps_never_pass_a_finite_anchor() {
        let detector = ChangeDetector::default();
        let page = vec![
            listing("anchor", Some("2026-03-01T10:00:00Z")),
            listing("garbage", Some("yesterday-ish")),
            listing("missing", None),
            listing("fresh", Some("2026-03-01T11:00:00Z")),
        ];
        let mark = watermark("anchor", "2026-03-01T10:00:00Z");

        assert_eq!(ids(&detector.detect_new(&page, Some(&mark))), vec!["fresh"]);
    }

    #[test]
    fn sponsored_listings_are_never_reported() {
        let detector = ChangeDetector::default();
        let mut page = scenario_page();
        page.push(Listing {
            promotion: Some(Promotion {
                top_ad: true,
                ..Default::default()
            }),
            ..listing("top-ad", Some("2026-03-01T16:00:00+02:00"))
        });
        let mark = watermark("known-offer", "2026-03-01T10:00:00+02:00");

        let found = detector.detect_new(&page, Some(&mark));
        assert!(found.iter().all(|l| !l.is_sponsored()));
        assert!(!ids(&found).contains(&"highlighted-offer"));
        assert!(!ids(&found).contains(&"top-ad"));
    }

    #[test]
    fn result_is_capped_and_strictly_descending() {
        let detector = ChangeDetector::default();
        let mut page = vec![listing("anchor", Some("2026-03-01T00:00:00Z"))];
        for hour in 1..=12 {
            page.push(listing(
                &format!("h{hour}"),
                Some(&format!("2026-03-01T{hour:02}:00:00Z")),
            ));
        }
        let mark = watermark("anchor", "2026-03-01T00:00:00Z");

        let found = detector.detect_new(&page, Some(&mark));
        assert_eq!(found.len(), MAX_NEW_LISTINGS);
        assert_eq!(ids(&found), vec!["h12", "h11", "h10", "h9", "h8"]);
        assert!(found
            .windows(2)
            .all(|pair| pair[0].instant_millis() > pair[1].instant_millis()));
    }

    #[test]
    fn rerun_with_advanced_watermark_is_idempotent() {
        let detector = ChangeDetector::default();
        let page = scenario_page();
        let first = detector.detect_new(
            &page,
            Some(&watermark("known-offer", "2026-03-01T10:00:00+02:00")),
        );
        let advanced = Watermark::from_listing(&first[0]);

        assert!(detector.detect_new(&page, Some(&advanced)).is_empty());
    }

    #[test]
    fn cold_start_also_becomes_a_stable_anchor() {
        let detector = ChangeDetector::default();
        let page = scenario_page();
        let first = detector.detect_new(&page, None);
        assert_eq!(ids(&first), vec!["known-offer"]);

        let advanced = Watermark::from_listing(&first[0]);
        let second = detector.detect(&page, Some(&advanced));
        assert_eq!(second.mode, DetectionMode::Incremental);
        assert_eq!(second.listings.len(), MAX_NEW_LISTINGS);
    }

    #[test]
    fn threshold_comes_from_recorded_watermark_not_refreshed_anchor() {
        let detector = ChangeDetector::default();
        // The anchor was bumped on the marketplace after it was recorded.
        let page = vec![
            listing("anchor", Some("2026-03-01T12:00:00Z")),
            listing("between", Some("2026-03-01T11:00:00Z")),
            listing("older", Some("2026-03-01T09:00:00Z")),
        ];
        let mark = watermark("anchor", "2026-03-01T10:00:00Z");

        let detection = detector.detect(&page, Some(&mark));
        assert_eq!(detection.mode, DetectionMode::Incremental);
        assert_eq!(ids(&detection.listings), vec!["anchor", "between"]);
    }

    #[test]
    fn empty_or_fully_sponsored_pages_yield_nothing() {
        let detector = ChangeDetector::default();
        assert!(detector.detect_new(&[], None).is_empty());
        let page = vec![highlighted("promo", "2026-03-01T20:00:00Z")];
        assert!(detector
            .detect_new(&page, Some(&watermark("promo", "2026-03-01T10:00:00Z")))
            .is_empty());
    }

    #[test]
    fn epoch_and_textual_timestamps_compare_on_one_axis() {
        let detector = ChangeDetector::default();
        let anchor_ms = RawTimestamp::from("2026-03-01T10:00:00Z").instant_millis();
        let page = vec![
            listing("anchor", Some("2026-03-01T10:00:00Z")),
            Listing {
                id: "epoch".into(),
                modified_at: Some(RawTimestamp::Epoch(anchor_ms + 60_000.0)),
                ..Default::default()
            },
        ];
        let mark = watermark("anchor", "2026-03-01T10:00:00Z");
        assert_eq!(ids(&detector.detect_new(&page, Some(&mark))), vec!["epoch"]);
    }
}
