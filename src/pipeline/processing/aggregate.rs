//! Folds the three normalized source tables into the canonical per-site table.

use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::constants::{DEFAULT_COUNTRY, DEFAULT_REGION};
use crate::types::{CanonicalSiteMetrics, RawTable, SiteMetadata, SiteMetricsRow};

/// Distinct site metadata from the ledger, keyed by Site ID.
///
/// The first ledger row for a site supplies its country and region; blank
/// values fall back to the defaults. Rows without a Site ID are dropped.
pub fn site_metadata(ledger: &RawTable) -> BTreeMap<String, SiteMetadata> {
    let mut metadata = BTreeMap::new();
    for row in &ledger.rows {
        let Some(site_id) = row.site_id.as_deref() else {
            continue;
        };
        metadata.entry(site_id.to_string()).or_insert_with(|| SiteMetadata {
            site_id: site_id.to_string(),
            country: row.country.clone().unwrap_or_else(|| DEFAULT_COUNTRY.to_string()),
            region: row.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string()),
        });
    }
    metadata
}

/// Row count per Site ID; rows without a Site ID are not counted
pub fn count_by_site(table: &RawTable) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for site_id in table.rows.iter().filter_map(|r| r.site_id.as_deref()) {
        *counts.entry(site_id.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Row for `site_id`, created with default metadata for sites the ledger never mentions
fn site_row(rows: &mut BTreeMap<String, SiteMetricsRow>, site_id: String) -> &mut SiteMetricsRow {
    rows.entry(site_id)
        .or_insert_with_key(|id| SiteMetricsRow::from_metadata(SiteMetadata::unknown(id)))
}

/// Outer-join metadata and the three per-site counts on Site ID.
///
/// An empty ledger means no site metadata, so the result is empty even when
/// the secondary sources have rows.
#[instrument(skip_all, fields(
    ledger_rows = ledger.len(),
    missing_page_rows = missing_pages.len(),
    sae_rows = adverse_events.len()
))]
pub fn aggregate(ledger: &RawTable, missing_pages: &RawTable, adverse_events: &RawTable) -> CanonicalSiteMetrics {
    let metadata = site_metadata(ledger);
    if metadata.is_empty() {
        debug!("Ledger has no site rows; canonical table is empty");
        return CanonicalSiteMetrics::empty();
    }

    let mut rows: BTreeMap<String, SiteMetricsRow> = metadata
        .into_iter()
        .map(|(site_id, meta)| (site_id, SiteMetricsRow::from_metadata(meta)))
        .collect();

    for (site_id, count) in count_by_site(ledger) {
        site_row(&mut rows, site_id).query_count = count;
    }
    for (site_id, count) in count_by_site(missing_pages) {
        site_row(&mut rows, site_id).missing_page_count = count;
    }
    for (site_id, count) in count_by_site(adverse_events) {
        site_row(&mut rows, site_id).sae_count = count;
    }

    let table = CanonicalSiteMetrics::new(rows.into_values().collect());
    debug!(sites = table.len(), "Aggregated canonical table");
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RawTableRow, SourceKind};

    fn ledger(rows: Vec<RawTableRow>) -> RawTable {
        RawTable::new(SourceKind::Ledger, rows)
    }

    fn sites(kind: SourceKind, ids: &[&str]) -> RawTable {
        RawTable::new(kind, ids.iter().map(|s| RawTableRow::site(s)).collect())
    }

    #[test]
    fn test_ledger_and_missing_pages_example() {
        let ledger = ledger(vec![
            RawTableRow::with_metadata("SiteA", "US", "West"),
            RawTableRow::with_metadata("SiteA", "US", "West"),
            RawTableRow::with_metadata("SiteB", "FR", "East"),
        ]);
        let missing = sites(SourceKind::MissingPages, &["SiteA"]);
        let sae = RawTable::empty(SourceKind::AdverseEvents);

        let table = aggregate(&ledger, &missing, &sae);

        assert_eq!(
            table.rows(),
            &[
                SiteMetricsRow {
                    site_id: "SiteA".into(),
                    country: "US".into(),
                    region: "West".into(),
                    query_count: 2,
                    missing_page_count: 1,
                    sae_count: 0,
                },
                SiteMetricsRow {
                    site_id: "SiteB".into(),
                    country: "FR".into(),
                    region: "East".into(),
                    query_count: 1,
                    missing_page_count: 0,
                    sae_count: 0,
                },
            ]
        );
    }

    #[test]
    fn test_one_row_per_site_across_all_sources() {
        let ledger = ledger(vec![
            RawTableRow::with_metadata("A", "US", "West"),
            RawTableRow::with_metadata("B", "US", "West"),
        ]);
        let missing = sites(SourceKind::MissingPages, &["B", "C", "C"]);
        let sae = sites(SourceKind::AdverseEvents, &["D"]);

        let table = aggregate(&ledger, &missing, &sae);
        let ids: Vec<&str> = table.rows().iter().map(|r| r.site_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);

        let c = table.get("C").unwrap();
        assert_eq!((c.query_count, c.missing_page_count, c.sae_count), (0, 2, 0));
        assert_eq!(c.country, DEFAULT_COUNTRY);
        assert_eq!(c.region, DEFAULT_REGION);
        assert_eq!(table.get("D").unwrap().sae_count, 1);
    }

    #[test]
    fn test_empty_ledger_yields_empty_table() {
        let empty = ledger(vec![]);
        let missing = sites(SourceKind::MissingPages, &["A"]);
        let sae = sites(SourceKind::AdverseEvents, &["A"]);
        assert!(aggregate(&empty, &missing, &sae).is_empty());

        // Rows without a site id carry no metadata either
        let anonymous = ledger(vec![RawTableRow {
            site_id: None,
            country: Some("US".into()),
            region: None,
        }]);
        assert!(aggregate(&anonymous, &missing, &sae).is_empty());
    }

    #[test]
    fn test_first_ledger_row_supplies_metadata_and_blanks_default() {
        let ledger = ledger(vec![
            RawTableRow {
                site_id: Some("A".into()),
                country: None,
                region: Some("APAC".into()),
            },
            RawTableRow::with_metadata("A", "JP", "Asia"),
        ]);
        let table = aggregate(
            &ledger,
            &RawTable::empty(SourceKind::MissingPages),
            &RawTable::empty(SourceKind::AdverseEvents),
        );
        let a = table.get("A").unwrap();
        assert_eq!(a.country, DEFAULT_COUNTRY);
        assert_eq!(a.region, "APAC");
        assert_eq!(a.query_count, 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rows_without_site_are_not_counted() {
        let ledger = ledger(vec![
            RawTableRow::with_metadata("A", "US", "West"),
            RawTableRow {
                site_id: None,
                country: Some("US".into()),
                region: Some("West".into()),
            },
        ]);
        let missing = RawTable::new(
            SourceKind::MissingPages,
            vec![RawTableRow::default(), RawTableRow::site("A")],
        );
        let table = aggregate(&ledger, &missing, &RawTable::empty(SourceKind::AdverseEvents));
        let a = table.get("A").unwrap();
        assert_eq!((a.query_count, a.missing_page_count), (1, 1));
    }
}
