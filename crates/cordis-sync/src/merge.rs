//! Left-outer join of a generation's project table with its aggregated child
//! collections.

use std::collections::BTreeMap;

use cordis_adapters::{AggregatedCollection, CollectionKind, MERGE_ORDER};
use cordis_core::{normalize_identifier, CanonicalColumn, CellValue, Table};
use tracing::debug;

/// Coalescing rule for a column present on both sides of a join: a non-blank
/// existing value is kept, otherwise the incoming value replaces it even when
/// the incoming value is itself null.
pub fn coalesce(existing: Option<&CellValue>, incoming: CellValue) -> Option<CellValue> {
    match existing {
        Some(value) if !value.is_blank() => None,
        _ => Some(incoming),
    }
}

/// Join one aggregated collection onto `main`. Row count and order never change.
pub fn merge_collection(main: &mut Table, child: &AggregatedCollection) {
    let mut matched = 0usize;
    for column in &child.columns {
        main.ensure_column(column.as_str());
    }

    for row in &mut main.rows {
        let incoming = row
            .get(CanonicalColumn::Id.as_str())
            .and_then(normalize_identifier)
            .and_then(|key| child.get(&key));
        if incoming.is_some() {
            matched += 1;
        }

        for column in &child.columns {
            let name = column.as_str();
            let value = incoming
                .and_then(|record| record.get(name))
                .cloned()
                .unwrap_or_default();
            if let Some(replacement) = coalesce(row.get(name), value) {
                row.insert(name.to_string(), replacement);
            }
        }
    }

    debug!(
        kind = ?child.kind,
        rows = main.len(),
        matched,
        child_keys = child.len(),
        "merged child collection"
    );
}

/// Merge every available child collection in the fixed join order, then stamp
/// the generation label onto every row.
pub fn merge_generation(
    mut main: Table,
    children: &BTreeMap<CollectionKind, AggregatedCollection>,
    label: &str,
) -> Table {
    for kind in MERGE_ORDER {
        if let Some(child) = children.get(&kind) {
            merge_collection(&mut main, child);
        }
    }
    main.fill_column(
        CanonicalColumn::ProgrammeSource.as_str(),
        CellValue::text(label),
    );
    main
}
