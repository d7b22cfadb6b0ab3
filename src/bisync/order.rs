// ABOUTME: Row ordering for self-referential tables before batch apply
// ABOUTME: Puts rows with a NULL self-reference ahead of rows that point at them

use super::RowValues;

/// Stable partition: rows whose self-reference column is NULL first.
///
/// `self_reference` is the column's position in each row; `None` leaves the
/// rows untouched. This is not a topological sort: a child pointing at a
/// parent that itself has a parent may still precede it.
pub fn order_rows(rows: Vec<RowValues>, self_reference: Option<usize>) -> Vec<RowValues> {
    let Some(position) = self_reference else {
        return rows;
    };

    let (roots, children): (Vec<RowValues>, Vec<RowValues>) = rows
        .into_iter()
        .partition(|row| row.get(position).map_or(true, Option::is_none));

    let mut ordered = roots;
    ordered.extend(children);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, related: Option<&str>) -> RowValues {
        vec![Some(id.to_string()), related.map(str::to_string)]
    }

    #[test]
    fn test_null_references_first_and_stable() {
        let rows = vec![
            row("3", Some("1")),
            row("1", None),
            row("4", Some("2")),
            row("2", None),
        ];

        let ordered = order_rows(rows, Some(1));
        let ids: Vec<&str> = ordered
            .iter()
            .map(|r| r[0].as_deref().unwrap_or_default())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_without_self_reference_order_is_untouched() {
        let rows = vec![row("2", Some("1")), row("1", None)];
        let ordered = order_rows(rows.clone(), None);
        assert_eq!(ordered, rows);
    }
}
