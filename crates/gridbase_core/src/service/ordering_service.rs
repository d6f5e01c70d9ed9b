//! Position ordering shared by modules, tables, columns, records and views.
//!
//! # Responsibility
//! - Merge a requested order with the current sibling order.
//! - Persist dense 1-based positions inside one immediate transaction.
//!
//! # Invariants
//! - Requested ids come first in the given order; unlisted siblings keep
//!   their relative order and follow.
//! - Requested ids must belong to the sibling set and appear once.
//! - Concurrent reorders of one set serialize on the write lock; the last
//!   committed order wins.

use crate::db::begin_immediate;
use crate::error::{CoreError, CoreResult};
use crate::repo::position_repo::{list_sibling_ids, write_positions, SiblingSet};
use log::info;
use rusqlite::Connection;
use std::collections::HashSet;
use uuid::Uuid;

/// Computes the final sibling order.
pub fn merge_order(current: &[Uuid], requested: &[Uuid]) -> Result<Vec<Uuid>, String> {
    let known: HashSet<Uuid> = current.iter().copied().collect();
    let mut seen = HashSet::with_capacity(requested.len());
    for id in requested {
        if !known.contains(id) {
            return Err(format!("id {id} is not part of this sibling set"));
        }
        if !seen.insert(*id) {
            return Err(format!("id {id} is listed more than once"));
        }
    }

    let mut merged = requested.to_vec();
    merged.extend(current.iter().filter(|id| !seen.contains(id)).copied());
    Ok(merged)
}

/// Reorders one sibling set in its own transaction.
pub fn reorder(conn: &Connection, set: SiblingSet, ordered_ids: &[Uuid]) -> CoreResult<Vec<Uuid>> {
    let tx = begin_immediate(conn)?;
    let merged = reorder_in(&tx, set, ordered_ids)?;
    tx.commit()?;
    info!(
        "event=reorder module=ordering status=ok set={} count={}",
        set,
        merged.len()
    );
    Ok(merged)
}

/// Reorders inside a caller-owned transaction.
pub(crate) fn reorder_in(
    conn: &Connection,
    set: SiblingSet,
    ordered_ids: &[Uuid],
) -> CoreResult<Vec<Uuid>> {
    let current = list_sibling_ids(conn, set)?;
    let merged = merge_order(&current, ordered_ids).map_err(CoreError::Validation)?;
    write_positions(conn, set, &merged)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::merge_order;
    use uuid::Uuid;

    #[test]
    fn requested_ids_lead_and_the_rest_keep_relative_order() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);

        assert_eq!(merge_order(&ids, &[c, a]).unwrap(), vec![c, a, b, d]);
        assert_eq!(merge_order(&ids, &[]).unwrap(), ids);
        assert_eq!(merge_order(&ids, &[d, c, b, a]).unwrap(), vec![d, c, b, a]);
    }

    #[test]
    fn foreign_and_duplicate_ids_are_rejected() {
        let ids: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        assert!(merge_order(&ids, &[Uuid::new_v4()]).is_err());
        assert!(merge_order(&ids, &[ids[0], ids[0]]).is_err());
    }
}
