// ============================================================================
// Flush Strategies
// ============================================================================
//
// A flush strategy is an ordering function over the rows a cache is about to
// write. The simple strategy preserves association order; the
// relationship-enforcing strategy schedules inserts so referenced rows land
// before the rows that point at them, and deletes in the opposite direction,
// keeping foreign-key constraints satisfied without knowing the physical
// schema.
// ============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::EntityKey;
use crate::persistence::WriteOp;

/// One pending write, as seen by a flush strategy.
#[derive(Debug, Clone)]
pub struct FlushItem {
    pub op: WriteOp,
    pub identity: EntityKey,
    /// Keys this row's relationship slots point at
    pub references: Vec<EntityKey>,
    /// Association order within the cache
    pub seq: usize,
}

/// Policy governing order of writes when a transaction-scoped cache flushes.
pub trait FlushStrategy: Send + Sync {
    fn order(&self, items: Vec<FlushItem>) -> Vec<FlushItem>;
}

/// Write rows back in the order they were associated with the cache.
pub struct DeclarationOrder;

impl FlushStrategy for DeclarationOrder {
    fn order(&self, mut items: Vec<FlushItem>) -> Vec<FlushItem> {
        items.sort_by_key(|item| item.seq);
        items
    }
}

/// Order inserts parents-first and deletes children-first so foreign keys
/// hold at every point of the write sequence. Updates run between the two,
/// in association order.
pub struct EnforceRelationships;

impl EnforceRelationships {
    /// Topologically sort `items` so that any item whose identity is
    /// referenced by another item comes first. Cycles fall back to
    /// association order for the remainder.
    fn referenced_first(items: Vec<FlushItem>) -> Vec<FlushItem> {
        let index: HashMap<EntityKey, usize> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.identity.clone(), i))
            .collect();

        // in_degree[i] = number of items i references within this batch
        let mut in_degree = vec![0usize; items.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
        for (i, item) in items.iter().enumerate() {
            let mut seen = HashSet::new();
            for reference in &item.references {
                if let Some(&j) = index.get(reference) {
                    if i != j && seen.insert(j) {
                        in_degree[i] += 1;
                        dependents[j].push(i);
                    }
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..items.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut ordered_indices = Vec::with_capacity(items.len());
        while let Some(i) = ready.pop_front() {
            ordered_indices.push(i);
            for &dep in &dependents[i] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    ready.push_back(dep);
                }
            }
        }

        // Anything left participates in a reference cycle
        for i in 0..items.len() {
            if !ordered_indices.contains(&i) {
                ordered_indices.push(i);
            }
        }

        let mut slots: Vec<Option<FlushItem>> = items.into_iter().map(Some).collect();
        ordered_indices
            .into_iter()
            .map(|i| slots[i].take().expect("index appears once"))
            .collect()
    }
}

impl FlushStrategy for EnforceRelationships {
    fn order(&self, items: Vec<FlushItem>) -> Vec<FlushItem> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for item in items {
            match item.op {
                WriteOp::Insert => inserts.push(item),
                WriteOp::Update => updates.push(item),
                WriteOp::Delete => deletes.push(item),
            }
        }

        updates.sort_by_key(|item| item.seq);

        let mut ordered = Self::referenced_first(inserts);
        ordered.extend(updates);

        let mut deletes = Self::referenced_first(deletes);
        deletes.reverse();
        ordered.extend(deletes);

        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn key(id: i64) -> EntityKey {
        EntityKey::new("E", Value::Integer(id))
    }

    fn item(op: WriteOp, id: i64, references: Vec<i64>, seq: usize) -> FlushItem {
        FlushItem {
            op,
            identity: key(id),
            references: references.into_iter().map(key).collect(),
            seq,
        }
    }

    fn ids(items: &[FlushItem]) -> Vec<i64> {
        items
            .iter()
            .map(|i| i.identity.key.as_integer().unwrap())
            .collect()
    }

    #[test]
    fn test_declaration_order_sorts_by_seq() {
        let items = vec![
            item(WriteOp::Update, 2, vec![], 1),
            item(WriteOp::Insert, 1, vec![], 0),
        ];
        let ordered = DeclarationOrder.order(items);
        assert_eq!(ids(&ordered), vec![1, 2]);
    }

    #[test]
    fn test_enforce_relationships_inserts_parents_first() {
        // 1 references 2, 2 references 3: insert order must be 3, 2, 1
        let items = vec![
            item(WriteOp::Insert, 1, vec![2], 0),
            item(WriteOp::Insert, 2, vec![3], 1),
            item(WriteOp::Insert, 3, vec![], 2),
        ];
        let ordered = EnforceRelationships.order(items);
        assert_eq!(ids(&ordered), vec![3, 2, 1]);
    }

    #[test]
    fn test_enforce_relationships_deletes_children_first() {
        // 1 references 2: delete 1 before 2
        let items = vec![
            item(WriteOp::Delete, 2, vec![], 0),
            item(WriteOp::Delete, 1, vec![2], 1),
        ];
        let ordered = EnforceRelationships.order(items);
        assert_eq!(ids(&ordered), vec![1, 2]);
    }

    #[test]
    fn test_enforce_relationships_groups_ops() {
        let items = vec![
            item(WriteOp::Delete, 3, vec![], 0),
            item(WriteOp::Update, 2, vec![], 1),
            item(WriteOp::Insert, 1, vec![], 2),
        ];
        let ordered = EnforceRelationships.order(items);
        assert_eq!(ordered[0].op, WriteOp::Insert);
        assert_eq!(ordered[1].op, WriteOp::Update);
        assert_eq!(ordered[2].op, WriteOp::Delete);
    }

    #[test]
    fn test_reference_cycle_does_not_hang() {
        let items = vec![
            item(WriteOp::Insert, 1, vec![2], 0),
            item(WriteOp::Insert, 2, vec![1], 1),
        ];
        let ordered = EnforceRelationships.order(items);
        assert_eq!(ordered.len(), 2);
    }
}
