//! Scored results and the order-independent merge of shard-local lists.

use std::cmp::Ordering;
use std::collections::HashMap;

use ordered_float::OrderedFloat;
use reef_types::ItemId;
use serde::{Deserialize, Serialize};

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub item_id: ItemId,
    /// `alpha * similarity + (1 - alpha) * proximity`.
    pub score: f32,
    /// Vector similarity in `[0, 1]`.
    pub similarity: f32,
    /// Normalized graph proximity in `[0, 1]`.
    pub proximity: f32,
}

impl ScoredItem {
    /// Combine the two signals. Non-finite inputs count as zero and both
    /// signals are clamped to `[0, 1]`.
    pub fn combine(item_id: ItemId, similarity: f32, proximity: f32, alpha: f32) -> Self {
        let similarity = unit(similarity);
        let proximity = unit(proximity);
        let alpha = unit(alpha);
        Self {
            item_id,
            score: alpha * similarity + (1.0 - alpha) * proximity,
            similarity,
            proximity,
        }
    }

    fn strength(&self) -> (OrderedFloat<f32>, OrderedFloat<f32>, OrderedFloat<f32>) {
        (
            OrderedFloat(self.score),
            OrderedFloat(self.similarity),
            OrderedFloat(self.proximity),
        )
    }
}

fn unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Ranking order: score descending, then item id ascending.
pub fn rank_order(a: &ScoredItem, b: &ScoredItem) -> Ordering {
    OrderedFloat(b.score)
        .cmp(&OrderedFloat(a.score))
        .then_with(|| a.item_id.cmp(&b.item_id))
}

/// Merge ranked lists into one list of at most `top_k` items.
///
/// An item present in several lists keeps its strongest entry. The output
/// depends only on the multiset of entries, never on list order.
pub fn merge_ranked<I>(lists: I, top_k: usize) -> Vec<ScoredItem>
where
    I: IntoIterator<Item = Vec<ScoredItem>>,
{
    let mut best: HashMap<ItemId, ScoredItem> = HashMap::new();
    for item in lists.into_iter().flatten() {
        match best.get_mut(&item.item_id) {
            Some(current) if current.strength() >= item.strength() => {}
            Some(current) => *current = item,
            None => {
                best.insert(item.item_id.clone(), item);
            }
        }
    }

    let mut merged: Vec<ScoredItem> = best.into_values().collect();
    merged.sort_unstable_by(rank_order);
    merged.truncate(top_k);
    merged
}
