//! Plurality election with mean-of-ties, shared by the geometry and
//! intensity accumulators.

use std::collections::HashMap;

/// Count occurrences of integer-keyed observations.
#[derive(Clone, Debug, Default)]
pub(crate) struct FrequencyTable {
    counts: HashMap<i64, u32>,
}

impl FrequencyTable {
    pub(crate) fn record(&mut self, key: i64) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.counts.keys().copied()
    }

    /// The most frequent key; when several keys share the maximum count,
    /// their rounded arithmetic mean.
    pub(crate) fn elect(&self) -> Option<i64> {
        let max = self.counts.values().copied().max()?;
        let tied: Vec<i64> = self
            .counts
            .iter()
            .filter(|(_, count)| **count == max)
            .map(|(key, _)| *key)
            .collect();
        let sum: i64 = tied.iter().sum();
        Some((sum as f64 / tied.len() as f64).round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_elects_nothing() {
        assert_eq!(FrequencyTable::default().elect(), None);
    }

    #[test]
    fn plurality_wins() {
        let mut table = FrequencyTable::default();
        table.record(400);
        table.record(400);
        table.record(350);
        assert_eq!(table.elect(), Some(400));
    }

    #[test]
    fn ties_break_to_the_rounded_mean() {
        let mut table = FrequencyTable::default();
        table.record(400);
        table.record(350);
        assert_eq!(table.elect(), Some(375));

        let mut table = FrequencyTable::default();
        table.record(3);
        table.record(4);
        // 3.5 rounds away from zero.
        assert_eq!(table.elect(), Some(4));
    }
}
