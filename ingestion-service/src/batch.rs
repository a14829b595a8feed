// Copyright (c) James Kassemi, SC, US. All rights reserved.

use contract_store::{StoreResult, StoreTx};
use core_types::types::ContractRecord;

/// Chunk size by record count: few round-trips for large snapshots, small
/// transactions for small ones.
pub(crate) fn batch_size_for(count: usize) -> usize {
    if count > 10_000 {
        1_000
    } else if count < 1_000 {
        100
    } else {
        500
    }
}

/// Apply `records` to the open transaction as size-bounded upsert batches.
/// Any batch failure propagates and rolls back the enclosing transaction.
pub(crate) async fn write_batches(
    tx: &mut dyn StoreTx,
    records: &[ContractRecord],
) -> StoreResult<u64> {
    let size = batch_size_for(records.len());
    let mut written = 0u64;
    for chunk in records.chunks(size) {
        written += tx.upsert_batch(chunk).await?;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_policy_boundaries() {
        assert_eq!(batch_size_for(1), 100);
        assert_eq!(batch_size_for(999), 100);
        assert_eq!(batch_size_for(1_000), 500);
        assert_eq!(batch_size_for(10_000), 500);
        assert_eq!(batch_size_for(10_001), 1_000);
    }
}
