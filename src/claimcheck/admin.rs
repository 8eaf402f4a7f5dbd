use std::collections::BTreeMap;

use serde::Serialize;

use super::withdrawal::Withdrawal;

/// Point-in-time summary of a store, built from peeks so that taking it never
/// ages a drawer.
pub struct AdminInfo<T> {
    pub(crate) total_drawers: u64,
    pub(crate) active_drawers: u64,
    pub(crate) filled_drawers: u64,
    pub(crate) filled_keys: Vec<String>,
    pub(crate) key_to_claim: BTreeMap<String, u64>,
    pub(crate) withdrawals: BTreeMap<u64, Withdrawal<T>>,
    pub(crate) free_memory_bytes: u64,
    pub(crate) memory_threshold: String,
    pub(crate) current_time_ms: i64,
}

/// The counting part of [`AdminInfo`], for logs and responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdminCounts {
    pub total: u64,
    pub active: u64,
    pub filled: u64,
    pub filling: u64,
    pub incinerated: u64,
}

impl<T> AdminInfo<T> {
    pub fn num_total_drawers(&self) -> u64 {
        self.total_drawers
    }

    pub fn num_active_drawers(&self) -> u64 {
        self.active_drawers
    }

    pub fn num_filled_drawers(&self) -> u64 {
        self.filled_drawers
    }

    pub fn num_filling_drawers(&self) -> u64 {
        self.active_drawers - self.filled_drawers
    }

    pub fn num_incinerated_drawers(&self) -> u64 {
        self.total_drawers - self.active_drawers
    }

    /// Keys whose drawers hold a deposit, sorted.
    pub fn filled_keys(&self) -> &[String] {
        &self.filled_keys
    }

    pub fn key_to_claim(&self) -> &BTreeMap<String, u64> {
        &self.key_to_claim
    }

    pub fn withdrawals(&self) -> &BTreeMap<u64, Withdrawal<T>> {
        &self.withdrawals
    }

    pub fn free_memory_bytes(&self) -> u64 {
        self.free_memory_bytes
    }

    pub fn memory_threshold(&self) -> &str {
        &self.memory_threshold
    }

    pub fn current_time_ms(&self) -> i64 {
        self.current_time_ms
    }

    pub fn counts(&self) -> AdminCounts {
        AdminCounts {
            total: self.num_total_drawers(),
            active: self.num_active_drawers(),
            filled: self.num_filled_drawers(),
            filling: self.num_filling_drawers(),
            incinerated: self.num_incinerated_drawers(),
        }
    }
}
