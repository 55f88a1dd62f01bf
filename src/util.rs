use std::sync::{Mutex, MutexGuard};

use reqwest::header::HeaderMap;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Merges `overrides` into `defaults` by header name.
///
/// Every value of a name present in `overrides` replaces all values of that
/// name in `defaults`; names only present in `defaults` are kept.
pub(crate) fn merge_headers(defaults: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut merged = defaults.clone();
    for name in overrides.keys() {
        merged.remove(name);
        for value in overrides.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}
