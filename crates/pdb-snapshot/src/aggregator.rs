// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

/// Bucket used when a categorical field is missing, empty or not a string.
pub const UNKNOWN: &str = "unknown";

/// Running `key -> count` tally. Keys are never absent once incremented and
/// counts only grow.
#[derive(Debug, Default, Clone)]
pub struct Aggregator {
    counts: HashMap<String, u64>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: &str, amount: u64) {
        match self.counts.get_mut(key) {
            Some(count) => *count += amount,
            None => {
                self.counts.insert(key.to_string(), amount);
            }
        }
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Sorted copy of the current counts.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }
}

/// Networks per organization, built during the network pass and only read
/// afterwards.
#[derive(Debug, Default, Clone)]
pub struct OrgNetworkCounts {
    counts: HashMap<i64, u64>,
}

impl OrgNetworkCounts {
    /// Counts the network's `org_id` when it is a non-zero integer.
    pub fn record_network(&mut self, network: &Value) {
        if let Some(org_id) = org_id(network) {
            *self.counts.entry(org_id).or_insert(0) += 1;
        }
    }

    pub fn networks_of(&self, org_id: i64) -> u64 {
        self.counts.get(&org_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

fn org_id(network: &Value) -> Option<i64> {
    network
        .get("org_id")
        .and_then(Value::as_i64)
        .filter(|id| *id != 0)
}

/// Value of a string field, or [`UNKNOWN`].
pub fn category<'a>(record: &'a Value, field: &str) -> &'a str {
    record
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN)
}

/// Network pass: one per network under its `info_type`.
pub fn count_network_type(types: &mut Aggregator, network: &Value) {
    types.increment(category(network, "info_type"), 1);
}

/// Organization pass: the organization's country is credited with the number
/// of networks the organization owns. Organizations without networks are
/// skipped.
pub fn count_org_country(countries: &mut Aggregator, org_counts: &OrgNetworkCounts, org: &Value) {
    let Some(id) = org.get("id").and_then(Value::as_i64) else {
        return;
    };
    let networks = org_counts.networks_of(id);
    if networks > 0 {
        countries.increment(category(org, "country"), networks);
    }
}
