//! Index of active listeners by contract address and event topic.

use crate::types::{Broadcast, Head, RawLog, Registration};
use alloy_primitives::{Address, B256};
use std::collections::{BTreeSet, HashMap, HashSet};
use vigil_storage::ConsumedLogKey;

/// All active listener registrations, grouped for O(matches) fan-out.
///
/// The index is `contract address -> topic0 -> registrations`, so dispatch
/// touches only the listeners that could possibly match a log. The union of
/// addresses and topics across the index forms the upstream subscription
/// filter.
#[derive(Debug, Default)]
pub(crate) struct Registrations {
    by_address: HashMap<Address, HashMap<B256, Vec<Registration>>>,
    highest_num_confirmations: u64,
}

impl Registrations {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The maximum `num_confirmations` across active listeners, 0 if none.
    pub(crate) const fn highest_num_confirmations(&self) -> u64 {
        self.highest_num_confirmations
    }

    /// True if any listener is interested in logs from `address`.
    pub(crate) fn is_address_registered(&self, address: &Address) -> bool {
        self.by_address.contains_key(address)
    }

    /// The union of contract addresses and topic hashes across all listeners,
    /// sorted for deterministic upstream filters.
    pub(crate) fn addresses_and_topics(&self) -> (Vec<Address>, Vec<B256>) {
        let addresses: BTreeSet<Address> = self.by_address.keys().copied().collect();
        let topics: BTreeSet<B256> =
            self.by_address.values().flat_map(|topics| topics.keys().copied()).collect();
        (addresses.into_iter().collect(), topics.into_iter().collect())
    }

    /// Adds a registration. Returns true if the upstream filter must grow to
    /// cover it, or if its confirmation requirement deepens the backfill.
    pub(crate) fn add_subscriber(&mut self, reg: Registration) -> bool {
        let mut needs_resubscribe = !self.by_address.contains_key(&reg.opts.contract);
        let topics_for_address = self.by_address.entry(reg.opts.contract).or_default();

        for topic in reg.opts.logs_with_topics.keys() {
            if !topics_for_address.contains_key(topic) {
                needs_resubscribe = true;
            }
            let registered = topics_for_address.entry(*topic).or_default();
            if registered.iter().any(|existing| existing.same_listener(&reg)) {
                error!(
                    target: "log_broadcaster",
                    job_id = %reg.listener.job_id(),
                    address = ?reg.opts.contract,
                    topic = ?topic,
                    "Listener is already registered for this topic; ignoring duplicate registration"
                );
                continue;
            }
            registered.push(reg.clone());
        }

        if reg.opts.num_confirmations > self.highest_num_confirmations {
            self.highest_num_confirmations = reg.opts.num_confirmations;
            needs_resubscribe = true;
        }
        needs_resubscribe
    }

    /// Removes a registration. Returns true if the removal dropped the only
    /// listener for an address/topic combination, shrinking the upstream
    /// filter.
    pub(crate) fn remove_subscriber(&mut self, reg: &Registration) -> bool {
        let mut needs_resubscribe = false;
        let Some(topics_for_address) = self.by_address.get_mut(&reg.opts.contract) else {
            return false;
        };

        for topic in reg.opts.logs_with_topics.keys() {
            let Some(registered) = topics_for_address.get_mut(topic) else { continue };
            registered.retain(|existing| !existing.same_listener(reg));
            if registered.is_empty() {
                topics_for_address.remove(topic);
                needs_resubscribe = true;
            }
        }
        if topics_for_address.is_empty() {
            self.by_address.remove(&reg.opts.contract);
            needs_resubscribe = true;
        }

        self.highest_num_confirmations = self.max_num_confirmations();
        needs_resubscribe
    }

    fn max_num_confirmations(&self) -> u64 {
        self.by_address
            .values()
            .flat_map(|topics| topics.values())
            .flatten()
            .map(|reg| reg.opts.num_confirmations)
            .max()
            .unwrap_or(0)
    }

    /// Dispatches `logs` to every matching, sufficiently confirmed listener
    /// whose consumption is not already recorded in `consumed`.
    ///
    /// Listener invocations follow the order of `logs`, which the pool sorts
    /// by `(block_number, tx_index, log_index)`; that ordering is observable
    /// to listeners.
    pub(crate) fn send_logs(
        &self,
        logs: Vec<RawLog>,
        head: Head,
        consumed: &HashSet<ConsumedLogKey>,
    ) {
        for log in logs {
            let Some(topic0) = log.topic0() else { continue };
            let Some(registered) =
                self.by_address.get(&log.address).and_then(|topics| topics.get(&topic0))
            else {
                continue;
            };
            for reg in registered {
                self.try_dispatch(reg, topic0, &log, &head, consumed);
            }
        }
    }

    fn try_dispatch(
        &self,
        reg: &Registration,
        topic0: B256,
        log: &RawLog,
        head: &Head,
        consumed: &HashSet<ConsumedLogKey>,
    ) {
        let Some(filters) = reg.opts.logs_with_topics.get(&topic0) else { return };
        if !topic_filters_match(&log.topics, filters) {
            return;
        }

        if log.block_number > head.number {
            return;
        }
        let confirmations = head.number - log.block_number + 1;
        if confirmations < reg.opts.num_confirmations {
            return;
        }

        let job_id = reg.listener.job_id();
        let key = ConsumedLogKey {
            block_hash: log.block_hash,
            log_index: log.log_index,
            job_id: job_id.as_str().to_owned(),
        };
        if consumed.contains(&key) {
            return;
        }

        let decoded = match &reg.opts.parse_log {
            Some(parse) => match parse(log) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    error!(
                        target: "log_broadcaster",
                        %err,
                        %job_id,
                        block_number = log.block_number,
                        log_index = log.log_index,
                        "Failed to parse log; skipping dispatch"
                    );
                    return;
                }
            },
            None => None,
        };

        trace!(
            target: "log_broadcaster",
            %job_id,
            block_number = log.block_number,
            tx_index = log.tx_index,
            log_index = log.log_index,
            "Dispatching log broadcast"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!(crate::metrics::BROADCASTS_DISPATCHED).increment(1);

        reg.listener.handle_log(Broadcast::new(log.clone(), decoded, job_id));
    }
}

/// Applies per-position topic filters to positions `1..=3` of `topics`.
/// `filters[i]` constrains `topics[i + 1]`; an empty set accepts any value.
fn topic_filters_match(topics: &[B256], filters: &[Vec<B256>]) -> bool {
    filters.iter().enumerate().all(|(position, accepted)| {
        accepted.is_empty()
            || topics.get(position + 1).is_some_and(|topic| accepted.contains(topic))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::TestListener, types::ListenerOpts};
    use alloy_primitives::{Address, Bytes};
    use std::sync::Arc;

    const TOPIC_A: B256 = B256::repeat_byte(0xa0);
    const TOPIC_B: B256 = B256::repeat_byte(0xb0);

    fn opts(contract: Address, topics: &[B256], num_confirmations: u64) -> ListenerOpts {
        ListenerOpts {
            contract,
            logs_with_topics: topics.iter().map(|t| (*t, Vec::new())).collect(),
            parse_log: None,
            num_confirmations,
        }
    }

    fn log_at(contract: Address, topics: Vec<B256>, block_number: u64) -> RawLog {
        RawLog {
            address: contract,
            topics,
            data: Bytes::new(),
            block_number,
            block_hash: B256::repeat_byte(block_number as u8),
            tx_hash: B256::ZERO,
            tx_index: 0,
            log_index: 0,
            removed: false,
        }
    }

    fn head(number: u64) -> Head {
        Head { number, hash: B256::ZERO, parent_hash: B256::ZERO, chain_length: 1 }
    }

    #[test]
    fn add_reports_filter_growth() {
        let mut registrations = Registrations::new();
        let contract = Address::repeat_byte(1);
        let listener = Arc::new(TestListener::new("job-1"));

        // First registration introduces a new address.
        assert!(registrations
            .add_subscriber(Registration::new(listener.clone(), opts(contract, &[TOPIC_A], 0))));

        // Same address and topic, another listener: no upstream change.
        let second = Arc::new(TestListener::new("job-2"));
        assert!(!registrations
            .add_subscriber(Registration::new(second.clone(), opts(contract, &[TOPIC_A], 0))));

        // New topic on a known address: filter grows.
        let third = Arc::new(TestListener::new("job-3"));
        assert!(registrations
            .add_subscriber(Registration::new(third, opts(contract, &[TOPIC_B], 0))));

        // Raising the confirmation requirement forces a resubscribe so the
        // backfill can be deepened.
        let fourth = Arc::new(TestListener::new("job-4"));
        assert!(registrations
            .add_subscriber(Registration::new(fourth, opts(contract, &[TOPIC_A], 7))));
        assert_eq!(registrations.highest_num_confirmations(), 7);
    }

    #[test]
    fn remove_reports_filter_shrinkage() {
        let mut registrations = Registrations::new();
        let contract = Address::repeat_byte(1);
        let listener_a = Arc::new(TestListener::new("job-a"));
        let listener_b = Arc::new(TestListener::new("job-b"));
        let reg_a = Registration::new(listener_a, opts(contract, &[TOPIC_A], 5));
        let reg_b = Registration::new(listener_b, opts(contract, &[TOPIC_A], 2));

        registrations.add_subscriber(reg_a.clone());
        registrations.add_subscriber(reg_b.clone());

        // Another listener still covers the combination.
        assert!(!registrations.remove_subscriber(&reg_a));
        assert_eq!(registrations.highest_num_confirmations(), 2);

        // Last listener for the address: the upstream filter shrinks.
        assert!(registrations.remove_subscriber(&reg_b));
        assert!(!registrations.is_address_registered(&contract));
        assert_eq!(registrations.highest_num_confirmations(), 0);
    }

    #[test]
    fn addresses_and_topics_returns_the_union() {
        let mut registrations = Registrations::new();
        let contract_1 = Address::repeat_byte(1);
        let contract_2 = Address::repeat_byte(2);
        registrations.add_subscriber(Registration::new(
            Arc::new(TestListener::new("job-1")),
            opts(contract_1, &[TOPIC_A], 0),
        ));
        registrations.add_subscriber(Registration::new(
            Arc::new(TestListener::new("job-2")),
            opts(contract_2, &[TOPIC_A, TOPIC_B], 0),
        ));

        let (addresses, topics) = registrations.addresses_and_topics();
        assert_eq!(addresses, vec![contract_1, contract_2]);
        assert_eq!(topics, vec![TOPIC_A, TOPIC_B]);
    }

    #[test]
    fn topic_position_filters() {
        let (a, b, c) = (B256::repeat_byte(1), B256::repeat_byte(2), B256::repeat_byte(3));
        // topics[1] in {a, b}, topics[2] unconstrained, topics[3] == c
        let filters = vec![vec![a, b], vec![], vec![c]];

        assert!(topic_filters_match(&[TOPIC_A, a, B256::ZERO, c], &filters));
        assert!(topic_filters_match(&[TOPIC_A, b, B256::repeat_byte(9), c], &filters));
        // Wrong value at position 1.
        assert!(!topic_filters_match(&[TOPIC_A, c, B256::ZERO, c], &filters));
        // Wrong value at position 3.
        assert!(!topic_filters_match(&[TOPIC_A, a, B256::ZERO, a], &filters));
        // Too few topics for a constrained position.
        assert!(!topic_filters_match(&[TOPIC_A, a], &filters));
        // No filters at all accepts anything.
        assert!(topic_filters_match(&[TOPIC_A], &[]));
    }

    #[test]
    fn send_logs_gates_on_confirmations() {
        let mut registrations = Registrations::new();
        let contract = Address::repeat_byte(1);
        let listener = Arc::new(TestListener::new("job-1"));
        registrations
            .add_subscriber(Registration::new(listener.clone(), opts(contract, &[TOPIC_A], 3)));

        let log = log_at(contract, vec![TOPIC_A], 10);

        // head 11: two confirmations, not enough.
        registrations.send_logs(vec![log.clone()], head(11), &HashSet::new());
        assert_eq!(listener.count(), 0);

        // head 12: three confirmations, dispatched.
        registrations.send_logs(vec![log.clone()], head(12), &HashSet::new());
        assert_eq!(listener.count(), 1);

        // A log above the head is never dispatched.
        let future_log = log_at(contract, vec![TOPIC_A], 20);
        registrations.send_logs(vec![future_log], head(12), &HashSet::new());
        assert_eq!(listener.count(), 1);
    }

    #[test]
    fn send_logs_skips_consumed_broadcasts() {
        let mut registrations = Registrations::new();
        let contract = Address::repeat_byte(1);
        let listener = Arc::new(TestListener::new("job-1"));
        registrations
            .add_subscriber(Registration::new(listener.clone(), opts(contract, &[TOPIC_A], 0)));

        let log = log_at(contract, vec![TOPIC_A], 10);
        let consumed = HashSet::from([ConsumedLogKey {
            block_hash: log.block_hash,
            log_index: log.log_index,
            job_id: "job-1".to_owned(),
        }]);

        registrations.send_logs(vec![log], head(10), &consumed);
        assert_eq!(listener.count(), 0);
    }

    #[test]
    fn send_logs_preserves_dispatch_order() {
        let mut registrations = Registrations::new();
        let contract = Address::repeat_byte(1);
        let listener = Arc::new(TestListener::new("job-1"));
        registrations
            .add_subscriber(Registration::new(listener.clone(), opts(contract, &[TOPIC_A], 0)));

        let mut first = log_at(contract, vec![TOPIC_A], 10);
        first.log_index = 1;
        let mut second = log_at(contract, vec![TOPIC_A], 10);
        second.log_index = 4;
        let third = log_at(contract, vec![TOPIC_A], 11);

        registrations.send_logs(
            vec![first.clone(), second.clone(), third.clone()],
            head(11),
            &HashSet::new(),
        );
        let received: Vec<_> =
            listener.received().iter().map(|b| (b.block_number, b.log_index)).collect();
        assert_eq!(received, vec![(10, 1), (10, 4), (11, 0)]);
    }

    #[test]
    fn send_logs_only_reaches_matching_listeners() {
        let mut registrations = Registrations::new();
        let contract = Address::repeat_byte(1);
        let other_contract = Address::repeat_byte(2);
        let interested = Arc::new(TestListener::new("job-yes"));
        let other_topic = Arc::new(TestListener::new("job-topic"));
        let other_address = Arc::new(TestListener::new("job-addr"));

        registrations
            .add_subscriber(Registration::new(interested.clone(), opts(contract, &[TOPIC_A], 0)));
        registrations
            .add_subscriber(Registration::new(other_topic.clone(), opts(contract, &[TOPIC_B], 0)));
        registrations.add_subscriber(Registration::new(
            other_address.clone(),
            opts(other_contract, &[TOPIC_A], 0),
        ));

        registrations.send_logs(vec![log_at(contract, vec![TOPIC_A], 5)], head(5), &HashSet::new());
        assert_eq!(interested.count(), 1);
        assert_eq!(other_topic.count(), 0);
        assert_eq!(other_address.count(), 0);
    }

    #[test]
    fn parse_failures_suppress_dispatch() {
        let mut registrations = Registrations::new();
        let contract = Address::repeat_byte(1);
        let listener = Arc::new(TestListener::new("job-1"));
        let mut options = opts(contract, &[TOPIC_A], 0);
        options.parse_log = Some(Arc::new(|_log: &RawLog| {
            Err(crate::LogParseError("unknown event".to_owned()))
        }));
        registrations.add_subscriber(Registration::new(listener.clone(), options));

        registrations.send_logs(vec![log_at(contract, vec![TOPIC_A], 5)], head(5), &HashSet::new());
        assert_eq!(listener.count(), 0);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let mut registrations = Registrations::new();
        let contract = Address::repeat_byte(1);
        let listener = Arc::new(TestListener::new("job-1"));
        let reg = Registration::new(listener.clone(), opts(contract, &[TOPIC_A], 0));

        registrations.add_subscriber(reg.clone());
        registrations.add_subscriber(reg);

        registrations.send_logs(vec![log_at(contract, vec![TOPIC_A], 5)], head(5), &HashSet::new());
        assert_eq!(listener.count(), 1);
    }
}
