//! Connection Pool Property Tests
//!
//! Random connect, send and remote-drop sequences checked step by step
//! against a recency model and the mock transport's counters.

mod common;

use std::sync::Arc;

use blebridge_ble::{short_uuid, BleTransport, ConnectionPool, Link};
use common::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Connect(usize),
    Send(usize),
    RemoteDrop(usize),
}

fn step(addresses: usize) -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..addresses).prop_map(Step::Connect),
        (0..addresses).prop_map(Step::Send),
        (0..addresses).prop_map(Step::RemoteDrop),
    ]
}

fn address(index: usize) -> String {
    format!("AA:00:00:00:01:{:02X}", index)
}

/// Expected pool contents, least recently used first
struct Model {
    capacity: usize,
    recency: Vec<usize>,
    disconnects: Vec<usize>,
    drops: Vec<usize>,
}

impl Model {
    fn use_link(&mut self, index: usize) {
        if let Some(position) = self.recency.iter().position(|&i| i == index) {
            self.recency.remove(position);
            self.recency.push(index);
            return;
        }
        self.recency.push(index);
        while self.recency.len() > self.capacity {
            let evicted = self.recency.remove(0);
            self.disconnects[evicted] += 1;
        }
    }

    fn remote_drop(&mut self, index: usize) {
        if let Some(position) = self.recency.iter().position(|&i| i == index) {
            self.recency.remove(position);
            self.drops[index] += 1;
        }
    }
}

fn check_sequence(capacity: usize, addresses: usize, steps: &[Step]) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async {
        let transport = MockTransport::new();
        let pool = ConnectionPool::new(
            Arc::clone(&transport) as Arc<dyn BleTransport>,
            test_config().with_pool_capacity(capacity),
        );
        let links: Vec<Link> = (0..addresses)
            .map(|index| Link::new(Arc::clone(&pool), address(index)))
            .collect();
        let mut model = Model {
            capacity,
            recency: Vec::new(),
            disconnects: vec![0; addresses],
            drops: vec![0; addresses],
        };

        for step in steps {
            match *step {
                Step::Connect(index) => {
                    prop_assert!(links[index].connect().await.is_ok());
                    model.use_link(index);
                }
                Step::Send(index) => {
                    prop_assert!(links[index]
                        .send(short_uuid(0xfff2), &[index as u8], false)
                        .await
                        .is_ok());
                    model.use_link(index);
                }
                Step::RemoteDrop(index) => {
                    transport.drop_connection(&address(index));
                    model.remote_drop(index);
                }
            }

            prop_assert!(transport.connected_count() <= capacity);
            prop_assert!(pool.connected_count().await <= capacity);

            for (index, link) in links.iter().enumerate() {
                let addr = address(index);
                let connected = model.recency.contains(&index);
                prop_assert_eq!(link.is_connected(), connected);
                prop_assert_eq!(transport.is_connected(&addr), connected);
                // Evictions hit exactly the least recently used link
                prop_assert_eq!(transport.disconnect_count(&addr), model.disconnects[index]);
                // Every connect ends in exactly one teardown
                prop_assert_eq!(
                    transport.connect_count(&addr),
                    model.disconnects[index] + model.drops[index] + usize::from(connected)
                );
            }
        }

        prop_assert!(transport.peak_connected() <= capacity);
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_pool_invariants_hold_for_any_sequence(
        (capacity, addresses, steps) in (1usize..=3, 2usize..=5).prop_flat_map(|(capacity, addresses)| {
            (Just(capacity), Just(addresses), prop::collection::vec(step(addresses), 1..40))
        })
    ) {
        check_sequence(capacity, addresses, &steps)?;
    }
}
