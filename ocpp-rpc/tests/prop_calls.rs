//! Property tests for call termination and network paths
//!
//! - every pending call reaches exactly one terminal state
//! - a network path never holds the same node twice

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{node, RawPeer};
use ocpp_rpc::{CallOptions, CorrelatorStats, NetworkPath, NetworkingNodeId, RpcError};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fate {
    Answer,
    Ignore,
    Cancel,
    Abandon,
}

fn fate() -> impl Strategy<Value = Fate> {
    prop_oneof![
        Just(Fate::Answer),
        Just(Fate::Ignore),
        Just(Fate::Cancel),
        Just(Fate::Abandon),
    ]
}

fn node_id() -> impl Strategy<Value = String> {
    "[A-D][0-3]"
}

#[derive(Debug, PartialEq)]
enum Observed {
    Completed,
    TimedOut,
    Cancelled,
    Other(String),
}

fn run_calls(fates: &[Fate]) -> (Vec<Observed>, CorrelatorStats) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async {
        let csms = node("CSMS");
        let mut peer = RawPeer::attach(&csms, "CP042");

        let mut handles = Vec::new();
        for (i, _) in fates.iter().enumerate() {
            let options = CallOptions::timeout(Duration::from_secs(1)).with_request_id(format!("r-{}", i));
            handles.push(
                csms.start_call("CP042", "Heartbeat", json!({}), options)
                    .await
                    .unwrap(),
            );
        }

        for _ in fates {
            let (message_id, _) = peer.next_call().await;
            let index: usize = message_id.trim_start_matches("r-").parse().unwrap();
            if fates[index] == Fate::Answer {
                peer.reply(&message_id, json!({"currentTime": "2024-01-01T00:00:00Z"}))
                    .await;
            }
        }

        // Settle cancellations before any deadline can pass
        let mut waiting = Vec::new();
        for (fate, handle) in fates.iter().zip(handles) {
            match fate {
                Fate::Cancel => {
                    csms.cancel(handle.request_id());
                    waiting.push(Some(handle));
                }
                Fate::Abandon => {
                    drop(handle);
                    waiting.push(None);
                }
                Fate::Answer | Fate::Ignore => waiting.push(Some(handle)),
            }
        }

        let mut observed = Vec::new();
        for handle in waiting {
            let Some(handle) = handle else {
                observed.push(Observed::Cancelled);
                continue;
            };
            observed.push(match handle.wait().await {
                Ok(_) => Observed::Completed,
                Err(RpcError::Timeout) => Observed::TimedOut,
                Err(RpcError::Cancelled) => Observed::Cancelled,
                Err(e) => Observed::Other(e.to_string()),
            });
        }

        // Let any stray timers fire
        tokio::time::sleep(Duration::from_secs(2)).await;
        (observed, csms.correlator().stats())
    })
}

// ============================================================================
// Termination Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// CORE INVARIANT: each call terminates exactly once, with the outcome
    /// its peer behaviour dictates
    #[test]
    fn every_call_terminates_once(fates in prop::collection::vec(fate(), 1..12)) {
        let (observed, stats) = run_calls(&fates);

        for (fate, outcome) in fates.iter().zip(&observed) {
            let expected = match fate {
                Fate::Answer => Observed::Completed,
                Fate::Ignore => Observed::TimedOut,
                Fate::Cancel | Fate::Abandon => Observed::Cancelled,
            };
            prop_assert_eq!(outcome, &expected);
        }

        let count = |f: &[Fate]| fates.iter().filter(|x| f.contains(*x)).count() as u64;
        prop_assert_eq!(stats.created, fates.len() as u64);
        prop_assert_eq!(stats.terminated(), fates.len() as u64);
        prop_assert_eq!(stats.completed, count(&[Fate::Answer]));
        prop_assert_eq!(stats.timed_out, count(&[Fate::Ignore]));
        prop_assert_eq!(stats.cancelled, count(&[Fate::Cancel, Fate::Abandon]));
        prop_assert_eq!(stats.pending, 0);
    }
}

// ============================================================================
// Path Property Tests
// ============================================================================

proptest! {
    /// Pushing a node already on the path fails and leaves it unchanged
    #[test]
    fn path_never_holds_duplicates(ids in prop::collection::vec(node_id(), 0..16)) {
        let mut path = NetworkPath::new();

        for id in ids {
            let id = NetworkingNodeId::from(id);
            let before = path.len();
            let duplicate = path.contains(&id);

            prop_assert_eq!(path.push(id).is_err(), duplicate);
            if duplicate {
                prop_assert_eq!(path.len(), before);
            }
        }

        let unique: HashSet<_> = path.hops().iter().collect();
        prop_assert_eq!(unique.len(), path.len());
    }

    /// Paths decoded from the wire obey the same rule
    #[test]
    fn decoded_path_rejects_repeats(ids in prop::collection::vec(node_id(), 0..8)) {
        let unique: HashSet<_> = ids.iter().collect();
        let decoded = serde_json::from_value::<NetworkPath>(json!(ids));
        prop_assert_eq!(decoded.is_ok(), unique.len() == ids.len());
    }
}
