//! Property-based tests for assetwalk invariants
//!
//! Uses proptest to check that:
//! - reopening a progress store reproduces the state it had in memory,
//!   with or without compactions in between
//! - replay of an append stream is last-writer-wins per key
//! - natural ordering is a total order that sorts numbered names by value

use ::assetwalk::classifier::natural_cmp;
use ::assetwalk::journal::{DurableLog, JournalEvent, Stream};
use ::assetwalk::*;
use chrono::Utc;
use proptest::prelude::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Complete,
    Fail,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Start), Just(Op::Complete), Just(Op::Fail)]
}

fn arb_status() -> impl Strategy<Value = ProgressStatus> {
    prop_oneof![
        Just(ProgressStatus::Running),
        Just(ProgressStatus::Completed),
        Just(ProgressStatus::Failed)
    ]
}

fn key_for(index: usize) -> ProgressKey {
    match index % 3 {
        0 => ProgressKey::app("prop", &format!("App{}", index)),
        1 => ProgressKey::variant("prop", "App", &format!("V{}", index)),
        _ => ProgressKey::image("prop", std::path::Path::new(&format!("/src/{}.png", index))),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_reopen_reproduces_state(
        ops in prop::collection::vec((0usize..6, arb_op()), 1..60),
        max_mutations in 1usize..20,
        force in any::<bool>(),
    ) {
        let temp = TempDir::new().unwrap();
        let policy = CompactionPolicy {
            max_mutations,
            interval: Duration::from_secs(3600),
        };

        let expected: HashMap<usize, Option<ProgressRecord>> = {
            let store = ProgressStore::open_at(temp.path(), "prop", policy.clone(), force, false).unwrap();
            for (index, op) in &ops {
                let key = key_for(*index);
                match op {
                    Op::Start => { store.mark_started(&key).unwrap(); }
                    Op::Complete => { store.mark_completed(&key).unwrap(); }
                    Op::Fail => { store.mark_failed(&key, "boom").unwrap(); }
                }
            }
            (0..6).map(|i| (i, store.record(&key_for(i)))).collect()
        };

        let reopened = ProgressStore::open_at(temp.path(), "prop", policy, force, false).unwrap();
        for (index, record) in expected {
            prop_assert_eq!(reopened.record(&key_for(index)), record);
        }
    }

    #[test]
    fn prop_completed_is_terminal_without_force(
        ops in prop::collection::vec(arb_op(), 1..30),
    ) {
        let temp = TempDir::new().unwrap();
        let store = ProgressStore::open_at(temp.path(), "prop", CompactionPolicy::default(), false, false).unwrap();
        let key = key_for(0);

        let mut completed = false;
        for op in ops {
            match op {
                Op::Start => { store.mark_started(&key).unwrap(); }
                Op::Complete => { store.mark_completed(&key).unwrap(); }
                Op::Fail => { store.mark_failed(&key, "boom").unwrap(); }
            }
            completed |= matches!(op, Op::Complete);
            if completed {
                prop_assert!(store.is_completed(&key));
            }
        }
    }

    #[test]
    fn prop_replay_is_last_writer_wins(
        events in prop::collection::vec((0usize..4, arb_status()), 1..40),
        compact_at in any::<prop::sample::Index>(),
    ) {
        let temp = TempDir::new().unwrap();
        let split = compact_at.index(events.len() + 1);

        let mut model: BTreeMap<String, ProgressRecord> = BTreeMap::new();
        {
            let log = DurableLog::open(temp.path(), false).unwrap();
            let mut writer = log.writer(Stream::Apps);
            for (i, (key, status)) in events.iter().enumerate() {
                if i == split {
                    writer.compact(&model).unwrap();
                }
                let key = format!("prop:App{}", key);
                let record = ProgressRecord {
                    agent: "prop".to_string(),
                    status: *status,
                    started_at: None,
                    completed_at: None,
                    updated_at: Utc::now(),
                    error: None,
                    attempts: i as u32,
                };
                writer
                    .append(&JournalEvent::Progress { key: key.clone(), record: record.clone() })
                    .unwrap();
                model.insert(key, record);
            }
        }

        let log = DurableLog::open(temp.path(), false).unwrap();
        let snapshot = log
            .load_snapshot::<BTreeMap<String, ProgressRecord>>(Stream::Apps)
            .unwrap();
        let after = snapshot.as_ref().map_or(0, |s| s.last_seq);
        let mut state = snapshot.map(|s| s.data).unwrap_or_default();
        for event in log.replay(Stream::Apps, after).unwrap().events {
            if let JournalEvent::Progress { key, record } = event {
                state.insert(key, record);
            }
        }

        prop_assert_eq!(state, model);
        prop_assert_eq!(log.current_seq(), events.len() as u64);
    }

    #[test]
    fn prop_natural_order_sorts_numbers_by_value(a in 0u32..100_000, b in 0u32..100_000) {
        let left = format!("img{}.png", a);
        let right = format!("img{}.png", b);
        prop_assert_eq!(natural_cmp(&left, &right), a.cmp(&b));
    }

    #[test]
    fn prop_natural_order_is_antisymmetric(a in "[a-zA-Z0-9._-]{0,12}", b in "[a-zA-Z0-9._-]{0,12}") {
        let forward = natural_cmp(&a, &b);
        prop_assert_eq!(forward, natural_cmp(&b, &a).reverse());
        if forward == Ordering::Equal {
            prop_assert_eq!(&a, &b);
        }
    }

    #[test]
    fn prop_natural_order_is_transitive(
        mut names in prop::collection::vec("[a-c0-9]{1,6}", 3),
    ) {
        names.sort_by(|x, y| natural_cmp(x, y));
        prop_assert_ne!(natural_cmp(&names[0], &names[1]), Ordering::Greater);
        prop_assert_ne!(natural_cmp(&names[1], &names[2]), Ordering::Greater);
        prop_assert_ne!(natural_cmp(&names[0], &names[2]), Ordering::Greater);
    }
}
