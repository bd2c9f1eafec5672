use chatlog_common::types::{DeliveryState, MessageId};
use chatlog_daemon::store::MessageStore;
use chatlog_daemon::sync::target::advance_cursor_if_contiguous;
use chatlog_daemon::sync::TargetSpec;
use proptest::prelude::*;

fn target(name: &str) -> TargetSpec {
    TargetSpec {
        name: name.to_string(),
        owner: "octo".to_string(),
        repo: "chat".to_string(),
        branch: "main".to_string(),
        path_prefix: String::new(),
    }
}

fn delivery_state() -> impl Strategy<Value = DeliveryState> {
    prop_oneof![
        Just(DeliveryState::Pending),
        "[a-f0-9]{7}".prop_map(|commit_id| DeliveryState::Committed { commit_id }),
        (1u32..5).prop_map(|retry_count| DeliveryState::Failed {
            reason: "transient".to_string(),
            retry_count,
        }),
    ]
}

/// Ascending ids starting at 1 paired with arbitrary states.
fn delivery_run() -> impl Strategy<Value = Vec<(MessageId, DeliveryState)>> {
    prop::collection::vec(delivery_state(), 0..40).prop_map(|states| {
        states.into_iter().enumerate().map(|(i, state)| (i as MessageId + 1, state)).collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn appended_messages_list_in_id_order_with_exact_content(
        contents in prop::collection::vec("[A-Za-z0-9][A-Za-z0-9 \n_.-]{0,60}", 1..25),
    ) {
        let store = MessageStore::open_in_memory().expect("in-memory store should open");
        store.register_target(&target("x")).expect("target should register");

        let appended: Vec<_> = contents
            .iter()
            .map(|content| store.append(content).expect("append should succeed"))
            .collect();
        prop_assert!(appended.windows(2).all(|pair| pair[0].id < pair[1].id));

        let listed = store.list(None).expect("list should succeed");
        prop_assert_eq!(listed.len(), contents.len());
        for (message, content) in listed.iter().zip(&contents) {
            prop_assert_eq!(&message.content, content);
            prop_assert_eq!(message.delivery("x"), Some(&DeliveryState::Pending));
        }
        prop_assert_eq!(
            listed.iter().map(|m| m.id).collect::<Vec<_>>(),
            appended.iter().map(|m| m.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn cursor_never_passes_the_first_uncommitted_delivery(states in delivery_run()) {
        let cursor = advance_cursor_if_contiguous(None, &states);
        let first_gap = states.iter().find(|(_, state)| !state.is_committed()).map(|(id, _)| *id);

        match (cursor, first_gap) {
            (Some(cursor), Some(gap)) => prop_assert!(cursor < gap),
            (None, Some(gap)) => prop_assert_eq!(gap, 1),
            (Some(cursor), None) => prop_assert_eq!(Some(cursor), states.last().map(|(id, _)| *id)),
            (None, None) => prop_assert!(states.is_empty()),
        }
        if let Some(cursor) = cursor {
            prop_assert!(states.iter().take_while(|(id, _)| *id <= cursor).all(|(_, s)| s.is_committed()));
        }
    }

    #[test]
    fn cursor_is_monotonic_from_any_start(states in delivery_run(), start in 0i64..45) {
        let start = (start > 0).then_some(start);
        let cursor = advance_cursor_if_contiguous(start, &states);
        prop_assert!(cursor >= start);

        // Re-running over the same states is stable.
        prop_assert_eq!(advance_cursor_if_contiguous(cursor, &states), cursor);
    }
}
