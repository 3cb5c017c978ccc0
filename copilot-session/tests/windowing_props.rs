mod common;

use common::{words, WordTokenizer, PROMPT};
use copilot_session::{ChatMessage, ChatSession, MessageRole, SessionState};
use proptest::prelude::*;

fn session(prompt_cost: usize, costs: &[usize], budget: usize) -> ChatSession {
    let prompt = if prompt_cost == 0 {
        Vec::new()
    } else {
        vec![ChatMessage::system(words(prompt_cost))]
    };
    let mut session = ChatSession::new(
        SessionState::new("prop", PROMPT, prompt),
        Box::new(WordTokenizer::detached()),
        budget,
    );
    for (i, cost) in costs.iter().enumerate() {
        let role = if i % 2 == 0 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        session.push(ChatMessage::new(role, words(*cost)));
    }
    session
}

proptest! {
    #[test]
    fn full_history_is_returned_under_budget(
        prompt_cost in 0usize..20,
        costs in prop::collection::vec(0usize..40, 0..12),
    ) {
        let budget = prompt_cost + costs.iter().sum::<usize>();
        let session = session(prompt_cost, &costs, budget);

        let payload = session.finish();
        prop_assert_eq!(payload.window.as_slice(), session.messages());
        prop_assert_eq!(payload.tokens, budget);
        prop_assert_eq!(session.tokens(), budget);
    }

    #[test]
    fn window_is_the_maximal_fitting_suffix(
        prompt_cost in 0usize..20,
        costs in prop::collection::vec(0usize..40, 0..12),
        slack in 0usize..120,
    ) {
        let budget = prompt_cost + slack;
        let session = session(prompt_cost, &costs, budget);
        let payload = session.finish();

        let history = session.messages();
        let start = history.len() - payload.window.len();
        prop_assert_eq!(payload.window.as_slice(), &history[start..]);

        let window_cost: usize = costs[start..].iter().sum();
        prop_assert_eq!(payload.tokens, prompt_cost + window_cost);
        prop_assert!(payload.tokens <= budget);

        if start > 0 {
            prop_assert!(prompt_cost + window_cost + costs[start - 1] > budget);
        }
    }

    #[test]
    fn pop_is_the_inverse_of_push(
        costs in prop::collection::vec(0usize..10, 0..8),
        extra in 0usize..10,
    ) {
        let mut session = session(3, &costs, 1000);
        let before = session.messages().to_vec();

        let pushed = ChatMessage::new(MessageRole::User, words(extra));
        session.push(pushed.clone());
        prop_assert_eq!(session.pop(), Some(pushed));
        prop_assert_eq!(session.messages(), before.as_slice());
    }
}

#[test]
fn empty_history_returns_only_the_prompt() {
    let session = session(10, &[], 50);
    let payload = session.finish();
    assert!(payload.window.is_empty());
    assert_eq!(payload.tokens, 10);
    assert_eq!(payload.prefix.len(), 1);
}

#[test]
fn older_messages_are_not_revisited_after_an_overflow() {
    // 5 + 1 would fit, but the walk stops at the 100-token message.
    let session = session(0, &[1, 100, 5], 10);
    let payload = session.finish();
    assert_eq!(payload.window.len(), 1);
    assert_eq!(payload.tokens, 5);
}
