mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use common::*;
use waflow::config::EngineConfig;
use waflow::engine::{IgnoreReason, InboundOutcome};
use waflow::flow::executor::MAX_DELAY;
use waflow::flow::ValidationFailure;
use waflow::prompting::RETRIES_EXHAUSTED_NOTICE;
use waflow::scheduler::sweep_timeouts;
use waflow::session::SessionOutcome;
use waflow::store::SessionStore;
use waflow::types::{Attachment, InboundMessage, SessionStatus};

fn choice_flow() -> waflow::types::Flow {
    flow(
        "menu",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node(
                "ask",
                "response",
                json!({
                    "message": "Pick 1 or 2",
                    "responseType": "choice",
                    "choices": [
                        { "value": "1", "label": "Sales", "targetNodeId": "A" },
                        { "value": "2", "label": "Support", "targetNodeId": "B" }
                    ]
                }),
            ),
            send_message("A", "Sales it is"),
            send_message("B", "Support it is"),
        ],
        vec![edge("t", "ask")],
    )
}

fn email_flow(max_retries: Option<u32>) -> waflow::types::Flow {
    let mut config = json!({ "message": "Your email?", "responseType": "email", "variableName": "email" });
    if let Some(max) = max_retries {
        config["maxRetries"] = json!(max);
    }
    flow(
        "signup",
        vec![
            trigger("t", json!({ "triggerType": "text_equals", "text": "signup" })),
            node("ask", "response", config),
            send_message("done", "Thanks {{email}}"),
        ],
        vec![edge("t", "ask"), edge("ask", "done")],
    )
}

#[tokio::test]
async fn greeting_trigger_replies_once_without_session() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "greet",
        vec![
            trigger("t", json!({ "triggerType": "text_equals", "text": "hi" })),
            send_message("a", "Hello!"),
        ],
        vec![edge("t", "a")],
    ))
    .await;

    let outcome = h.send("m1", "Hi").await;
    assert_eq!(
        outcome,
        InboundOutcome::Triggered {
            fired: 1,
            failed: 0,
            suspended: false
        }
    );
    assert_eq!(h.channel.texts(), vec!["Hello!".to_string()]);
    assert!(h.session().await.is_none());
    assert!(h.store.sessions_for(&instance().contact(CONTACT)).await.is_empty());
}

#[tokio::test]
async fn unmatched_message_does_nothing() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "greet",
        vec![
            trigger("t", json!({ "triggerType": "text_equals", "text": "hi" })),
            send_message("a", "Hello!"),
        ],
        vec![edge("t", "a")],
    ))
    .await;

    assert_eq!(h.send("m1", "hello there").await, InboundOutcome::NoMatch);
    assert!(h.channel.sent().is_empty());
}

#[tokio::test]
async fn choice_reply_follows_target_node() {
    let h = Harness::new().await;
    h.add_flow(choice_flow()).await;

    let outcome = h.send("m1", "hello").await;
    assert_eq!(
        outcome,
        InboundOutcome::Triggered {
            fired: 1,
            failed: 0,
            suspended: true
        }
    );
    let session = h.session().await.expect("session parked");
    assert!(session.is_waiting_for_response);
    assert_eq!(session.current_node_id, "ask");
    assert_eq!(h.channel.texts(), vec!["Pick 1 or 2".to_string()]);

    let outcome = h.send("m2", "1").await;
    assert_eq!(
        outcome,
        InboundOutcome::Resumed(SessionOutcome::Ended(SessionStatus::Completed))
    );
    assert_eq!(h.channel.texts().last().map(String::as_str), Some("Sales it is"));
    assert!(h.session().await.is_none());

    let history = h.store.sessions_for(&instance().contact(CONTACT)).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, SessionStatus::Completed);
    assert!(!history[0].is_waiting_for_response);
    assert_eq!(history[0].variables.get("lastResponse").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn choice_matching_ignores_case_and_whitespace() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "confirm",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node(
                "ask",
                "response",
                json!({
                    "message": "Confirm? yes/no",
                    "responseType": "choice",
                    "choices": [{ "value": "Yes", "targetNodeId": "ok" }, { "value": "No" }]
                }),
            ),
            send_message("ok", "Confirmed"),
            send_message("cancel", "Cancelled"),
        ],
        vec![edge("t", "ask"), tagged_edge("ask", "cancel", "no")],
    ))
    .await;

    h.send("m1", "start").await;
    h.send("m2", "  YES ").await;
    assert_eq!(h.channel.texts().last().map(String::as_str), Some("Confirmed"));
    let history = h.store.sessions_for(&instance().contact(CONTACT)).await;
    assert_eq!(
        history[0].variables.get("lastResponse").map(String::as_str),
        Some("  YES ")
    );

    h.send("m3", "again").await;
    h.send("m4", "no").await;
    assert_eq!(h.channel.texts().last().map(String::as_str), Some("Cancelled"));
}

#[tokio::test]
async fn choice_target_that_is_a_response_keeps_waiting() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "survey",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node(
                "ask",
                "response",
                json!({
                    "message": "Pick 1 or 2",
                    "responseType": "choice",
                    "choices": [{ "value": "1", "targetNodeId": "A" }, { "value": "2" }]
                }),
            ),
            node("A", "response", json!({ "message": "Your name?", "responseType": "text" })),
        ],
        vec![edge("t", "ask")],
    ))
    .await;

    h.send("m1", "start").await;
    let outcome = h.send("m2", "1").await;
    assert_eq!(
        outcome,
        InboundOutcome::Resumed(SessionOutcome::Waiting {
            node_id: "A".to_string()
        })
    );
    let session = h.session().await.expect("still active");
    assert_eq!(session.current_node_id, "A");
    assert!(session.is_waiting_for_response);
    assert_eq!(session.response_count, 1);
}

#[tokio::test]
async fn invalid_email_reprompts_on_same_node() {
    let h = Harness::new().await;
    h.add_flow(email_flow(None)).await;
    h.send("m1", "signup").await;

    let outcome = h.send("m2", "not-an-email").await;
    assert_eq!(
        outcome,
        InboundOutcome::Resumed(SessionOutcome::Reprompted {
            failure: ValidationFailure::NotAnEmail,
            retry_count: 1
        })
    );
    let session = h.session().await.expect("session still active");
    assert!(session.is_waiting_for_response);
    assert_eq!(session.current_node_id, "ask");
    assert_eq!(session.retry_count, 1);
    assert_eq!(h.channel.sent().len(), 2);

    let outcome = h.send("m3", "ana@example.com").await;
    assert_eq!(
        outcome,
        InboundOutcome::Resumed(SessionOutcome::Ended(SessionStatus::Completed))
    );
    assert_eq!(
        h.channel.texts().last().map(String::as_str),
        Some("Thanks ana@example.com")
    );
}

#[tokio::test]
async fn node_retry_limit_abandons_session() {
    let h = Harness::new().await;
    h.add_flow(email_flow(Some(1))).await;
    h.send("m1", "signup").await;

    assert!(matches!(
        h.send("m2", "nope").await,
        InboundOutcome::Resumed(SessionOutcome::Reprompted { retry_count: 1, .. })
    ));
    assert_eq!(
        h.send("m3", "still nope").await,
        InboundOutcome::Resumed(SessionOutcome::Ended(SessionStatus::Abandoned))
    );
    assert_eq!(
        h.channel.texts().last().map(String::as_str),
        Some(RETRIES_EXHAUSTED_NOTICE)
    );
    assert!(h.session().await.is_none());
}

#[tokio::test]
async fn global_retry_limit_applies_without_node_override() {
    let h = Harness::with_config(EngineConfig {
        max_validation_retries: Some(0),
        ..EngineConfig::default()
    })
    .await;
    h.add_flow(email_flow(None)).await;
    h.send("m1", "signup").await;

    assert_eq!(
        h.send("m2", "nope").await,
        InboundOutcome::Resumed(SessionOutcome::Ended(SessionStatus::Abandoned))
    );
}

#[tokio::test]
async fn redelivered_message_is_handled_once() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "greet",
        vec![
            trigger("t", json!({ "triggerType": "contains", "text": "price" })),
            send_message("a", "Our prices start at 10"),
        ],
        vec![edge("t", "a")],
    ))
    .await;

    h.send("wamid.1", "what is the price?").await;
    assert_eq!(h.send("wamid.1", "what is the price?").await, InboundOutcome::Duplicate);
    assert_eq!(h.channel.sent().len(), 1);
}

#[tokio::test]
async fn own_group_and_empty_messages_are_ignored() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "any",
        vec![trigger("t", json!({ "triggerType": "any_message" })), send_message("a", "hey")],
        vec![edge("t", "a")],
    ))
    .await;

    let mut own = InboundMessage::text("m1", CONTACT, "hello");
    own.from_me = true;
    let group = InboundMessage::text("m2", "1203630@g.us", "hello");
    let empty = InboundMessage::text("m3", CONTACT, "   ");

    for (message, reason) in [
        (own, IgnoreReason::FromSelf),
        (group, IgnoreReason::GroupChat),
        (empty, IgnoreReason::Empty),
    ] {
        let outcome = h.engine.handle_inbound(message, TENANT, INSTANCE).await.unwrap();
        assert_eq!(outcome, InboundOutcome::Ignored(reason));
    }
    assert!(h.channel.sent().is_empty());
}

#[tokio::test]
async fn condition_prefers_tagged_edges() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "branch",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node(
                "check",
                "condition",
                json!({ "variable": "message", "operator": "equals", "value": "yes" }),
            ),
            send_message("yes", "Great"),
            send_message("no", "Maybe later"),
            send_message("always", "fallback"),
        ],
        vec![
            edge("t", "check"),
            tagged_edge("check", "yes", "true"),
            tagged_edge("check", "no", "false"),
            edge("check", "always"),
        ],
    ))
    .await;

    h.send("m1", "yes").await;
    h.send("m2", "no").await;
    assert_eq!(
        h.channel.texts(),
        vec!["Great".to_string(), "Maybe later".to_string()]
    );
}

#[tokio::test]
async fn condition_falls_back_to_untagged_edges() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "branch",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node(
                "check",
                "condition",
                json!({ "variable": "message", "operator": "greater_than", "value": 100 }),
            ),
            send_message("big", "Big order"),
            send_message("always", "Noted"),
        ],
        vec![
            edge("t", "check"),
            tagged_edge("check", "big", "true"),
            edge("check", "always"),
        ],
    ))
    .await;

    h.send("m1", "250").await;
    h.send("m2", "20").await;
    assert_eq!(h.channel.texts(), vec!["Big order".to_string(), "Noted".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn delay_node_waits_before_continuing() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "slow",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            send_message("first", "one"),
            node("wait", "delay", json!({ "duration": 30 })),
            send_message("second", "two"),
        ],
        vec![edge("t", "first"), edge("first", "wait"), edge("wait", "second")],
    ))
    .await;

    let started = tokio::time::Instant::now();
    h.send("m1", "go").await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.channel.texts(), vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn variables_are_interpolated() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "vars",
        vec![
            trigger("t", json!({ "triggerType": "starts_with", "text": "order" })),
            node(
                "set",
                "action",
                json!({ "actionType": "set_variable", "variableName": "ref", "value": "#{{message}}" }),
            ),
            send_message("a", "Hi {{contact.name}}, got {{ref}} {{unknown}}"),
        ],
        vec![edge("t", "set"), edge("set", "a")],
    ))
    .await;

    h.send("m1", "order 42").await;
    assert_eq!(
        h.channel.texts(),
        vec![format!("Hi {CONTACT}, got #order 42 {{{{unknown}}}}")]
    );
}

#[tokio::test]
async fn flows_fire_in_creation_order_until_one_suspends() {
    let h = Harness::new().await;
    let now = Utc::now();
    let mut first = flow(
        "first",
        vec![trigger("t", json!({ "triggerType": "any_message" })), send_message("a", "first")],
        vec![edge("t", "a")],
    );
    first.created_at = now - ChronoDuration::minutes(3);
    let mut second = choice_flow();
    second.created_at = now - ChronoDuration::minutes(2);
    let mut third = flow(
        "third",
        vec![trigger("t", json!({ "triggerType": "any_message" })), send_message("a", "third")],
        vec![edge("t", "a")],
    );
    third.created_at = now - ChronoDuration::minutes(1);
    for f in [third, first, second] {
        h.add_flow(f).await;
    }

    let outcome = h.send("m1", "hello").await;
    assert_eq!(
        outcome,
        InboundOutcome::Triggered {
            fired: 2,
            failed: 0,
            suspended: true
        }
    );
    assert_eq!(
        h.channel.texts(),
        vec!["first".to_string(), "Pick 1 or 2".to_string()]
    );
}

#[tokio::test]
async fn contact_never_has_two_active_sessions() {
    let h = Harness::new().await;
    let mut other = choice_flow();
    other.id = "menu-2".to_string();
    other.created_at = Utc::now() + ChronoDuration::seconds(1);
    h.add_flow(choice_flow()).await;
    h.add_flow(other).await;

    let engine = h.engine.clone();
    let tasks = (0..4).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .handle_inbound(
                    InboundMessage::text(format!("m{i}"), CONTACT, "hello"),
                    TENANT,
                    INSTANCE,
                )
                .await
                .unwrap()
        })
    });
    for task in tasks.collect::<Vec<_>>() {
        task.await.unwrap();
    }

    let sessions = h.store.sessions_for(&instance().contact(CONTACT)).await;
    assert_eq!(sessions.iter().filter(|s| s.is_active).count(), 1);
    assert!(h.engine.locks().is_empty());
}

#[tokio::test]
async fn send_failure_ends_run_and_marks_session() {
    let h = Harness::new().await;
    h.add_flow(email_flow(None)).await;
    h.send("m1", "signup").await;
    h.channel.set_failing(true);

    let result = h
        .engine
        .handle_inbound(InboundMessage::text("m2", CONTACT, "ana@example.com"), TENANT, INSTANCE)
        .await;
    assert!(result.is_err());
    assert!(h.session().await.is_none());
    let history = h.store.sessions_for(&instance().contact(CONTACT)).await;
    assert_eq!(history[0].status, SessionStatus::Error);
}

#[tokio::test]
async fn failing_trigger_run_is_contained() {
    let h = Harness::new().await;
    h.channel.set_failing(true);
    h.add_flow(flow(
        "greet",
        vec![trigger("t", json!({ "triggerType": "any_message" })), send_message("a", "Hello!")],
        vec![edge("t", "a")],
    ))
    .await;

    assert_eq!(
        h.send("m1", "hi").await,
        InboundOutcome::Triggered {
            fired: 1,
            failed: 1,
            suspended: false
        }
    );
}

#[tokio::test]
async fn cyclic_flow_hits_step_budget() {
    let h = Harness::with_config(EngineConfig {
        max_steps: 10,
        ..EngineConfig::default()
    })
    .await;
    h.add_flow(flow(
        "loop",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node("a", "action", json!({ "actionType": "set_variable", "variableName": "x", "value": "1" })),
            node("b", "action", json!({ "actionType": "set_variable", "variableName": "y", "value": "2" })),
        ],
        vec![edge("t", "a"), edge("a", "b"), edge("b", "a")],
    ))
    .await;

    assert_eq!(
        h.send("m1", "hi").await,
        InboundOutcome::Triggered {
            fired: 1,
            failed: 1,
            suspended: false
        }
    );
}

async fn age_session(h: &Harness, minutes: i64) {
    let mut session = h.session().await.expect("active session");
    session.last_activity_at = Utc::now() - ChronoDuration::minutes(minutes);
    h.store.update_session(&session).await.unwrap();
}

#[tokio::test]
async fn timeout_follows_timeout_branch() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "timed",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node(
                "ask",
                "response",
                json!({ "message": "Still there?", "timeout": { "minutes": 5, "timeoutNodeId": "late" } }),
            ),
            send_message("late", "We will follow up later"),
        ],
        vec![edge("t", "ask")],
    ))
    .await;
    h.send("m1", "hi").await;

    assert_eq!(sweep_timeouts(h.store.as_ref(), &h.engine, Utc::now()).await, 0);
    age_session(&h, 10).await;
    assert_eq!(sweep_timeouts(h.store.as_ref(), &h.engine, Utc::now()).await, 1);

    assert_eq!(
        h.channel.texts().last().map(String::as_str),
        Some("We will follow up later")
    );
    let history = h.store.sessions_for(&instance().contact(CONTACT)).await;
    assert_eq!(history[0].status, SessionStatus::Completed);
    assert_eq!(history[0].variables.get("timedOut").map(String::as_str), Some("true"));
}

#[tokio::test]
async fn timeout_without_branch_ends_session() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "timed",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node("ask", "response", json!({ "message": "Still there?", "timeout": { "minutes": 5 } })),
        ],
        vec![edge("t", "ask")],
    ))
    .await;
    h.send("m1", "hi").await;
    age_session(&h, 6).await;

    assert_eq!(sweep_timeouts(h.store.as_ref(), &h.engine, Utc::now()).await, 1);
    assert!(h.session().await.is_none());
    let history = h.store.sessions_for(&instance().contact(CONTACT)).await;
    assert_eq!(history[0].status, SessionStatus::Timeout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inbound_messages_keep_arrival_order_per_contact() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "echo",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            send_message("a", "{{message}}"),
        ],
        vec![edge("t", "a")],
    ))
    .await;

    for i in 0..300 {
        h.engine.on_inbound_message(
            InboundMessage::text(format!("m{i}"), CONTACT, i.to_string()),
            TENANT.to_string(),
            INSTANCE.to_string(),
        );
    }

    for _ in 0..500 {
        if h.channel.sent().len() == 300 && h.engine.pending_contacts() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let expected = (0..300).map(|i| i.to_string()).collect::<Vec<_>>();
    assert_eq!(h.channel.texts(), expected);
    assert_eq!(h.engine.pending_contacts(), 0);
}

#[tokio::test(start_paused = true)]
async fn oversized_delay_is_capped() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "forever",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            node("wait", "delay", json!({ "duration": 1e20 })),
            send_message("after", "still here"),
        ],
        vec![edge("t", "wait"), edge("wait", "after")],
    ))
    .await;

    let started = tokio::time::Instant::now();
    h.send("m1", "go").await;
    assert!(started.elapsed() >= MAX_DELAY);
    assert_eq!(h.channel.texts(), vec!["still here".to_string()]);
}

type Captured = Arc<Mutex<Vec<(Option<String>, Value)>>>;

/// Local HTTP endpoint: `/hook` records requests, `/broken` answers 500.
async fn webhook_receiver() -> (String, Captured) {
    let captured: Captured = Arc::default();
    let app = Router::new()
        .route(
            "/hook",
            post(|State(captured): State<Captured>, headers: HeaderMap, Json(body): Json<Value>| async move {
                let contact = headers
                    .get("x-contact")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                captured.lock().unwrap().push((contact, body));
                StatusCode::OK
            }),
        )
        .route("/broken", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .with_state(captured.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), captured)
}

fn webhook(id: &str, url: &str) -> Value {
    node(
        id,
        "action",
        json!({
            "actionType": "webhook",
            "webhookUrl": url,
            "method": "POST",
            "headers": { "x-contact": "{{contact.number}}" }
        }),
    )
}

#[tokio::test]
async fn webhook_action_posts_conversation_payload() {
    let (base, captured) = webhook_receiver().await;
    let h = Harness::new().await;
    h.add_flow(flow(
        "crm",
        vec![
            trigger("t", json!({ "triggerType": "starts_with", "text": "quote" })),
            node("set", "action", json!({ "actionType": "set_variable", "variableName": "plan", "value": "gold" })),
            webhook("hook", &format!("{base}/hook")),
            send_message("a", "We'll be in touch"),
        ],
        vec![edge("t", "set"), edge("set", "hook"), edge("hook", "a")],
    ))
    .await;

    h.send("m1", "quote for 3 seats").await;

    let requests = captured.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let (contact_header, payload) = &requests[0];
    assert_eq!(contact_header.as_deref(), Some(CONTACT));
    assert_eq!(payload["message"], "quote for 3 seats");
    assert_eq!(payload["from"], CONTACT);
    assert_eq!(payload["variables"]["plan"], "gold");
    assert_eq!(payload["variables"]["contact.number"], CONTACT);
    assert!(payload["timestamp"]
        .as_str()
        .is_some_and(|ts| chrono::DateTime::parse_from_rfc3339(ts).is_ok()));
    assert_eq!(h.channel.texts(), vec!["We'll be in touch".to_string()]);
}

#[tokio::test]
async fn webhook_failure_does_not_abort_flow() {
    let (base, captured) = webhook_receiver().await;
    let h = Harness::new().await;
    h.add_flow(flow(
        "crm",
        vec![
            trigger("t", json!({ "triggerType": "any_message" })),
            webhook("broken", &format!("{base}/broken")),
            webhook("unreachable", "http://127.0.0.1:1/hook"),
            send_message("a", "Thanks!"),
        ],
        vec![edge("t", "broken"), edge("broken", "unreachable"), edge("unreachable", "a")],
    ))
    .await;

    let outcome = h.send("m1", "hello").await;
    assert_eq!(
        outcome,
        InboundOutcome::Triggered {
            fired: 1,
            failed: 0,
            suspended: false
        }
    );
    assert!(captured.lock().unwrap().is_empty());
    assert_eq!(h.channel.texts(), vec!["Thanks!".to_string()]);
}

#[tokio::test]
async fn image_action_sends_media_with_caption() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "catalog",
        vec![
            trigger("t", json!({ "triggerType": "text_equals", "text": "catalog" })),
            node(
                "img",
                "action",
                json!({
                    "actionType": "send_image",
                    "imageUrl": "https://cdn.example.com/{{contact.number}}/cover.png",
                    "caption": "Hi {{contact.name}}, new arrivals"
                }),
            ),
            node(
                "doc",
                "action",
                json!({
                    "actionType": "send_document",
                    "documentUrl": "https://cdn.example.com/catalog.pdf",
                    "filename": "catalog.pdf",
                    "caption": "Full list: {{message}}"
                }),
            ),
            node(
                "bare",
                "action",
                json!({ "actionType": "send_image", "imageUrl": "https://cdn.example.com/logo.png", "caption": "  " }),
            ),
        ],
        vec![edge("t", "img"), edge("img", "doc"), edge("doc", "bare")],
    ))
    .await;

    h.send("m1", "Catalog").await;
    assert_eq!(
        h.channel.sent(),
        vec![
            Sent::Media {
                to: CONTACT.to_string(),
                url: format!("https://cdn.example.com/{CONTACT}/cover.png"),
                caption: Some(format!("Hi {CONTACT}, new arrivals")),
            },
            Sent::Media {
                to: CONTACT.to_string(),
                url: "https://cdn.example.com/catalog.pdf".to_string(),
                caption: Some("Full list: Catalog".to_string()),
            },
            Sent::Media {
                to: CONTACT.to_string(),
                url: "https://cdn.example.com/logo.png".to_string(),
                caption: None,
            },
        ]
    );
}

fn with_attachment(id: &str, media_type: &str) -> InboundMessage {
    let mut message = InboundMessage::text(id, CONTACT, "");
    message.attachment = Some(Attachment {
        media_type: media_type.to_string(),
        mime_type: None,
        url: None,
        filename: None,
    });
    message
}

#[tokio::test]
async fn media_received_trigger_fires_on_matching_attachment() {
    let h = Harness::new().await;
    h.add_flow(flow(
        "receipts",
        vec![
            trigger("t", json!({ "triggerType": "media_received", "mediaType": "image" })),
            send_message("a", "Got your photo"),
        ],
        vec![edge("t", "a")],
    ))
    .await;

    let outcome = h
        .engine
        .handle_inbound(with_attachment("m1", "image"), TENANT, INSTANCE)
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::Triggered { fired: 1, .. }));

    let outcome = h
        .engine
        .handle_inbound(with_attachment("m2", "document"), TENANT, INSTANCE)
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::NoMatch);

    let outcome = h.send("m3", "just text").await;
    assert_eq!(outcome, InboundOutcome::NoMatch);
    assert_eq!(h.channel.texts(), vec!["Got your photo".to_string()]);
}
