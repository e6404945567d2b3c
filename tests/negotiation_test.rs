//! Offer/answer Integration Tests

mod common;

use common::*;
use meshcall::config::Config;
use meshcall::domain::negotiation::{NegotiationRole, RenegotiationPolicy};
use meshcall::domain::session::PeerSessionState;
use meshcall::domain::transport::{IceCandidate, TransportEvent};

fn config_with(policy: RenegotiationPolicy) -> Config {
    let mut config = test_config();
    config.negotiation.renegotiation = policy;
    config
}

#[tokio::test(start_paused = true)]
async fn test_initiator_sends_single_offer_after_setup_delay() {
    let h = setup_engine("p1", test_config());
    h.join("room_123").await;
    h.user_joined("p2");

    let snapshot = h.snapshot().await;
    let peer = snapshot.peer(&"p2".into()).unwrap();
    assert_eq!(peer.state, PeerSessionState::New);
    assert_eq!(peer.role, Some(NegotiationRole::Initiator));
    assert_eq!(h.signaling.count("SendOffer"), 0);

    h.wait(1100).await;
    assert_eq!(h.signaling.count("SendOffer"), 1);
    let snapshot = h.snapshot().await;
    let peer = snapshot.peer(&"p2".into()).unwrap();
    assert_eq!(peer.state, PeerSessionState::Negotiating);
    assert!(peer.awaiting_answer);

    h.answer_from("p2");
    let snapshot = h.snapshot().await;
    assert_eq!(
        snapshot.peer(&"p2".into()).unwrap().state,
        PeerSessionState::Connected
    );
    assert_eq!(h.factory.latest("p2").count("set_remote:Answer"), 1);
    // no second offer later on
    h.wait(30_000).await;
    assert_eq!(h.signaling.count("SendOffer"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_responder_never_offers() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    h.user_joined("p2");
    h.wait(5000).await;

    assert_eq!(h.signaling.count("SendOffer"), 0);
    let snapshot = h.snapshot().await;
    assert_eq!(
        snapshot.peer(&"p2".into()).unwrap().role,
        Some(NegotiationRole::Responder)
    );
}

#[tokio::test(start_paused = true)]
async fn test_offer_gets_exactly_one_answer() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    h.offer_from("p2");

    let snapshot = h.snapshot().await;
    assert_eq!(h.signaling.answers_to("p2"), 1);
    assert_eq!(
        snapshot.peer(&"p2".into()).unwrap().state,
        PeerSessionState::Connected
    );
    assert_eq!(h.factory.created_for("p2"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_candidates_before_offer_are_applied_after_it() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    h.user_joined("p2");
    h.candidate_from("p2", 1);
    h.candidate_from("p2", 2);

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.peer(&"p2".into()).unwrap().pending_candidates, 2);
    assert_eq!(h.factory.latest("p2").count("add_candidate"), 0);

    h.offer_from("p2");
    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.peer(&"p2".into()).unwrap().pending_candidates, 0);

    let ops = h.factory.latest("p2").ops();
    let remote = ops.iter().position(|o| o == "set_remote:Offer").unwrap();
    let first = ops.iter().position(|o| o.contains("10.0.0.1 ")).unwrap();
    let second = ops.iter().position(|o| o.contains("10.0.0.2 ")).unwrap();
    let answer = ops.iter().position(|o| o == "create_answer").unwrap();
    assert!(remote < first && first < second && second < answer);

    // later candidates go straight to the transport
    h.candidate_from("p2", 3);
    h.snapshot().await;
    assert_eq!(h.factory.latest("p2").count("add_candidate"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_candidate_from_unknown_participant_is_dropped() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    let mut rx = h.engine.subscribe_status();

    h.candidate_from("p9", 1);
    let snapshot = h.snapshot().await;
    assert!(snapshot.peers.is_empty());
    assert_eq!(h.factory.created_for("p9"), 0);
    assert!(error_categories(&drain(&mut rx)).contains(&"not_found".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_offer_leaves_session_untouched() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    h.user_joined("p2");
    h.snapshot().await;
    h.factory.latest("p2").reject_remote_descriptions();
    let mut rx = h.engine.subscribe_status();

    h.offer_from("p2");
    let snapshot = h.snapshot().await;
    let peer = snapshot.peer(&"p2".into()).unwrap();
    assert_eq!(peer.state, PeerSessionState::New);
    assert!(peer.last_error.is_some());
    assert_eq!(h.signaling.answers_to("p2"), 0);
    assert!(error_categories(&drain(&mut rx)).contains(&"negotiation".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_initiator_ignores_competing_offer() {
    let h = setup_engine("p1", test_config());
    h.join("room_123").await;
    h.user_joined("p2");
    h.wait(1100).await;
    assert_eq!(h.signaling.count("SendOffer"), 1);

    h.offer_from("p2");
    let snapshot = h.snapshot().await;
    let peer = snapshot.peer(&"p2".into()).unwrap();
    assert!(peer.awaiting_answer);
    assert_eq!(h.signaling.answers_to("p2"), 0);
    assert_eq!(h.factory.latest("p2").count("set_remote"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_local_candidates_are_relayed_in_order() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    h.offer_from("p2");
    h.snapshot().await;

    for n in 1..=3 {
        h.factory.emit(
            "p2",
            TransportEvent::LocalCandidate(IceCandidate::new(format!("candidate:{} 1 udp 1 10.1.0.{} 9 typ host", n, n))),
        );
    }
    h.wait(10).await;

    let relayed = h.signaling.candidates_to("p2");
    assert_eq!(relayed.len(), 3);
    for (i, json) in relayed.iter().enumerate() {
        let candidate = IceCandidate::from_json(json).unwrap();
        assert!(candidate.candidate.starts_with(&format!("candidate:{} ", i + 1)));
    }
}

#[tokio::test(start_paused = true)]
async fn test_queued_candidates_of_closed_session_are_not_relayed() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    h.offer_from("p2");
    h.snapshot().await;

    for n in 1..=3 {
        h.factory.emit(
            "p2",
            TransportEvent::LocalCandidate(IceCandidate::new(format!("candidate:{} 1 udp 1 10.1.0.{} 9 typ host", n, n))),
        );
    }
    h.user_left("p2");
    h.wait(10).await;

    assert!(h.signaling.candidates_to("p2").is_empty());
    assert!(h.factory.latest("p2").is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_renegotiation_coalesces_to_one_follow_up() {
    let h = setup_engine("p1", config_with(RenegotiationPolicy::CoalesceOne));
    h.connect_to("p2").await;
    assert_eq!(h.signaling.count("SendOffer"), 1);

    h.factory.emit("p2", TransportEvent::NegotiationNeeded);
    h.snapshot().await;
    assert_eq!(h.signaling.count("SendOffer"), 2);

    // both arrive while the second round is in flight
    h.factory.emit("p2", TransportEvent::NegotiationNeeded);
    h.factory.emit("p2", TransportEvent::NegotiationNeeded);
    let snapshot = h.snapshot().await;
    assert!(snapshot.peer(&"p2".into()).unwrap().pending_retrigger);
    assert_eq!(h.signaling.count("SendOffer"), 2);

    h.answer_from("p2");
    let snapshot = h.snapshot().await;
    assert_eq!(h.signaling.count("SendOffer"), 3);
    let peer = snapshot.peer(&"p2".into()).unwrap();
    assert!(!peer.pending_retrigger);
    assert!(peer.awaiting_answer);
}

#[tokio::test(start_paused = true)]
async fn test_renegotiation_drop_policy_discards_triggers_in_flight() {
    let h = setup_engine("p1", config_with(RenegotiationPolicy::Drop));
    h.connect_to("p2").await;

    h.factory.emit("p2", TransportEvent::NegotiationNeeded);
    h.factory.emit("p2", TransportEvent::NegotiationNeeded);
    h.snapshot().await;
    assert_eq!(h.signaling.count("SendOffer"), 2);

    h.answer_from("p2");
    let snapshot = h.snapshot().await;
    assert_eq!(h.signaling.count("SendOffer"), 2);
    assert_eq!(
        snapshot.peer(&"p2".into()).unwrap().state,
        PeerSessionState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn test_responder_ignores_negotiation_needed() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    h.offer_from("p2");
    h.snapshot().await;

    h.factory.emit("p2", TransportEvent::NegotiationNeeded);
    h.snapshot().await;
    assert_eq!(h.signaling.count("SendOffer"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_offer_times_out() {
    let h = setup_engine("p1", test_config());
    h.join("room_123").await;
    h.user_joined("p2");
    h.wait(1100).await;
    assert!(h.snapshot().await.peer(&"p2".into()).unwrap().awaiting_answer);

    h.wait(10_000).await;
    let snapshot = h.snapshot().await;
    let peer = snapshot.peer(&"p2".into()).unwrap();
    assert!(!peer.awaiting_answer);
    assert_eq!(peer.state, PeerSessionState::New);
    assert!(peer.last_error.as_deref().unwrap().contains("no answer"));

    // a late answer no longer matches a round
    let mut rx = h.engine.subscribe_status();
    h.answer_from("p2");
    h.snapshot().await;
    assert_eq!(h.factory.latest("p2").count("set_remote"), 0);
    assert!(error_categories(&drain(&mut rx)).contains(&"negotiation".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_replaced_session_ignores_old_transport() {
    let h = setup_engine("p3", test_config());
    h.join("room_123").await;
    h.user_joined("p2");
    h.user_joined("p2");
    let snapshot = h.snapshot().await;

    assert_eq!(h.factory.created_for("p2"), 2);
    let transports = h.factory.transports("p2");
    assert!(transports[0].is_closed());
    assert!(!transports[1].is_closed());
    assert_eq!(snapshot.peers.len(), 1);

    h.factory.emit_from_first(
        "p2",
        TransportEvent::LocalCandidate(IceCandidate::new("candidate:9 1 udp 1 10.9.9.9 9 typ host")),
    );
    h.wait(10).await;
    assert!(h.signaling.candidates_to("p2").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_own_events_are_ignored() {
    let h = setup_engine("p1", test_config());
    h.join("room_123").await;
    h.user_joined("p1");
    h.offer_from("p1");

    let snapshot = h.snapshot().await;
    assert!(snapshot.peers.is_empty());
    assert_eq!(h.factory.created_for("p1"), 0);
}
