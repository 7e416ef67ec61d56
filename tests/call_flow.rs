//! Ende-zu-Ende Abläufe mit zwei Apps im selben Prozess
//!
//! Gemeinsame In-Memory Datenbank, In-Process Broadcast-Hub und Loopback
//! Transport.

use call_core::call::{Call, CallStatus, CallType, ConversationId, UserId};
use call_core::config::CallConfig;
use call_core::database::CallDatabase;
use call_core::media::{MediaKind, PrewarmPhase, SyntheticMediaDevices};
use call_core::peer::LoopbackNetwork;
use call_core::presenter::CallScreen;
use call_core::signaling::BroadcastHub;
use call_core::{CallApp, CallAppError};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

struct Pair {
    alice: Arc<CallApp>,
    bob: Arc<CallApp>,
    bob_devices: Arc<SyntheticMediaDevices>,
    db: Arc<CallDatabase>,
    hub: Arc<BroadcastHub>,
    network: LoopbackNetwork,
    conversation: ConversationId,
}

fn test_config() -> CallConfig {
    let mut config = CallConfig::default();
    config.timings.poll_interval_ms = 50;
    config.timings.ended_display_ms = 300;
    config.timings.ice_gathering_timeout_ms = 500;
    config.timings.failed_grace_ms = 200;
    config
}

async fn pair(bob_devices: SyntheticMediaDevices) -> Pair {
    let db = Arc::new(CallDatabase::open_in_memory().unwrap());
    let hub = BroadcastHub::new();
    let network = LoopbackNetwork::new();
    let conversation = ConversationId::from("chat-1");
    let bob_devices = Arc::new(bob_devices);

    let mut apps = Vec::new();
    for name in ["alice", "bob"] {
        let user = UserId::from(name);
        db.add_member(&conversation, &user).unwrap();
        let devices = if name == "bob" {
            Arc::clone(&bob_devices)
        } else {
            Arc::new(SyntheticMediaDevices::new())
        };
        let app = CallApp::builder(user)
            .config(test_config())
            .database(Arc::clone(&db))
            .signal_path(hub.clone())
            .devices(devices)
            .transport_factory(Arc::new(network.clone()))
            .build()
            .await
            .unwrap();
        app.start().unwrap();
        apps.push(app);
    }

    let bob = apps.pop().unwrap();
    let alice = apps.pop().unwrap();
    Pair {
        alice,
        bob,
        bob_devices,
        db,
        hub,
        network,
        conversation,
    }
}

/// Wartet bis `check` zutrifft
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Alice ruft an, Bob nimmt an, beide sind verbunden
async fn connect(pair: &Pair, call_type: CallType) -> Call {
    let call = pair
        .alice
        .start_call(pair.conversation.clone(), UserId::from("bob"), call_type)
        .await
        .unwrap();
    assert_eq!(call.status, CallStatus::Calling);

    eventually("incoming call", || pair.bob.controller().incoming_call().is_some()).await;
    pair.bob.accept_call(&call.id).await.unwrap();

    for app in [&pair.alice, &pair.bob] {
        let session = app.session().unwrap();
        eventually("connected", || session.is_connected()).await;
    }
    eventually("active record", || {
        pair.db.get_call(&call.id).unwrap().status == CallStatus::Active
    })
    .await;
    pair.db.get_call(&call.id).unwrap()
}

#[tokio::test]
async fn test_video_call_end_to_end() {
    let pair = pair(SyntheticMediaDevices::new()).await;

    let call = pair
        .alice
        .start_call(pair.conversation.clone(), UserId::from("bob"), CallType::Video)
        .await
        .unwrap();
    assert!(matches!(pair.alice.call_view().screen, CallScreen::Outgoing { .. }));

    eventually("incoming call", || pair.bob.controller().incoming_call().is_some()).await;
    let view = pair.bob.call_view();
    assert!(matches!(view.screen, CallScreen::Incoming { .. }));
    assert_eq!(view.peer_id, Some(UserId::from("alice")));

    // Pre-Warm läuft schon beim Klingeln
    eventually("pre-warmed media", || {
        pair.bob.prewarm().phase() == PrewarmPhase::Ready
    })
    .await;
    pair.bob.accept_call(&call.id).await.unwrap();
    assert_eq!(pair.bob_devices.acquisitions(), 1);

    let alice_session = pair.alice.session().unwrap();
    let bob_session = pair.bob.session().unwrap();
    eventually("alice connected", || alice_session.is_connected()).await;
    eventually("bob connected", || bob_session.is_connected()).await;

    eventually("active record", || {
        pair.db.get_call(&call.id).unwrap().status == CallStatus::Active
    })
    .await;
    let active = pair.db.get_call(&call.id).unwrap();
    let started_at = active.started_at.unwrap();
    eventually("alice in call", || {
        pair.alice.call_view().status_text == "Connected"
    })
    .await;

    let kinds: Vec<_> = alice_session.remote_tracks().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
    let bob_stream = bob_session.local_stream().unwrap();

    let ended = pair.alice.hangup().await.unwrap();
    assert_eq!(ended.status, CallStatus::Ended);
    assert_eq!(ended.started_at, Some(started_at));
    assert!(alice_session.is_ended());

    // Bob baut nach dem Hangup ab und verlässt den Call-Bildschirm
    eventually("bob torn down", || bob_session.is_ended()).await;
    assert!(bob_stream.tracks().iter().all(|t| t.is_stopped()));
    eventually("bob screen hidden", || {
        pair.bob.call_view().screen == CallScreen::Hidden
    })
    .await;
    assert!(pair.bob.session().is_none());

    let record = pair.db.get_call(&call.id).unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert_eq!(record.started_at, Some(started_at));
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn test_callee_without_camera_joins_audio_only() {
    let pair = pair(SyntheticMediaDevices::new().without(MediaKind::Video)).await;

    let call = connect(&pair, CallType::Video).await;
    assert_eq!(call.status, CallStatus::Active);
    assert_eq!(call.call_type, CallType::Video);

    let bob_session = pair.bob.session().unwrap();
    assert!(bob_session.is_video_off());
    assert!(!bob_session.local_stream().unwrap().has_video());

    let alice_session = pair.alice.session().unwrap();
    eventually("remote audio", || !alice_session.remote_tracks().is_empty()).await;
    let kinds: Vec<_> = alice_session.remote_tracks().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![MediaKind::Audio]);

    assert!(matches!(
        pair.bob.toggle_video(),
        Err(CallAppError::Peer(_))
    ));
    assert!(pair.bob.toggle_mute().unwrap());

    pair.bob.hangup().await.unwrap();
    eventually("alice torn down", || alice_session.is_ended()).await;
}

#[tokio::test]
async fn test_signaling_completes_over_polling_when_broadcast_is_lost() {
    let pair = pair(SyntheticMediaDevices::new()).await;
    pair.hub.set_dropping(true);

    let call = connect(&pair, CallType::Audio).await;
    assert_eq!(call.status, CallStatus::Active);
    assert!(call.started_at.is_some());

    // Auch das Hangup kommt über den Fallback an
    let bob_session = pair.bob.session().unwrap();
    pair.alice.hangup().await.unwrap();
    eventually("bob torn down", || bob_session.is_ended()).await;
}

#[tokio::test]
async fn test_declined_call_shows_on_caller() {
    let pair = pair(SyntheticMediaDevices::new()).await;

    let call = pair
        .alice
        .start_call(pair.conversation.clone(), UserId::from("bob"), CallType::Audio)
        .await
        .unwrap();
    let alice_session = pair.alice.session().unwrap();

    eventually("incoming call", || pair.bob.controller().incoming_call().is_some()).await;
    eventually("pre-warmed media", || {
        pair.bob.prewarm().phase() == PrewarmPhase::Ready
    })
    .await;
    let declined = pair.bob.decline_call(&call.id).await.unwrap();
    assert_eq!(declined.status, CallStatus::Declined);
    assert_eq!(pair.bob.prewarm().phase(), PrewarmPhase::Empty);

    eventually("alice sees decline", || {
        pair.alice.call_view().status_text == "Call declined"
    })
    .await;
    eventually("alice torn down", || alice_session.is_ended()).await;
    eventually("alice screen hidden", || {
        pair.alice.call_view().screen == CallScreen::Hidden
    })
    .await;

    // Danach ist ein neuer Call möglich
    let again = pair
        .alice
        .start_call(pair.conversation.clone(), UserId::from("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_ne!(again.id, call.id);
}

#[tokio::test]
async fn test_failed_connection_ends_the_call() {
    let pair = pair(SyntheticMediaDevices::new()).await;
    pair.network.set_reachable(false);

    let call = pair
        .alice
        .start_call(pair.conversation.clone(), UserId::from("bob"), CallType::Audio)
        .await
        .unwrap();
    let alice_session = pair.alice.session().unwrap();
    eventually("incoming call", || pair.bob.controller().incoming_call().is_some()).await;
    pair.bob.accept_call(&call.id).await.unwrap();

    // Nach der Gnadenfrist legt die App selbst auf
    eventually("ended record", || {
        pair.db.get_call(&call.id).unwrap().status == CallStatus::Ended
    })
    .await;
    let record = pair.db.get_call(&call.id).unwrap();
    assert!(record.started_at.is_none());
    assert!(record.ended_at.is_some());

    eventually("alice torn down", || alice_session.is_ended()).await;
    eventually("alice screen hidden", || {
        pair.alice.call_view().screen == CallScreen::Hidden
    })
    .await;
    assert!(pair.alice.session().is_none());
}

#[tokio::test]
async fn test_zero_poll_interval_is_rejected() {
    let mut config = CallConfig::default();
    config.timings.poll_interval_ms = 0;
    let result = CallApp::builder("alice")
        .config(config)
        .database(Arc::new(CallDatabase::open_in_memory().unwrap()))
        .devices(Arc::new(SyntheticMediaDevices::new()))
        .transport_factory(Arc::new(LoopbackNetwork::new()))
        .build()
        .await;
    assert!(matches!(result, Err(CallAppError::Config(_))));
}

#[tokio::test]
async fn test_controls_without_call() {
    let pair = pair(SyntheticMediaDevices::new()).await;
    assert!(matches!(pair.alice.toggle_mute(), Err(CallAppError::NoActiveCall)));
    assert!(matches!(pair.alice.hangup().await, Err(CallAppError::NoActiveCall)));
    assert_eq!(pair.alice.call_view().screen, CallScreen::Hidden);
}
