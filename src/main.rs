//! call-loopback - Zwei Teilnehmer im selben Prozess
//!
//! Alice ruft Bob an, Bob nimmt an, nach kurzer Gesprächszeit legt Alice
//! auf. `loopback` (Standard) nutzt den In-Process Transport, `rtc` echte
//! webrtc-rs Peer Connections über localhost.

use anyhow::{bail, Context, Result};
use call_core::call::{CallType, ConversationId, UserId};
use call_core::config::CallConfig;
use call_core::database::CallDatabase;
use call_core::media::SyntheticMediaDevices;
use call_core::peer::{ConnectionState, LoopbackNetwork, RtcTransportFactory, TransportFactory};
use call_core::signaling::BroadcastHub;
use call_core::{init_tracing, CallApp};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const STEP_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "loopback".to_string());
    let factory: Arc<dyn TransportFactory> = match mode.as_str() {
        "loopback" => Arc::new(LoopbackNetwork::new()),
        "rtc" => Arc::new(RtcTransportFactory::new().context("creating WebRTC API")?),
        other => bail!("unknown mode '{}', expected 'loopback' or 'rtc'", other),
    };

    let mut config = CallConfig::from_env().context("reading environment")?;
    config.timings.poll_interval_ms = 250;

    let db = Arc::new(CallDatabase::open_in_memory()?);
    let hub = BroadcastHub::new();
    let conversation = ConversationId::from("loopback-chat");
    let alice_id = UserId::from("alice");
    let bob_id = UserId::from("bob");
    db.add_member(&conversation, &alice_id)?;
    db.add_member(&conversation, &bob_id)?;

    let mut apps = Vec::new();
    for user in [&alice_id, &bob_id] {
        let app = CallApp::builder(user.clone())
            .config(config.clone())
            .database(Arc::clone(&db))
            .signal_path(hub.clone())
            .devices(Arc::new(SyntheticMediaDevices::new()))
            .transport_factory(Arc::clone(&factory))
            .build()
            .await?;
        app.start()?;
        apps.push(app);
    }
    let (alice, bob) = (&apps[0], &apps[1]);

    let call = alice
        .start_call(conversation, bob_id.clone(), CallType::Video)
        .await?;
    println!("alice: {}", alice.call_view().status_text);

    let mut incoming = bob.controller().watch_incoming();
    timeout(STEP_TIMEOUT, incoming.wait_for(|c| c.is_some()))
        .await
        .context("bob never saw the call")??;
    println!("bob:   {}", bob.call_view().status_text);

    bob.accept_call(&call.id).await?;
    for app in [alice, bob] {
        let session = app.session().context("no session after start")?;
        let mut state = session.watch_state();
        timeout(STEP_TIMEOUT, state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .with_context(|| format!("{} never connected", app.user_id()))??;
    }

    let mut active = alice.controller().watch_active();
    timeout(
        STEP_TIMEOUT,
        active.wait_for(|c| c.as_ref().is_some_and(|c| c.started_at.is_some())),
    )
    .await
    .context("call never became active")??;
    println!("alice: {}", alice.call_view().status_text);
    println!("bob:   {}", bob.call_view().status_text);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let ended = alice.hangup().await?;

    let mut bob_active = bob.controller().watch_active();
    timeout(
        STEP_TIMEOUT,
        bob_active.wait_for(|c| c.as_ref().map_or(true, |c| c.status.is_terminal())),
    )
    .await
    .context("bob never saw the hangup")??;
    println!("bob:   {}", bob.call_view().status_text);

    let talk_time = ended
        .talk_time()
        .map(|d| format!("{} ms", d.num_milliseconds()))
        .unwrap_or_else(|| "-".to_string());
    println!("call {} ended as {}, talk time {}", ended.id, ended.status, talk_time);

    for app in &apps {
        app.shutdown().await;
    }
    Ok(())
}
