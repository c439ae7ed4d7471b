use handover::application::transfer::TransferSupplement;
use handover::config::Config;
use handover::domain::channel::{Channel, ControlSubclass, Frame, FrameDirection};
use handover::domain::routing::StaticDialplan;
use handover::domain::session::{DialogKey, Session, SessionRegistry};
use handover::infrastructure::media::bridge::BridgeManager;
use handover::infrastructure::protocols::sip::{
    SignalingSink, SipError, SipRequest, SipResponse,
};
use std::sync::Arc;
use tracing::{info, Level};

/// Sink that logs outbound signaling instead of hitting the wire
struct LoggingSink;

#[async_trait::async_trait]
impl SignalingSink for LoggingSink {
    async fn send_response(
        &self,
        _request: &SipRequest,
        response: SipResponse,
    ) -> Result<(), SipError> {
        info!("Sending response:\n{}", String::from_utf8_lossy(&response.to_bytes()));
        Ok(())
    }

    async fn send_request(&self, request: SipRequest) -> Result<(), SipError> {
        info!("Sending request:\n{}", String::from_utf8_lossy(&request.to_bytes()));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting Handover transfer engine");

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded: {:?}", config);

    // Demo: walk a blind transfer end to end to verify the wiring
    demo_blind_transfer(&config).await?;

    info!("Handover transfer engine initialized successfully");
    Ok(())
}

/// Demonstrate a monitored blind transfer
async fn demo_blind_transfer(config: &Config) -> anyhow::Result<()> {
    info!("=== Blind Transfer Demo ===");

    let registry = Arc::new(SessionRegistry::new());
    let bridges = Arc::new(BridgeManager::new());
    let dialplan = Arc::new(StaticDialplan::new());
    dialplan.add_extension(&config.transfer.default_context, "1000");

    let supplement = TransferSupplement::new(
        registry.clone(),
        bridges.clone(),
        dialplan,
        Arc::new(LoggingSink),
    );

    // Alice talks to Bob; Bob refers Alice to extension 1000
    let alice = Session::with_channel(
        DialogKey::new("demo-call@localhost", "alice-tag", "bob-tag"),
        &config.transfer.default_context,
        "PJSIP/alice-00000001",
    );
    registry.insert(&alice);
    let bob = Channel::new("PJSIP/bob-00000002");
    bridges.bridge_pair(
        &alice.channel().ok_or_else(|| anyhow::anyhow!("no channel"))?,
        &bob,
        true,
    );
    info!("Call established between Alice and Bob");

    let refer = SipRequest::parse(
        b"REFER sip:alice@localhost SIP/2.0\r\n\
          Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bKdemo\r\n\
          From: Bob <sip:bob@localhost>;tag=bob-tag\r\n\
          To: Alice <sip:alice@localhost>;tag=alice-tag\r\n\
          Call-ID: demo-call@localhost\r\n\
          CSeq: 2 REFER\r\n\
          Refer-To: <sip:1000@localhost>\r\n\
          Referred-By: <sip:bob@localhost>\r\n\
          Contact: <sip:bob@192.168.1.10:5060>\r\n\
          Content-Length: 0\r\n\r\n",
    )
    .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let consumed = supplement
        .incoming_request(&alice, &refer)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    info!("REFER consumed by transfer handling: {}", consumed);

    // The replacement leg rings and answers
    let replacement = bridges
        .bridge_of(&bob)
        .and_then(|bridge| bridge.peer_of(&bob))
        .ok_or_else(|| anyhow::anyhow!("replacement leg missing"))?;
    info!("Replacement leg '{}' dialing", replacement.name());
    replacement.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Ringing));
    replacement.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Answer));

    // Give the queued notifications a moment to drain
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    info!(
        "Transferer termination deferred: {}",
        alice.termination_deferred()
    );
    info!("=== Blind Transfer Demo Complete ===");
    Ok(())
}
