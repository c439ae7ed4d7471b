//! Frame hook feeding transfer progress
//!
//! Attached to the replacement leg of a blind transfer, the hook watches
//! outbound frames and converts call progress into notifications. A voice
//! frame before any control event means the call was answered without
//! signaling; the hook then reports success and stands down.

use super::progress::{Notification, ProgressMonitor};
use crate::domain::channel::{Channel, ControlSubclass, Frame, FrameDirection, FrameObserver};
use crate::domain::shared::Result;
use crate::infrastructure::protocols::sip::SubscriptionState;
use std::sync::Arc;
use tracing::debug;

/// Observes a channel's outbound frames on behalf of a progress monitor
pub struct ProgressFrameHook {
    monitor: Arc<ProgressMonitor>,
}

impl ProgressFrameHook {
    /// Attach a hook to `channel` and bind it to the monitor so a terminal
    /// notification can detach it again.
    pub fn attach(monitor: Arc<ProgressMonitor>, channel: &Arc<Channel>) -> Result<()> {
        let hook = Arc::new(Self {
            monitor: monitor.clone(),
        });
        let id = channel.attach_observer(hook)?;
        monitor.bind_hook(channel.clone(), id);
        debug!("Attached progress hook to channel '{}'", channel.name());
        Ok(())
    }

    fn notification_for(&self, frame: &Frame) -> Option<(u16, SubscriptionState)> {
        match frame {
            Frame::Voice => {
                // Media with no signaling seen yet: the call is up
                if self.monitor.last_subclass().is_none() {
                    Some((200, SubscriptionState::Terminated))
                } else {
                    None
                }
            }
            Frame::Control(subclass) => {
                if self.monitor.swap_subclass(*subclass) == Some(*subclass) {
                    return None;
                }
                match subclass {
                    ControlSubclass::Ring | ControlSubclass::Ringing => {
                        Some((180, SubscriptionState::Active))
                    }
                    ControlSubclass::Busy => Some((486, SubscriptionState::Terminated)),
                    ControlSubclass::Congestion => Some((503, SubscriptionState::Terminated)),
                    ControlSubclass::Progress => Some((183, SubscriptionState::Active)),
                    ControlSubclass::Proceeding => Some((100, SubscriptionState::Active)),
                    ControlSubclass::Answer => Some((200, SubscriptionState::Terminated)),
                    _ => None,
                }
            }
        }
    }
}

impl FrameObserver for ProgressFrameHook {
    fn on_frame(&self, channel: &Arc<Channel>, direction: FrameDirection, frame: &Frame) {
        if direction != FrameDirection::Write {
            return;
        }
        let Some((code, state)) = self.notification_for(frame) else {
            return;
        };
        Notification::new(self.monitor.clone(), code, state).dispatch();
        if state == SubscriptionState::Terminated {
            debug!(
                "Transfer progress on channel '{}' is final ('{}'), detaching hook",
                channel.name(),
                code
            );
            if let Some((bound, id)) = self.monitor.take_hook() {
                bound.detach_observer(id);
            }
        }
    }

    fn on_destroy(&self) {
        // The leg vanished while still monitored
        self.monitor.take_hook();
        Notification::new(self.monitor.clone(), 503, SubscriptionState::Terminated).dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::{DialogKey, Session};
    use crate::infrastructure::protocols::sip::{SignalingSink, SipError, SipRequest, SipResponse};
    use std::sync::Mutex;

    struct RecordingSink {
        requests: Mutex<Vec<SipRequest>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
            })
        }

        fn sipfrags(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|request| String::from_utf8_lossy(request.body()).to_string())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl SignalingSink for RecordingSink {
        async fn send_response(
            &self,
            _request: &SipRequest,
            _response: SipResponse,
        ) -> std::result::Result<(), SipError> {
            Ok(())
        }

        async fn send_request(&self, request: SipRequest) -> std::result::Result<(), SipError> {
            self.requests.lock().unwrap().push(request);
            Ok(())
        }
    }

    async fn hooked_channel() -> (Arc<RecordingSink>, Arc<ProgressMonitor>, Arc<Channel>) {
        let sink = RecordingSink::new();
        let request = SipRequest::parse(
            b"REFER sip:alice@pbx.example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKabc\r\n\
              From: Bob <sip:bob@example.com>;tag=ft\r\n\
              To: Alice <sip:alice@example.com>;tag=tt\r\n\
              Call-ID: hook-test@example.com\r\n\
              CSeq: 2 REFER\r\n\
              Refer-To: <sip:carol@example.com>\r\n\
              Contact: <sip:bob@192.168.1.100:5060>\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        let session = Session::new(
            DialogKey::new("hook-test@example.com", "tt", "ft"),
            "default",
        );
        let monitor = ProgressMonitor::create(&session, &request, sink.clone())
            .await
            .unwrap()
            .unwrap();
        let channel = Channel::new("Local/1000@default-00000001");
        ProgressFrameHook::attach(monitor.clone(), &channel).unwrap();
        (sink, monitor, channel)
    }

    async fn drain(monitor: &Arc<ProgressMonitor>) {
        monitor.serializer().push_synchronous(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_ringing_reports_180_once() {
        let (sink, monitor, channel) = hooked_channel().await;
        channel.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Ringing));
        channel.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Ringing));
        drain(&monitor).await;

        assert_eq!(
            sink.sipfrags(),
            vec!["SIP/2.0 100 Trying\r\n", "SIP/2.0 180 Ringing\r\n"]
        );
    }

    #[tokio::test]
    async fn test_busy_is_terminal_and_detaches() {
        let (sink, monitor, channel) = hooked_channel().await;
        channel.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Busy));
        channel.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Answer));
        drain(&monitor).await;

        assert_eq!(
            sink.sipfrags(),
            vec!["SIP/2.0 100 Trying\r\n", "SIP/2.0 486 Busy Here\r\n"]
        );
    }

    #[tokio::test]
    async fn test_voice_before_signaling_means_answered() {
        let (sink, monitor, channel) = hooked_channel().await;
        channel.feed_frame(FrameDirection::Write, Frame::Voice);
        drain(&monitor).await;

        assert_eq!(
            sink.sipfrags(),
            vec!["SIP/2.0 100 Trying\r\n", "SIP/2.0 200 OK\r\n"]
        );
    }

    #[tokio::test]
    async fn test_voice_after_signaling_is_ignored() {
        let (sink, monitor, channel) = hooked_channel().await;
        channel.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Ringing));
        channel.feed_frame(FrameDirection::Write, Frame::Voice);
        channel.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Answer));
        drain(&monitor).await;

        assert_eq!(
            sink.sipfrags(),
            vec![
                "SIP/2.0 100 Trying\r\n",
                "SIP/2.0 180 Ringing\r\n",
                "SIP/2.0 200 OK\r\n"
            ]
        );
    }

    #[tokio::test]
    async fn test_read_direction_is_ignored() {
        let (sink, monitor, channel) = hooked_channel().await;
        channel.feed_frame(FrameDirection::Read, Frame::Control(ControlSubclass::Ringing));
        channel.feed_frame(FrameDirection::Read, Frame::Voice);
        drain(&monitor).await;

        assert_eq!(sink.sipfrags(), vec!["SIP/2.0 100 Trying\r\n"]);
    }

    #[tokio::test]
    async fn test_channel_destruction_reports_503() {
        let (sink, monitor, channel) = hooked_channel().await;
        channel.feed_frame(FrameDirection::Write, Frame::Control(ControlSubclass::Ringing));
        channel.destroy();
        drain(&monitor).await;

        assert_eq!(
            sink.sipfrags(),
            vec![
                "SIP/2.0 100 Trying\r\n",
                "SIP/2.0 180 Ringing\r\n",
                "SIP/2.0 503 Service Unavailable\r\n"
            ]
        );
    }
}
