//! Frame dispatch: routes decoded frames from a channel's reader thread
//! to whichever subsystem registered for that frame type. In this crate
//! there is exactly one processor per type (PCP handles
//! `CONNECTION_RESPONSE`; `EndpointManager` handles `KEEP_ALIVE` and
//! `DISCONNECTION`; BWU handles `BWU_NEGOTIATION`; `PayloadFrameProcessor`
//! handles `PAYLOAD_TRANSFER`), but the registry invokes every processor
//! registered for a type, not just the first.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::{Frame, FrameType};
use crate::medium::MediumTag;

/// Registered against one or more [`FrameType`]s; invoked once per
/// matching frame read off any endpoint's channel.
pub trait FrameProcessor: Send + Sync + 'static {
    fn process(&self, frame: Frame, endpoint_id: &str, medium_tag: MediumTag);
}

#[derive(Default)]
pub struct FrameProcessorRegistry {
    processors: Mutex<HashMap<FrameType, Vec<Arc<dyn FrameProcessor>>>>,
}

impl FrameProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent per `(frame_type, processor-identity)`.
    pub fn register(&self, frame_type: FrameType, processor: Arc<dyn FrameProcessor>) {
        let mut processors = self.processors.lock();
        let registered = processors.entry(frame_type).or_default();
        if !registered.iter().any(|p| Arc::ptr_eq(p, &processor)) {
            registered.push(processor);
        }
    }

    /// Invokes every processor registered for `frame`'s type.
    pub fn dispatch(&self, frame: Frame, endpoint_id: &str, medium_tag: MediumTag) {
        let frame_type = frame.frame_type();
        let registered = self
            .processors
            .lock()
            .get(&frame_type)
            .cloned()
            .unwrap_or_default();
        for processor in registered {
            processor.process(frame.clone(), endpoint_id, medium_tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ConnectionResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);
    impl FrameProcessor for Counter {
        fn process(&self, _frame: Frame, _endpoint_id: &str, _medium_tag: MediumTag) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_invokes_only_matching_type() {
        let registry = FrameProcessorRegistry::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        registry.register(FrameType::ConnectionResponse, counter.clone());

        registry.dispatch(Frame::KeepAlive { ack: false }, "e1", MediumTag::WifiLan);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        registry.dispatch(
            Frame::ConnectionResponse(ConnectionResponse::accept()),
            "e1",
            MediumTag::WifiLan,
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_is_idempotent_per_identity() {
        let registry = FrameProcessorRegistry::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        registry.register(FrameType::KeepAlive, counter.clone());
        registry.register(FrameType::KeepAlive, counter.clone());

        registry.dispatch(Frame::KeepAlive { ack: false }, "e1", MediumTag::Ble);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
