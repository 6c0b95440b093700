// vizor-pipeline/src/stream.rs
use futures_core::Stream;
use log::debug;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use vizor_detect::Detection;

use crate::sinks::DetectionSink;

/// Detection sink feeding a bounded channel. Capture threads never block
/// on it: a batch that does not fit is dropped.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<Detection>>,
}

impl DetectionSink for ChannelSink {
    fn publish(&self, detections: Vec<Detection>) {
        match self.tx.try_send(detections) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("detection consumer lagging, batch dropped"),
            Err(TrySendError::Closed(_)) => {} // consumer dropped
        }
    }
}

/// back‑pressure: capture thread → channel → async consumer
pub fn detection_stream(depth: usize) -> (ChannelSink, impl Stream<Item = Vec<Detection>>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (ChannelSink { tx }, ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use vizor_detect::BBox;

    fn batch(n: usize) -> Vec<Detection> {
        (0..n)
            .map(|i| Detection {
                class_id: i,
                label: vizor_detect::class_label(i),
                confidence: 0.9,
                bbox: BBox::default(),
            })
            .collect()
    }

    #[tokio::test]
    async fn full_channel_drops_newest() {
        let (sink, stream) = detection_stream(2);
        sink.publish(batch(1));
        sink.publish(batch(2));
        sink.publish(batch(3));
        drop(sink);
        let got: Vec<usize> = stream.map(|b| b.len()).collect().await;
        assert_eq!(got, vec![1, 2]);
    }
}
