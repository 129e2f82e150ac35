//! Channel-based processor chain.
//!
//! Connects stages with bounded tokio channels, one task per stage. Every
//! frame a stage emits is also tapped onto the observer bus (read-only;
//! lagged observers drop oldest and the loss is counted as a drop metric by
//! the observer side). The session's cancellation token stops every task on
//! teardown.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use corvid_core::{Frame, FrameProcessor, ProcessorContext};

use corvid_config::constants::queues;

struct StageSlot {
    processor: Arc<dyn FrameProcessor>,
    /// Capacity of this stage's inbound edge.
    capacity: usize,
}

/// A linear chain of frame processors.
pub struct ProcessorChain {
    name: String,
    stages: Vec<StageSlot>,
    observer_capacity: usize,
}

impl ProcessorChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            observer_capacity: queues::OBSERVER_BUS,
        }
    }

    /// Add a stage with the default text-edge capacity.
    pub fn add<P: FrameProcessor>(&mut self, processor: P) -> &mut Self {
        self.add_with_capacity(processor, queues::TEXT_EDGE)
    }

    /// Add a stage whose inbound edge holds `capacity` frames. Audio-path
    /// edges use a small bound so producers block instead of buffering
    /// latency.
    pub fn add_with_capacity<P: FrameProcessor>(
        &mut self,
        processor: P,
        capacity: usize,
    ) -> &mut Self {
        self.stages.push(StageSlot {
            processor: Arc::new(processor),
            capacity,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Spawn the chain. Returns the input sender, the output receiver, and
    /// the observer bus every emitted frame is mirrored onto.
    pub fn run(
        &self,
        context: ProcessorContext,
        cancel: CancellationToken,
    ) -> (
        mpsc::Sender<Frame>,
        mpsc::Receiver<Frame>,
        broadcast::Sender<Frame>,
    ) {
        let (observer_tx, _) = broadcast::channel(self.observer_capacity);

        let first_capacity = self
            .stages
            .first()
            .map(|s| s.capacity)
            .unwrap_or(queues::TEXT_EDGE);
        let (input_tx, mut current_rx) = mpsc::channel::<Frame>(first_capacity);

        if self.stages.is_empty() {
            let (out_tx, out_rx) = mpsc::channel::<Frame>(queues::TEXT_EDGE);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = current_rx.recv() => match frame {
                            Some(frame) => {
                                if out_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
            return (input_tx, out_rx, observer_tx);
        }

        let last_index = self.stages.len() - 1;

        for (i, slot) in self.stages.iter().enumerate() {
            let next_capacity = if i == last_index {
                queues::TEXT_EDGE
            } else {
                self.stages[i + 1].capacity
            };
            let (next_tx, next_rx) = mpsc::channel::<Frame>(next_capacity);

            let processor = Arc::clone(&slot.processor);
            let mut ctx = context.clone();
            let mut rx = std::mem::replace(&mut current_rx, next_rx);
            let observer = observer_tx.clone();
            let cancel = cancel.clone();
            let chain_name = self.name.clone();

            // Wrap the downstream edge so every emitted frame also hits the
            // observer bus. Observers are read-only; a send failure there
            // never blocks the data path.
            let (tapped_tx, mut tapped_rx) = mpsc::channel::<Frame>(next_capacity);
            let forward_observer = observer;
            tokio::spawn(async move {
                while let Some(frame) = tapped_rx.recv().await {
                    let _ = forward_observer.send(frame.clone());
                    if next_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });

            tokio::spawn(async move {
                let stage = processor.name();
                if let Err(e) = processor.on_start(&mut ctx).await {
                    tracing::error!(chain = %chain_name, stage, error = %e, "stage on_start failed");
                }

                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };

                    let is_end = frame.is_end();

                    if let Err(e) = processor.process(frame, &mut ctx, &tapped_tx).await {
                        tracing::error!(chain = %chain_name, stage, error = %e, "stage error");
                        let error_frame = Frame::Error {
                            stage: stage.to_string(),
                            kind: e.kind(),
                            detail: e.to_string(),
                        };
                        if tapped_tx.send(error_frame).await.is_err() {
                            break;
                        }
                    }

                    if is_end {
                        break;
                    }
                }

                if let Err(e) = processor.on_stop(&mut ctx).await {
                    tracing::error!(chain = %chain_name, stage, error = %e, "stage on_stop failed");
                }
                tracing::debug!(chain = %chain_name, stage, "stage task exiting");
            });
        }

        (input_tx, current_rx, observer_tx)
    }
}
