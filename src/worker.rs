//! Drives one subtask's dedicated thread: reads its input gate, routes
//! barrier/event traffic through the checkpoint machinery, and hands data
//! buffers to the embedding task body.
//!
//! Grounded on `renoir::worker`: the `CatchPanic`-on-drop guard and the
//! `thread_local!` coord cell are kept verbatim in spirit, generalized from
//! a `Block`/`Operator` pair to a [`TaskBody`] driven by an [`InputGate`].

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::ids::SubtaskCoord;
use crate::shuffle::barrier::{BarrierAction, BarrierHandler};
use crate::shuffle::buffer::DataType;
use crate::shuffle::gate::InputGate;

thread_local! {
    /// Coordinates of the subtask the current worker thread is driving.
    /// Populated only inside a spawned task thread.
    static COORD: RefCell<Option<SubtaskCoord>> = const { RefCell::new(None) };
}

pub fn current_subtask() -> Option<SubtaskCoord> {
    COORD.with(|x| *x.borrow())
}

/// Calls its handler on drop unless `defuse`d first — used so a task
/// thread that panics mid-loop still logs the crash exactly once.
struct CatchPanic<F: FnOnce()> {
    primed: bool,
    handler: Option<F>,
}

impl<F: FnOnce()> CatchPanic<F> {
    fn new(handler: F) -> Self {
        Self {
            primed: true,
            handler: Some(handler),
        }
    }

    fn defuse(&mut self) {
        self.primed = false;
    }
}

impl<F: FnOnce()> Drop for CatchPanic<F> {
    fn drop(&mut self) {
        if self.primed {
            (self.handler.take().unwrap())();
        }
    }
}

/// The embedding system's per-subtask logic; record/event processing
/// itself is out of scope here — this is the seam a concrete
/// operator-chain runtime plugs into.
pub trait TaskBody: Send {
    fn on_data(&mut self, channel: crate::shuffle::ChannelInfo, payload: Vec<u8>);
    fn on_snapshot(&mut self, barrier_id: i64);
    fn on_abort(&mut self, barrier_id: i64);
}

/// Spawns the dedicated OS thread for one subtask, named `task-<coord>`
/// (mirroring `renoir::worker::spawn_worker`'s `block-<id>` naming).
/// `total_channels` must match the gate's channel count; it's threaded
/// through to the barrier handler on every barrier event.
pub fn spawn_task(
    coord: SubtaskCoord,
    gate: Arc<InputGate>,
    total_channels: usize,
    mut barrier_handler: Box<dyn BarrierHandler>,
    mut body: Box<dyn TaskBody>,
) -> JoinHandle<()> {
    log::debug!("starting task {coord} ({total_channels} input channels)");

    std::thread::Builder::new()
        .name(format!("task-{coord}"))
        .spawn(move || {
            COORD.with(|x| *x.borrow_mut() = Some(coord));
            do_work(coord, gate, total_channels, barrier_handler.as_mut(), body.as_mut());
        })
        .expect("failed to spawn task thread")
}

fn do_work(
    coord: SubtaskCoord,
    gate: Arc<InputGate>,
    total_channels: usize,
    barrier_handler: &mut dyn BarrierHandler,
    body: &mut dyn TaskBody,
) {
    let mut catch_panic = CatchPanic::new(move || {
        log::error!("task {coord} crashed!");
    });

    loop {
        match gate.get_next() {
            Ok(Some(event)) => {
                let channel_index = event.channel.channel_index as usize;
                match event.data_type {
                    DataType::Data => body.on_data(event.channel, event.payload),
                    DataType::Event | DataType::Priority => {
                        if let Some(barrier_id) = decode_barrier_id(&event.payload) {
                            match barrier_handler.on_barrier(channel_index, total_channels, barrier_id) {
                                BarrierAction::TriggerSnapshot(id) => body.on_snapshot(id),
                                BarrierAction::Abort(id) => body.on_abort(id),
                                BarrierAction::Continue | BarrierAction::Block => {}
                            }
                        }
                    }
                    DataType::EndOfPartition => {
                        if let Some(action) = barrier_handler.on_end_of_partition(channel_index, total_channels) {
                            match action {
                                BarrierAction::TriggerSnapshot(id) => body.on_snapshot(id),
                                BarrierAction::Abort(id) => body.on_abort(id),
                                BarrierAction::Continue | BarrierAction::Block => {}
                            }
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                log::error!("task {coord} failed reading its input gate: {err}");
                break;
            }
        }
    }

    catch_panic.defuse();
    log::info!("task {coord} completed");
}

/// Decodes a barrier id out of an event payload produced by the checkpoint
/// coordinator. The wire format of events besides the barrier frame itself
/// is out of scope; this
/// assumes the minimal 8-byte little-endian encoding the coordinator uses
/// for its own in-band marker.
fn decode_barrier_id(payload: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = payload.get(0..8)?.try_into().ok()?;
    Some(i64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::channel::{BufferAndBacklog, ChannelError, ChannelInfo, InputChannel};
    use crate::shuffle::{AligningBarrierHandler, Buffer};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedChannel {
        info: ChannelInfo,
        queue: VecDeque<BufferAndBacklog>,
        released: bool,
    }

    impl InputChannel for ScriptedChannel {
        fn channel_info(&self) -> ChannelInfo {
            self.info
        }
        fn request_subpartition(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        fn get_next_buffer(&mut self) -> Result<Option<BufferAndBacklog>, ChannelError> {
            Ok(self.queue.pop_front())
        }
        fn send_task_event(&mut self, _event_bytes: Vec<u8>) -> Result<(), ChannelError> {
            Ok(())
        }
        fn resume_consumption(&mut self) {}
        fn release_all_resources(&mut self) {
            self.released = true;
        }
        fn is_released(&self) -> bool {
            self.released
        }
    }

    #[derive(Default)]
    struct RecordingBody {
        data: Mutex<Vec<Vec<u8>>>,
        snapshots: Mutex<Vec<i64>>,
    }

    impl TaskBody for RecordingBody {
        fn on_data(&mut self, _channel: ChannelInfo, payload: Vec<u8>) {
            self.data.lock().unwrap().push(payload);
        }
        fn on_snapshot(&mut self, barrier_id: i64) {
            self.snapshots.lock().unwrap().push(barrier_id);
        }
        fn on_abort(&mut self, _barrier_id: i64) {}
    }

    #[test]
    fn do_work_routes_data_and_drains_on_end_of_partition() {
        let mut queue = VecDeque::new();
        queue.push_back(BufferAndBacklog {
            buffer: Buffer::unpooled(b"hello".to_vec()),
            data_type: DataType::Data,
            buffers_in_backlog: 0,
            sequence_number: 0,
        });
        queue.push_back(BufferAndBacklog {
            buffer: Buffer::unpooled(Vec::new()),
            data_type: DataType::EndOfPartition,
            buffers_in_backlog: 0,
            sequence_number: 1,
        });
        let channel = Box::new(ScriptedChannel {
            info: ChannelInfo { gate_index: 0, channel_index: 0 },
            queue,
            released: false,
        });
        let gate = Arc::new(InputGate::new(0, vec![channel]));
        gate.notify_channel_nonempty(0);

        let mut handler: Box<dyn BarrierHandler> = Box::new(AligningBarrierHandler::new(1));
        let mut body = RecordingBody::default();
        do_work(
            SubtaskCoord { block_id: crate::ids::BlockId(1), subtask_index: 0 },
            gate,
            1,
            handler.as_mut(),
            &mut body,
        );
        assert_eq!(body.data.lock().unwrap().len(), 1);
    }
}
