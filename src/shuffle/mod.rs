//! Shuffle input path and checkpoint barrier handling.

pub mod barrier;
pub mod buffer;
pub mod channel;
pub mod gate;
pub mod persister;
pub mod registry;
pub mod transport;

pub use barrier::{
    AligningBarrierHandler, BarrierAction, BarrierHandler, CancelCheckpointMarker,
    CheckpointBarrier, CheckpointOptions, TrackingBarrierHandler,
};
pub use buffer::{Buffer, BufferPool, DataType};
pub use channel::{
    BackoffSchedule, BufferAndBacklog, ChannelError, ChannelInfo, InputChannel, PartitionId,
    RecoveringInputChannel, UnknownInputChannel,
};
pub use gate::{GateEvent, InputGate};
pub use persister::{ChannelStatePersister, ChannelStateWriter, PersisterError, PersisterState};
pub use registry::{LocalInputChannel, PartitionRegistry, ResultSubpartitionView};
pub use transport::{
    PartitionRequestClient, RemoteInputChannel, ShuffleFrame, ShuffleTransport, TransportError,
};
