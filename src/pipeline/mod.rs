pub mod builder;
pub mod sink;
pub mod slot;
pub mod stage;

pub use builder::{
    instantiate, instantiate_description, BuiltPipeline, GpuBackend, InputFormat,
    PipelineBuilder, PipelinePlan, PipelineRequest, SINK_NAME,
};
pub use sink::FrameSink;
pub use slot::{FrameSlot, SlotStats};
pub use stage::{Accepts, MediaContract, Memory, StageDescriptor, StageKind};
