pub mod activity;
pub mod catalog;
pub mod cube;

pub use activity::{
    Activity, ActivityStatus, BlendPayload, CubeContext, IndexInputs, IndexTarget, MergePayload,
    PosblendPayload, PublishPayload, PublishScene, SceneRef, StageError, StagePayload,
};
pub use cube::{
    BandExpression, CompositeFunction, CubeDescriptor, CycleSchema, MaskDescriptor,
    TemporalSchema, TimeUnit, INTERNAL_BANDS,
};
