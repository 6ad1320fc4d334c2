pub mod buffer;
mod config;
mod data;
mod record;
mod trigger;

pub use config::{
    validate_mode, SamplerConfiguration, SamplerMode, MAX_TRACKED_ADDRESSES,
    SAMPLER_CONFIGURATION_VERSION,
};
pub use data::{SampleData, SampleNumbering, SampleRow, SampleTable, SampledValue};
pub use trigger::{SamplerTrigger, TriggerCondition};
