mod error;
mod model;
mod params;

pub use self::{
    error::{Error, Result},
    model::{CctvStream, TaskItem, TaskOutput, TaskState, output_type},
    params::{TaskParamMeta, parse_timestamp, require_param, validate_params},
};
