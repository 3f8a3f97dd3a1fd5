mod analyze;
mod record;
mod service;
mod supervisor;
mod table;
mod track;

pub use self::{
    analyze::AnalysisTaskSrv,
    record::RecordTaskSrv,
    service::TaskService,
    supervisor::Supervisor,
    table::{AnalysisRow, DetectionRow},
    track::TrackingTaskSrv,
};
